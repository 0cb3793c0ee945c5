use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Globally unique file identifier in the namespace.
///
/// Accepts the legacy 24 hex digit form and the current 36 hex digit form.
/// Stored upper-cased so that ids compare equal regardless of input case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PnfsId(String);

impl PnfsId {
	pub fn new(id: &str) -> Result<Self, ParseError> {
		let id = id.trim();
		let valid_len = id.len() == 24 || id.len() == 36;
		if !valid_len || !id.chars().all(|c| c.is_ascii_hexdigit()) {
			return Err(ParseError::InvalidPnfsId(id.to_string()));
		}
		Ok(PnfsId(id.to_ascii_uppercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Parses a comma-delimited list, as typed at the admin shell.
	pub fn parse_list(list: &str) -> Result<Vec<PnfsId>, ParseError> {
		list.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(PnfsId::new)
			.collect()
	}
}

impl fmt::Display for PnfsId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for PnfsId {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		PnfsId::new(s)
	}
}

impl TryFrom<String> for PnfsId {
	type Error = ParseError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		PnfsId::new(&value)
	}
}

impl From<PnfsId> for String {
	fn from(id: PnfsId) -> Self {
		id.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accepts_both_id_lengths() {
		assert!(PnfsId::new("000000000000000000000000").is_ok());
		assert!(PnfsId::new("0000A1B2C3D4E5F60718293A4B5C6D7E8F90").is_ok());
	}

	#[test]
	fn normalizes_case() {
		let lower = PnfsId::new("0000a1b2c3d4e5f60718293a4b5c6d7e8f90").unwrap();
		let upper = PnfsId::new("0000A1B2C3D4E5F60718293A4B5C6D7E8F90").unwrap();
		assert_eq!(lower, upper);
	}

	#[test]
	fn rejects_malformed_ids() {
		assert!(PnfsId::new("").is_err());
		assert!(PnfsId::new("xyz").is_err());
		assert!(PnfsId::new("00000000000000000000000G").is_err());
		assert!(PnfsId::new("0000000000000000000000000").is_err());
	}

	#[test]
	fn parses_comma_list() {
		let ids = PnfsId::parse_list("000000000000000000000001, 000000000000000000000002,").unwrap();
		assert_eq!(ids.len(), 2);
		assert_eq!(ids[1].as_str(), "000000000000000000000002");
	}

	#[test]
	fn list_with_bad_entry_fails() {
		let err = PnfsId::parse_list("000000000000000000000001,bogus").unwrap_err();
		assert_eq!(err, ParseError::InvalidPnfsId("bogus".into()));
	}
}
