use std::fmt;

use thiserror::Error;

use crate::collaborators::NamespaceError;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("database error: {0}")]
	DbError(String),

	#[error("{matched} operations match; a limit is required above {threshold} rows")]
	LimitRequired { matched: usize, threshold: usize },
}

#[derive(Debug, Error)]
pub enum VerifyError {
	#[error("improper input: {0}")]
	InvalidInput(String),

	#[error("cannot use an empty filter to cancel operations")]
	EmptyCancelFilter,

	#[error("invalid setting: {0}")]
	InvalidSetting(String),

	#[error(transparent)]
	Store(#[from] StoreError),

	#[error(transparent)]
	Namespace(#[from] NamespaceError),
}

/// One item of a batch that could not be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
	pub pnfsid: String,
	pub reason: String,
}

/// Result of submitting several updates: failures never abort the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
	pub accepted: usize,
	pub failures: Vec<ItemFailure>,
}

impl BatchSummary {
	pub fn fail(&mut self, pnfsid: impl Into<String>, reason: impl fmt::Display) {
		self.failures.push(ItemFailure { pnfsid: pnfsid.into(), reason: reason.to_string() });
	}
}

impl fmt::Display for BatchSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for failure in &self.failures {
			writeln!(f, "{} {}", failure.pnfsid, failure.reason)?;
		}
		writeln!(f, "verification started for {} files.", self.accepted)
	}
}
