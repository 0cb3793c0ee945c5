use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
	#[error("invalid pnfsid: {0}")]
	InvalidPnfsId(String),

	#[error("unknown {kind}: {value}")]
	UnknownVariant { kind: &'static str, value: String },

	#[error("invalid timestamp (expected yyyy/MM/dd-HH:mm:ss): {0}")]
	InvalidTimestamp(String),

	#[error("invalid pool name pattern: {0}")]
	InvalidPattern(String),
}
