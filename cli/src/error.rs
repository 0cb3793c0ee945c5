use std::path::PathBuf;

use qos_core::ParseError;
use qos_daemon::{CountersError, VerifyError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
	#[error("unknown command: {0}")]
	UnknownCommand(String),

	#[error("unbalanced quotes: {0}")]
	Quoting(#[from] shell_words::ParseError),

	#[error("{}", usage_message(.0))]
	Usage(#[from] clap::Error),

	#[error("invalid value for --{option}: {message}")]
	InvalidValue { option: String, message: String },

	#[error(transparent)]
	Parse(#[from] ParseError),

	#[error(transparent)]
	Verify(#[from] VerifyError),

	#[error(transparent)]
	Counters(#[from] CountersError),
}

#[derive(Debug, Error)]
pub enum InventoryError {
	#[error("failed to read {path}: {message}")]
	Read { path: PathBuf, message: String },

	#[error("failed to parse inventory: {0}")]
	Parse(String),

	#[error("{0}")]
	Invalid(String),
}

// The shell adds its own "error: " prefix.
fn usage_message(error: &clap::Error) -> String {
	let text = error.render().to_string();
	text.trim_start_matches("error: ").trim_end().to_string()
}
