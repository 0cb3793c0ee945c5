//! Contracts for the external systems the verifier depends on: the
//! namespace (file attributes) and the executor of corrective actions.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use qos_core::{FileAttributes, PnfsId, QoSAction};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum NamespaceError {
	#[error("file not found: {0}")]
	NotFound(PnfsId),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("namespace unavailable: {0}")]
	Unavailable(String),

	#[error("namespace lookup timed out after {0:?}")]
	Timeout(Duration),
}

impl NamespaceError {
	/// Whether a later attempt could succeed; otherwise the operation aborts.
	pub fn is_retryable(&self) -> bool {
		matches!(self, NamespaceError::Unavailable(_) | NamespaceError::Timeout(_))
	}
}

#[async_trait]
pub trait Namespace: Send + Sync {
	async fn file_attributes(&self, pnfsid: &PnfsId) -> Result<FileAttributes, NamespaceError>;
}

/// How a failed action should be treated on the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
	/// Try again with the same pools.
	Retryable,
	/// The source pool is at fault; pick another.
	NewSource,
	/// The target pool is at fault; pick another.
	NewTarget,
	/// Retrying cannot help.
	Fatal,
}

impl fmt::Display for FailureKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			FailureKind::Retryable => "RETRIABLE",
			FailureKind::NewSource => "NEWSOURCE",
			FailureKind::NewTarget => "NEWTARGET",
			FailureKind::Fatal => "FATAL",
		})
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ActionError {
	pub kind: FailureKind,
	pub message: String,
}

impl ActionError {
	pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
		ActionError { kind, message: message.into() }
	}

	pub fn retryable(message: impl Into<String>) -> Self {
		Self::new(FailureKind::Retryable, message)
	}

	pub fn new_source(message: impl Into<String>) -> Self {
		Self::new(FailureKind::NewSource, message)
	}

	pub fn new_target(message: impl Into<String>) -> Self {
		Self::new(FailureKind::NewTarget, message)
	}

	pub fn fatal(message: impl Into<String>) -> Self {
		Self::new(FailureKind::Fatal, message)
	}

	pub fn is_retryable(&self) -> bool {
		self.kind != FailureKind::Fatal
	}
}

/// A corrective action as handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
	pub pnfsid: PnfsId,
	pub action: QoSAction,
	pub source: Option<String>,
	pub target: Option<String>,
}

impl fmt::Display for ActionRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} {} (source {}, target {})",
			self.pnfsid,
			self.action,
			self.source.as_deref().unwrap_or("-"),
			self.target.as_deref().unwrap_or("-"),
		)
	}
}

/// Performs copy, cache, persist, flush and stage actions on the pools.
///
/// Implementations should return promptly once `cancel` fires; the
/// verifier also stops awaiting them at that point.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
	async fn execute(&self, request: ActionRequest, cancel: CancellationToken) -> Result<(), ActionError>;
}
