use std::{sync::Arc, time::Duration};

use qos_core::{VerifyOperation, VerifyOperationState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	collaborators::{ActionExecutor, ActionRequest, FailureKind, Namespace, NamespaceError},
	pool_info::PoolInfoMap,
	store::VerifyOperationStore,
	verifier::{FileStatusVerifier, Plan, Verdict},
};

/// What a verification run reports back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TaskOutcome {
	/// The planned action ran.
	Done,
	/// Nothing to do.
	Satisfied,
	Failed { kind: FailureKind, message: String },
	Aborted(String),
	/// Stopped by a cancellation signal before finishing.
	Canceled,
}

impl TaskOutcome {
	pub(crate) fn retryable(message: impl Into<String>) -> Self {
		TaskOutcome::Failed { kind: FailureKind::Retryable, message: message.into() }
	}
}

/// One admitted operation: look the file up, decide, act.
pub(crate) struct VerificationTask {
	pub op: VerifyOperation,
	pub run_id: u64,
	pub store: Arc<VerifyOperationStore>,
	pub pools: Arc<PoolInfoMap>,
	pub namespace: Arc<dyn Namespace>,
	pub executor: Arc<dyn ActionExecutor>,
	pub namespace_timeout: Duration,
	pub action_timeout: Duration,
	pub cancel: CancellationToken,
}

impl VerificationTask {
	pub(crate) async fn run(self) -> TaskOutcome {
		let pnfsid = self.op.pnfsid.clone();

		let lookup = tokio::select! {
			_ = self.cancel.cancelled() => return TaskOutcome::Canceled,
			result = tokio::time::timeout(self.namespace_timeout, self.namespace.file_attributes(&pnfsid)) => result,
		};
		let attributes = match lookup {
			Ok(Ok(attributes)) => attributes,
			Ok(Err(e)) if e.is_retryable() => return TaskOutcome::retryable(e.to_string()),
			Ok(Err(e)) => return TaskOutcome::Aborted(e.to_string()),
			Err(_) => return TaskOutcome::retryable(NamespaceError::Timeout(self.namespace_timeout).to_string()),
		};

		let plan = match FileStatusVerifier::new(&self.pools).verify(&attributes, &self.op) {
			Verdict::Act(plan) => plan,
			Verdict::Satisfied => {
				debug!(%pnfsid, "requirements already met");
				return TaskOutcome::Satisfied;
			}
			Verdict::Missing => return TaskOutcome::Aborted("no replica on disk or tape".into()),
			Verdict::Inaccessible => return TaskOutcome::Aborted("no readable replica and none on tape".into()),
			Verdict::NoTarget(message) => return TaskOutcome::retryable(message),
		};

		if !self.record_plan(&plan).await {
			return TaskOutcome::Canceled;
		}

		let request = ActionRequest {
			pnfsid: pnfsid.clone(),
			action: plan.action,
			source: plan.source,
			target: plan.target,
		};
		debug!(%request, "executing");

		tokio::select! {
			_ = self.cancel.cancelled() => TaskOutcome::Canceled,
			result = tokio::time::timeout(self.action_timeout, self.executor.execute(request, self.cancel.clone())) => match result {
				Ok(Ok(())) => TaskOutcome::Done,
				Ok(Err(e)) => TaskOutcome::Failed { kind: e.kind, message: e.to_string() },
				Err(_) => TaskOutcome::retryable(format!("action timed out after {:?}", self.action_timeout)),
			},
		}
	}

	/// Writes the chosen action and pools onto the operation so they are
	/// visible while it runs and kept for a retry. False if the operation
	/// has been canceled or replaced meanwhile.
	async fn record_plan(&self, plan: &Plan) -> bool {
		let run_id = self.run_id;
		let result = self
			.store
			.update(&self.op.pnfsid, |op| {
				if op.run_id != run_id || op.state != VerifyOperationState::Running {
					return false;
				}
				op.action = Some(plan.action);
				op.source = plan.source.clone();
				op.target = plan.target.clone();
				op.needed = plan.needed;
				true
			})
			.await;

		match result {
			Ok(updated) => updated.is_some(),
			Err(e) => {
				warn!(pnfsid = %self.op.pnfsid, error = %e, "could not persist action");
				true
			}
		}
	}
}
