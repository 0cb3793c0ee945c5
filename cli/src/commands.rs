//! The admin command surface: a registry from command names to typed
//! handlers. Each handler is a clap parser for the words after its name.

use std::{collections::BTreeMap, fmt::Write as _, marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{error::ErrorKind, CommandFactory, FromArgMatches, Parser, ValueEnum};
use qos_core::{
	parse_timestamp, FieldFilter, PnfsId, PoolInfoFilter, PoolStatus, QoSAction, QoSMessageType, SortOrder,
	VerifyOperationFilter, VerifyOperationState,
};
use qos_daemon::{
	BatchSummary, CancelFilter, CountersError, PoolEvent, VerifierConfig, VerifierContext, VerifyError,
	VerifyOperationManager,
};

use crate::{cluster::SimulatedCluster, error::CommandError, inventory::Inventory};

/// What the admin commands operate on.
pub struct Admin {
	pub context: VerifierContext,
	pub cluster: Arc<SimulatedCluster>,
}

impl Admin {
	/// Builds a verifier against a simulated cluster loaded from `inventory`.
	pub async fn new(config: VerifierConfig, inventory: &Inventory) -> Result<Self, VerifyError> {
		let cluster = Arc::new(SimulatedCluster::new(inventory));
		let context = VerifierContext::init(config, cluster.clone(), cluster.clone()).await?;
		inventory.apply(context.manager.pools());
		Ok(Admin { context, cluster })
	}

	pub fn manager(&self) -> &Arc<VerifyOperationManager> {
		&self.context.manager
	}
}

/// One admin command. The doc comment of the implementing type is its help
/// text; its fields are the options and arguments.
#[async_trait]
pub trait AdminCommand: Parser + Send + Sync + 'static {
	/// One or two words, as typed at the shell.
	const NAME: &'static str;

	async fn run(self, admin: &Admin) -> Result<String, CommandError>;
}

#[async_trait]
trait Handler: Send + Sync {
	fn command(&self) -> clap::Command;
	async fn invoke(&self, admin: &Admin, args: &[String]) -> Result<String, CommandError>;
}

struct Typed<C>(PhantomData<fn() -> C>);

#[async_trait]
impl<C: AdminCommand> Handler for Typed<C> {
	fn command(&self) -> clap::Command {
		C::command().name(C::NAME).no_binary_name(true)
	}

	async fn invoke(&self, admin: &Admin, args: &[String]) -> Result<String, CommandError> {
		let matches = match self.command().try_get_matches_from(args) {
			Ok(matches) => matches,
			Err(e) if e.kind() == ErrorKind::DisplayHelp => return Ok(e.render().to_string()),
			Err(e) => return Err(e.into()),
		};
		C::from_arg_matches(&matches)?.run(admin).await
	}
}

pub struct CommandRegistry {
	commands: BTreeMap<&'static str, Box<dyn Handler>>,
}

impl Default for CommandRegistry {
	fn default() -> Self {
		let mut registry = CommandRegistry::empty();
		registry.register::<Verify>();
		registry.register::<VerifyCancel>();
		registry.register::<VerifyLs>();
		registry.register::<VerifyFailed>();
		registry.register::<VerifyReset>();
		registry.register::<VerifyHistory>();
		registry.register::<VerifyDetails>();
		registry.register::<VerifyStats>();
		registry.register::<VerifyClear>();
		registry.register::<PoolInfoCommand>();
		registry.register::<PoolStatusChange>();
		registry.register::<PoolScan>();
		registry.register::<PoolCancel>();
		registry
	}
}

impl CommandRegistry {
	pub fn empty() -> Self {
		CommandRegistry { commands: BTreeMap::new() }
	}

	pub fn register<C: AdminCommand>(&mut self) {
		self.commands.insert(C::NAME, Box::new(Typed::<C>(PhantomData)));
	}

	/// The longest registered name that prefixes `tokens`, with the rest.
	fn resolve<'a>(&self, tokens: &'a [String]) -> Option<(&dyn Handler, &'a [String])> {
		(1..=tokens.len().min(2)).rev().find_map(|words| {
			let name = tokens[..words].join(" ");
			self.commands
				.get(name.as_str())
				.map(|handler| (handler.as_ref(), &tokens[words..]))
		})
	}

	pub async fn execute(&self, admin: &Admin, line: &str) -> Result<String, CommandError> {
		let tokens = shell_words::split(line)?;
		let Some(first) = tokens.first() else {
			return Ok(String::new());
		};
		if first == "help" {
			return match self.resolve(&tokens[1..]) {
				Some((handler, _)) => Ok(handler.command().render_help().to_string()),
				None => Ok(self.help()),
			};
		}
		let (handler, rest) = self
			.resolve(&tokens)
			.ok_or_else(|| CommandError::UnknownCommand(tokens.join(" ")))?;
		handler.invoke(admin, rest).await
	}

	pub fn help(&self) -> String {
		let mut out = String::new();
		for handler in self.commands.values() {
			let mut command = handler.command();
			let about = command.get_about().map(|about| about.to_string()).unwrap_or_default();
			let usage = command.render_usage().to_string();
			let _ = writeln!(out, "{}\n    {about}", usage.trim_start_matches("Usage: "));
		}
		out
	}
}

/// Absent: no filtering. Bare `--name`: only operations without the field.
fn field(value: Option<Option<String>>) -> FieldFilter {
	match value {
		None => FieldFilter::Any,
		Some(None) => FieldFilter::Unset,
		Some(Some(value)) => FieldFilter::from_value(&value),
	}
}

/// The filter options shared by `verify ls`, `verify cancel` and `verify clear`.
#[derive(Debug, clap::Args)]
struct OperationFilterArgs {
	/// Files to match; comma lists allowed. `*` or nothing means all files.
	pnfsids: Vec<String>,

	#[arg(long = "storageUnit", num_args = 0..=1, require_equals = true)]
	storage_unit: Option<Option<String>>,

	#[arg(long = "poolGroup", num_args = 0..=1, require_equals = true)]
	pool_group: Option<Option<String>>,

	#[arg(long, num_args = 0..=1, require_equals = true)]
	parent: Option<Option<String>>,

	#[arg(long, num_args = 0..=1, require_equals = true)]
	source: Option<Option<String>>,

	#[arg(long, num_args = 0..=1, require_equals = true)]
	target: Option<Option<String>>,

	#[arg(long, value_delimiter = ',')]
	state: Vec<VerifyOperationState>,

	#[arg(long, value_delimiter = ',')]
	action: Vec<QoSAction>,

	#[arg(long = "msgType", value_delimiter = ',')]
	msg_type: Vec<QoSMessageType>,

	/// Only operations retried at least this often.
	#[arg(long)]
	retried: Option<u32>,

	/// yyyy/mm/dd-hh:mm:ss
	#[arg(long = "lastUpdateBefore", value_parser = parse_timestamp)]
	last_update_before: Option<DateTime<Utc>>,

	/// yyyy/mm/dd-hh:mm:ss
	#[arg(long = "lastUpdateAfter", value_parser = parse_timestamp)]
	last_update_after: Option<DateTime<Utc>>,
}

impl OperationFilterArgs {
	fn into_filter(self) -> Result<VerifyOperationFilter, CommandError> {
		let mut filter = VerifyOperationFilter::new()
			.storage_unit(field(self.storage_unit))
			.pool_group(field(self.pool_group))
			.parent(field(self.parent))
			.source(field(self.source))
			.target(field(self.target));
		if !self.state.is_empty() {
			filter = filter.states(self.state);
		}
		if !self.action.is_empty() {
			filter = filter.actions(self.action);
		}
		if !self.msg_type.is_empty() {
			filter = filter.message_types(self.msg_type);
		}
		if let Some(retried) = self.retried {
			filter = filter.retried_at_least(retried);
		}
		if let Some(before) = self.last_update_before {
			filter = filter.last_update_before(before);
		}
		if let Some(after) = self.last_update_after {
			filter = filter.last_update_after(after);
		}

		if self.pnfsids.is_empty() || self.pnfsids == ["*"] {
			return Ok(filter);
		}
		let mut ids = Vec::new();
		for token in &self.pnfsids {
			ids.extend(PnfsId::parse_list(token)?);
		}
		Ok(filter.pnfsids(ids))
	}
}

fn lines<T: ToString>(items: impl IntoIterator<Item = T>, empty: &str) -> String {
	let text = items.into_iter().map(|item| item.to_string()).collect::<Vec<_>>().join("\n");
	if text.is_empty() {
		empty.to_string()
	} else {
		text
	}
}

/// Check the files against their requirements and adjust them if needed.
#[derive(Debug, Parser)]
struct Verify {
	/// Files to verify; comma lists allowed.
	#[arg(required = true)]
	pnfsids: Vec<String>,
}

#[async_trait]
impl AdminCommand for Verify {
	const NAME: &'static str = "verify";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let mut rejected = BatchSummary::default();
		let mut ids = Vec::new();
		for token in self.pnfsids.iter().flat_map(|t| t.split(',')).filter(|t| !t.is_empty()) {
			match PnfsId::new(token) {
				Ok(id) => ids.push(id),
				Err(e) => rejected.fail(token, e),
			}
		}

		let summary = admin.manager().verify(ids).await;
		rejected.accepted = summary.accepted;
		rejected.failures.extend(summary.failures);
		Ok(rejected.to_string())
	}
}

/// Cancel matching operations.
#[derive(Debug, Parser)]
struct VerifyCancel {
	#[command(flatten)]
	filter: OperationFilterArgs,

	/// Also drop waiting operations from the table.
	#[arg(long = "forceRemoval")]
	force_removal: bool,
}

#[async_trait]
impl AdminCommand for VerifyCancel {
	const NAME: &'static str = "verify cancel";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let filter = self.filter.into_filter()?;
		let cancel = CancelFilter::new(filter).force_removal(self.force_removal);
		let report = admin.manager().cancel(cancel).await?;
		Ok(format!("canceled {} operations, removed {}.", report.canceled, report.removed))
	}
}

/// List operations in order of last update.
#[derive(Debug, Parser)]
struct VerifyLs {
	#[command(flatten)]
	filter: OperationFilterArgs,

	/// Only print how many operations match.
	#[arg(long)]
	count: bool,

	#[arg(long)]
	limit: Option<usize>,

	/// ASC or DESC.
	#[arg(long, default_value = "ASC")]
	order: SortOrder,
}

#[async_trait]
impl AdminCommand for VerifyLs {
	const NAME: &'static str = "verify ls";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let filter = self.filter.into_filter()?.order(self.order);
		if self.count {
			return Ok(format!("{} matching operations.", admin.manager().count(&filter)));
		}
		let ops = admin.manager().list(&filter, self.limit)?;
		Ok(lines(ops, "no matching operations."))
	}
}

/// Verify again every file whose last operation ended in error.
#[derive(Debug, Parser)]
struct VerifyFailed {}

#[async_trait]
impl AdminCommand for VerifyFailed {
	const NAME: &'static str = "verify failed";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		Ok(admin.manager().retry_failed().await.to_string())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum TimeUnit {
	Seconds,
	Minutes,
	Hours,
}

impl TimeUnit {
	/// `None` when the interval does not fit in a `u64` of seconds.
	fn duration(self, amount: u64) -> Option<Duration> {
		let seconds = match self {
			TimeUnit::Seconds => Some(amount),
			TimeUnit::Minutes => amount.checked_mul(60),
			TimeUnit::Hours => amount.checked_mul(3600),
		};
		seconds.map(Duration::from_secs)
	}
}

/// Change scheduler settings; with no options, show them.
#[derive(Debug, Parser)]
struct VerifyReset {
	/// Sweep interval, in --unit.
	#[arg(long)]
	sweep: Option<u64>,

	#[arg(long, value_enum, ignore_case = true, requires = "sweep", default_value_t = TimeUnit::Seconds)]
	unit: TimeUnit,

	#[arg(long = "maxRunning")]
	max_running: Option<usize>,

	/// Retries before a failed operation is parked.
	#[arg(long)]
	retries: Option<u32>,
}

#[async_trait]
impl AdminCommand for VerifyReset {
	const NAME: &'static str = "verify reset";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let manager = admin.manager();
		if let Some(amount) = self.sweep {
			let interval = self.unit.duration(amount).ok_or_else(|| CommandError::InvalidValue {
				option: "sweep".to_string(),
				message: format!("{amount} {:?} is out of range", self.unit),
			})?;
			manager.set_sweep_interval(interval)?;
		}
		if let Some(max_running) = self.max_running {
			manager.set_max_running(max_running)?;
		}
		if let Some(retries) = self.retries {
			manager.set_max_retries(retries);
		}
		Ok(manager.info().to_string())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HistoryView {
	Errors,
}

/// Show recently finished operations, optionally only those that ended in error.
#[derive(Debug, Parser)]
struct VerifyHistory {
	#[arg(value_enum)]
	view: Option<HistoryView>,

	#[arg(long)]
	limit: Option<usize>,

	/// ASC or DESC.
	#[arg(long, default_value = "ASC")]
	order: SortOrder,
}

#[async_trait]
impl AdminCommand for VerifyHistory {
	const NAME: &'static str = "verify history";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let errors_only = self.view == Some(HistoryView::Errors);
		let history = admin.manager().history();
		let entries = match self.order {
			SortOrder::Asc => history.ascending(errors_only, self.limit),
			SortOrder::Desc => history.descending(errors_only, self.limit),
		};
		Ok(lines(entries, "no history."))
	}
}

/// Completed and failed counts per action and per pool.
#[derive(Debug, Parser)]
struct VerifyDetails {}

#[async_trait]
impl AdminCommand for VerifyDetails {
	const NAME: &'static str = "verify details";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let counters = admin.manager().counters();
		let mut out = String::new();

		let _ = writeln!(out, "{:<20}{:>12}{:>12}", "ACTION", "COMPLETED", "FAILED");
		for (action, counts) in counters.action_counts() {
			let _ = writeln!(out, "{:<20}{:>12}{:>12}", action.as_str(), counts.completed, counts.failed);
		}
		let _ = writeln!(out, "\n{:<20}{:>12}{:>12}{:>12}", "POOL", "AS SOURCE", "AS TARGET", "FAILED");
		for (pool, counts) in counters.pool_counts() {
			let _ = writeln!(
				out,
				"{:<20}{:>12}{:>12}{:>12}",
				pool, counts.completed_as_source, counts.completed_as_target, counts.failed
			);
		}
		if let Some(sweep) = counters.last_sweep() {
			let _ = writeln!(out, "\nlast {sweep}");
		}
		Ok(out)
	}
}

/// Show recorded sweep statistics, or turn recording to the statistics file on or off.
#[derive(Debug, Parser)]
struct VerifyStats {
	#[arg(long)]
	limit: Option<usize>,

	/// ASC or DESC.
	#[arg(long, default_value = "ASC")]
	order: SortOrder,

	#[arg(long, num_args = 0..=1, require_equals = true, default_missing_value = "true")]
	enable: Option<bool>,
}

#[async_trait]
impl AdminCommand for VerifyStats {
	const NAME: &'static str = "verify stats";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let counters = admin.manager().counters();
		if let Some(enable) = self.enable {
			counters.set_to_file(enable)?;
			return Ok(format!("statistics recording {}.", if enable { "enabled" } else { "disabled" }));
		}
		match counters.read_statistics(self.limit, self.order == SortOrder::Desc) {
			Ok(stats) => Ok(lines(stats, "no statistics recorded.")),
			Err(CountersError::NoStatisticsFile) => Ok(counters
				.last_sweep()
				.map(|sweep| sweep.to_string())
				.unwrap_or_else(|| "no sweep yet.".to_string())),
			Err(e) => Err(e.into()),
		}
	}
}

/// Remove finished operations from the table.
#[derive(Debug, Parser)]
struct VerifyClear {
	#[command(flatten)]
	filter: OperationFilterArgs,
}

#[async_trait]
impl AdminCommand for VerifyClear {
	const NAME: &'static str = "verify clear";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let removed = admin.manager().clear(self.filter.into_filter()?).await?;
		Ok(format!("removed {removed} operations."))
	}
}

/// Show what the verifier knows about pools.
#[derive(Debug, Parser)]
struct PoolInfoCommand {
	/// Pool names, as a regular expression.
	pattern: Option<String>,

	#[arg(long, value_delimiter = ',')]
	status: Vec<PoolStatus>,

	/// yyyy/mm/dd-hh:mm:ss
	#[arg(long = "lastUpdateBefore", value_parser = parse_timestamp)]
	last_update_before: Option<DateTime<Utc>>,

	/// yyyy/mm/dd-hh:mm:ss
	#[arg(long = "lastUpdateAfter", value_parser = parse_timestamp)]
	last_update_after: Option<DateTime<Utc>>,
}

#[async_trait]
impl AdminCommand for PoolInfoCommand {
	const NAME: &'static str = "pool info";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let mut filter = PoolInfoFilter::new();
		if let Some(pattern) = &self.pattern {
			filter = filter.pools(pattern)?;
		}
		if !self.status.is_empty() {
			filter = filter.statuses(self.status);
		}
		if let Some(before) = self.last_update_before {
			filter = filter.last_update_before(before);
		}
		if let Some(after) = self.last_update_after {
			filter = filter.last_update_after(after);
		}
		Ok(lines(admin.manager().pools().list(&filter), "no matching pools."))
	}
}

/// Change a pool's status and verify the files it holds.
#[derive(Debug, Parser)]
struct PoolStatusChange {
	pool: String,

	/// DOWN, READ_ONLY, ENABLED or UNINITIALIZED.
	status: PoolStatus,
}

#[async_trait]
impl AdminCommand for PoolStatusChange {
	const NAME: &'static str = "pool status";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let PoolStatusChange { pool, status } = self;
		admin.cluster.set_status(&pool, status);
		let files = admin.cluster.files_on(&pool);
		let report = admin
			.context
			.pool_status
			.handle(PoolEvent::StatusScan { pool: pool.clone(), status, files })
			.await?;
		Ok(format!("{pool} is now {status}.\n{}", report.queued))
	}
}

/// Verify every file with a replica on the pool.
#[derive(Debug, Parser)]
struct PoolScan {
	pool: String,
}

#[async_trait]
impl AdminCommand for PoolScan {
	const NAME: &'static str = "pool scan";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let files = admin.cluster.files_on(&self.pool);
		let event = PoolEvent::SystemScan { pool: self.pool, files };
		let report = admin.context.pool_status.handle(event).await?;
		Ok(report.queued.to_string())
	}
}

/// Cancel the operations queued by a scan of the pool.
#[derive(Debug, Parser)]
struct PoolCancel {
	pool: String,
}

#[async_trait]
impl AdminCommand for PoolCancel {
	const NAME: &'static str = "pool cancel";

	async fn run(self, admin: &Admin) -> Result<String, CommandError> {
		let report = admin.context.pool_status.handle(PoolEvent::ScanCanceled { pool: self.pool }).await?;
		Ok(format!("canceled {} operations, removed {}.", report.canceled.canceled, report.canceled.removed))
	}
}
