use std::{collections::BTreeSet, time::Duration};

use clap::error::ErrorKind;
use cli::{shell, Admin, CommandError, CommandRegistry, Inventory};
use qos_core::PnfsId;
use qos_daemon::{VerifierConfig, VerifyError};

const F1: &str = "000000000000000000000001";
const F2: &str = "000000000000000000000002";

const INVENTORY: &str = r#"
[[groups]]
name = "default"
primary = true

[[pools]]
name = "p1"
groups = ["default"]

[[pools]]
name = "p2"
groups = ["default"]

[[pools]]
name = "p3"
groups = ["default"]

[[pools]]
name = "p4"
status = "DOWN"
groups = ["default"]

[[units]]
name = "test:default@osm"
required = 3

[[files]]
pnfsid = "000000000000000000000001"
storage_unit = "test:default@osm"
locations = ["p1"]
persistent = ["p1"]

[[files]]
pnfsid = "000000000000000000000002"
storage_unit = "test:default@osm"
locations = ["p1", "p2"]
persistent = ["p1", "p2"]
"#;

async fn admin_with(config: VerifierConfig) -> Admin {
	let inventory = Inventory::parse(INVENTORY).unwrap();
	Admin::new(config, &inventory).await.unwrap()
}

async fn admin() -> Admin {
	admin_with(VerifierConfig::default()).await
}

/// Sweeps until the table has nothing left to run.
async fn settle(admin: &Admin) {
	for _ in 0..6 {
		admin.manager().sweep().await.unwrap();
		tokio::time::timeout(Duration::from_secs(5), admin.manager().wait_idle()).await.unwrap();
	}
}

async fn run(registry: &CommandRegistry, admin: &Admin, line: &str) -> String {
	registry.execute(admin, line).await.unwrap()
}

#[tokio::test]
async fn verify_brings_files_to_their_replica_count() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let reply = run(&registry, &admin, &format!("verify {F1},{F2}")).await;
	assert!(reply.contains("verification started for 2 files."), "{reply}");

	settle(&admin).await;

	let f1 = admin.cluster.file(&PnfsId::new(F1).unwrap()).unwrap();
	let expected: BTreeSet<String> = ["p1", "p2", "p3"].iter().map(|p| p.to_string()).collect();
	assert_eq!(f1.persistent, expected);

	let reply = run(&registry, &admin, "verify ls --state=DONE --count").await;
	assert_eq!(reply, "2 matching operations.");

	let history = run(&registry, &admin, "verify history").await;
	assert_eq!(history.lines().count(), 3);
	assert!(history.contains(F1));
	assert_eq!(run(&registry, &admin, "verify history errors").await, "no history.");

	let details = run(&registry, &admin, "verify details").await;
	assert!(details.contains("COPY_REPLICA"), "{details}");
}

#[tokio::test]
async fn malformed_pnfsid_is_reported_not_fatal() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let reply = run(&registry, &admin, &format!("verify nothex {F2}")).await;
	assert!(reply.contains("nothex"), "{reply}");
	assert!(reply.contains("verification started for 1 files."), "{reply}");
}

#[tokio::test]
async fn bad_commands_are_refused() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let err = registry.execute(&admin, "verify cancel").await.unwrap_err();
	assert!(matches!(err, CommandError::Verify(VerifyError::EmptyCancelFilter)));

	let err = registry.execute(&admin, "bogus").await.unwrap_err();
	assert!(matches!(err, CommandError::UnknownCommand(_)));

	let err = registry.execute(&admin, "verify ls --lmit=2").await.unwrap_err();
	assert!(matches!(&err, CommandError::Usage(e) if e.kind() == ErrorKind::UnknownArgument));
	assert!(err.to_string().contains("--lmit"), "{err}");

	let err = registry.execute(&admin, "verify ls \"--state=DONE").await.unwrap_err();
	assert!(matches!(err, CommandError::Quoting(_)));

	let err = registry.execute(&admin, "verify reset --maxRunning=0").await.unwrap_err();
	assert!(matches!(err, CommandError::Verify(VerifyError::InvalidSetting(_))));
}

#[tokio::test]
async fn pool_info_filters_by_status_and_name() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let down = run(&registry, &admin, "pool info --status=DOWN").await;
	assert!(down.starts_with("p4"), "{down}");
	assert_eq!(down.lines().count(), 1);

	let named = run(&registry, &admin, "pool info p[12]").await;
	assert_eq!(named.lines().count(), 2);
}

#[tokio::test]
async fn reset_changes_live_settings() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let reply = run(&registry, &admin, "verify reset --maxRunning=7 --retries=3 --sweep=2 --unit=MINUTES").await;
	assert!(reply.contains("maximum concurrent operations 7."), "{reply}");
	assert!(reply.contains("maximum retries on failure 3."), "{reply}");
	assert_eq!(admin.manager().settings().sweep_interval, 120);
}

#[tokio::test]
async fn oversized_sweep_interval_is_refused() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let err = registry
		.execute(&admin, "verify reset --sweep=18446744073709551615 --unit=HOURS")
		.await
		.unwrap_err();
	assert!(matches!(&err, CommandError::InvalidValue { option, .. } if option == "sweep"), "{err}");
	assert_eq!(admin.manager().settings().sweep_interval, VerifierConfig::default().scheduler.sweep_interval);
}

#[tokio::test]
async fn help_describes_commands() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let all = run(&registry, &admin, "help").await;
	assert!(all.contains("verify history"), "{all}");
	let one = run(&registry, &admin, "verify ls --help").await;
	assert!(one.contains("--count"), "{one}");
	assert!(!one.contains("--forceRemoval"), "{one}");
}

#[tokio::test]
async fn pool_down_queues_and_cancel_withdraws() {
	let admin = admin().await;
	let registry = CommandRegistry::default();

	let reply = run(&registry, &admin, "pool status p1 DOWN").await;
	assert!(reply.contains("p1 is now DOWN"), "{reply}");
	assert!(reply.contains("verification started for 2 files."), "{reply}");
	assert_eq!(run(&registry, &admin, "verify ls --parent=p1 --count").await, "2 matching operations.");
	assert_eq!(run(&registry, &admin, "verify ls --parent --count").await, "0 matching operations.");

	let reply = run(&registry, &admin, "pool cancel p1").await;
	assert!(reply.starts_with("canceled 2 operations"), "{reply}");
	assert_eq!(run(&registry, &admin, "verify clear --state=CANCELED").await, "removed 2 operations.");
	assert_eq!(run(&registry, &admin, "verify ls").await, "no matching operations.");
}

#[tokio::test]
async fn statistics_are_recorded_on_request() {
	let dir = tempfile::tempdir().unwrap();
	let mut config = VerifierConfig::default();
	config.counters.statistics_file = Some(dir.path().join("stats.jsonl"));
	let admin = admin_with(config).await;
	let registry = CommandRegistry::default();

	assert_eq!(run(&registry, &admin, "verify stats").await, "no statistics recorded.");
	assert_eq!(run(&registry, &admin, "verify stats --enable").await, "statistics recording enabled.");

	admin.manager().sweep().await.unwrap();
	admin.manager().sweep().await.unwrap();
	let stats = run(&registry, &admin, "verify stats --limit=1").await;
	assert_eq!(stats.lines().count(), 1);
	assert!(stats.contains("sweep"), "{stats}");
}

#[tokio::test]
async fn shell_runs_until_quit() {
	let admin = admin().await;
	let registry = CommandRegistry::default();
	let input = format!("verify {F2}\nverify ls --count\nbogus\nquit\nverify ls\n");
	let mut output = Vec::new();

	shell::run(&registry, &admin, input.as_bytes(), &mut output, "").await.unwrap();

	let output = String::from_utf8(output).unwrap();
	assert!(output.contains("1 matching operations."), "{output}");
	assert!(output.contains("error: unknown command: bogus"), "{output}");
	// Nothing after `quit` runs.
	assert_eq!(output.lines().count(), 3, "{output}");
}
