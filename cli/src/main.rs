use std::{
	io::IsTerminal,
	path::{Path, PathBuf},
};

use anyhow::Context;
use clap::Parser;
use cli::{shell, Admin, CommandRegistry, Inventory};
use qos_daemon::VerifierConfig;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// QoS verifier with an admin shell over a simulated cluster.
#[derive(Debug, Parser)]
#[command(name = "qos")]
struct Cli {
	/// Verifier configuration (TOML). Defaults to qos/verifier.toml in the
	/// user config directory when present.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Cluster inventory (TOML). Defaults to qos/inventory.toml in the user
	/// config directory when present.
	#[arg(long)]
	inventory: Option<PathBuf>,

	/// Log filter, overridden by RUST_LOG.
	#[arg(long, default_value = "info")]
	log_level: String,

	/// Write qos.log into this directory instead of logging to stderr.
	#[arg(long)]
	log_file: Option<PathBuf>,

	/// Run one command and exit.
	#[arg(long)]
	exec: Option<String>,
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
	let filter = EnvFilter::try_from_default_env()
		.or_else(|_| EnvFilter::try_new(&cli.log_level))
		.context("invalid log filter")?;

	let (file_layer, stderr_layer) = match &cli.log_file {
		Some(dir) => {
			std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
			let appender = tracing_appender::rolling::never(dir, "qos.log");
			(Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(appender)), None)
		}
		None => (None, Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))),
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(file_layer)
		.with(stderr_layer)
		.init();
	Ok(())
}

/// The explicit path, else `name` under the user config directory if it exists.
fn locate(explicit: Option<&Path>, name: &str) -> Option<PathBuf> {
	explicit.map(Path::to_path_buf).or_else(|| {
		dirs::config_dir()
			.map(|dir| dir.join("qos").join(name))
			.filter(|path| path.exists())
	})
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_logging(&cli)?;

	let config = match locate(cli.config.as_deref(), "verifier.toml") {
		Some(path) => VerifierConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
		None => VerifierConfig::default(),
	};
	let inventory = match locate(cli.inventory.as_deref(), "inventory.toml") {
		Some(path) => Inventory::load(&path).with_context(|| format!("loading {}", path.display()))?,
		None => Inventory::default(),
	};

	let admin = Admin::new(config, &inventory).await.context("failed to start the verifier")?;
	let registry = CommandRegistry::default();
	admin.context.start();
	info!(pools = inventory.pools.len(), files = inventory.files.len(), "verifier running");

	let outcome = match &cli.exec {
		Some(line) => registry.execute(&admin, line).await.map(|reply| println!("{reply}")).map_err(anyhow::Error::from),
		None => {
			let prompt = if std::io::stdin().is_terminal() { "qos> " } else { "" };
			let input = BufReader::new(tokio::io::stdin());
			shell::run(&registry, &admin, input, tokio::io::stdout(), prompt)
				.await
				.context("admin shell failed")
		}
	};

	admin.context.shutdown().await;
	outcome
}
