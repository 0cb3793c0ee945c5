use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::commands::{Admin, CommandRegistry};

/// Reads commands line by line until end of input or `exit`, writing each
/// reply to `output`. A failing command reports its error and the shell
/// carries on.
pub async fn run<R, W>(
	registry: &CommandRegistry,
	admin: &Admin,
	input: R,
	mut output: W,
	prompt: &str,
) -> std::io::Result<()>
where
	R: AsyncBufRead + Unpin,
	W: AsyncWrite + Unpin,
{
	let mut lines = input.lines();
	output.write_all(prompt.as_bytes()).await?;
	output.flush().await?;

	while let Some(line) = lines.next_line().await? {
		let line = line.trim();
		if matches!(line, "exit" | "quit") {
			break;
		}
		debug!(command = line, "admin command");
		let reply = match registry.execute(admin, line).await {
			Ok(reply) => reply,
			Err(e) => {
				warn!(command = line, error = %e, "admin command failed");
				format!("error: {e}")
			}
		};
		if !reply.is_empty() {
			output.write_all(reply.trim_end().as_bytes()).await?;
			output.write_all(b"\n").await?;
		}
		output.write_all(prompt.as_bytes()).await?;
		output.flush().await?;
	}
	Ok(())
}
