use tracing::Level;
use tracing::Span;
use triomphe::Arc;

use crate::core::Cause;
use crate::core::FiberId;
use crate::core::Never;
use crate::fiber::context::FiberCore;
use crate::fiber::checkpoint;
use crate::raise;

/// Waits for a termination signal and interrupts the main fiber.
///
/// Runs as a root fiber next to the main fiber and is interrupted once the
/// main fiber ends.
pub(crate) async fn task(main: Arc<FiberCore>) -> Result<(), Cause<Never>> {
  let this: FiberId = checkpoint::id();
  let span: Span = tracing::span!(target: "strand", Level::DEBUG, "signal-handler", %this);

  tracing::debug!(target: "strand", parent: &span, main = %main.id, "polling");

  let name: &'static str = terminate().await;

  tracing::info!(target: "strand", parent: &span, "{name} received - interrupting main fiber");

  main.request_interrupt(this);

  Ok(())
}

#[cfg(unix)]
async fn terminate() -> &'static str {
  use tokio::signal::unix;
  use tokio::signal::unix::Signal;
  use tokio::signal::unix::SignalKind;

  let mut sigint: Signal = match unix::signal(SignalKind::interrupt()) {
    Ok(signal) => signal,
    Err(error) => raise!(Error, SysInv, error),
  };

  let mut sigterm: Signal = match unix::signal(SignalKind::terminate()) {
    Ok(signal) => signal,
    Err(error) => raise!(Error, SysInv, error),
  };

  tokio::select! {
    _ = sigint.recv() => "SIGINT",
    _ = sigterm.recv() => "SIGTERM",
  }
}

#[cfg(not(unix))]
async fn terminate() -> &'static str {
  if let Err(error) = tokio::signal::ctrl_c().await {
    raise!(Error, SysInv, error);
  }

  "CTRL-C"
}
