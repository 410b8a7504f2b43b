//! Background poller — one independent task per connected account.
//!
//! Accounts do not share mutable per-message state; they share only the
//! read-mostly knowledge index and the ledger's per-order check-and-set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::processor::MessageProcessor;

/// Spawn a background task that runs a processing cycle for `account`
/// every `interval_secs` seconds.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop
/// polling; an in-flight cycle finishes before the task exits.
pub fn spawn_account_poller(
    account: String,
    processor: Arc<MessageProcessor>,
    interval_secs: u64,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            account = %account,
            "Poller started, polling every {interval_secs}s"
        );

        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!(account = %account, "Poller shutting down");
                return;
            }

            // An errored cycle leaves the cursor where it was; the next
            // tick retries the same messages.
            if let Err(e) = processor.process_once(&account).await {
                error!(account = %account, error = %e, "Processing cycle failed");
            }
        }
    });

    (handle, shutdown_flag)
}
