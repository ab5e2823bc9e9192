//! Structured-logging subscriber.
//!
//! [`LogWriter`] emits one `tracing` line per push message. Useful as a
//! default watcher in demos and tests; production deployments plug their own
//! [`Subscribe`] implementations next to it.

use async_trait::async_trait;

use super::envelope::PushMessage;
use super::subscribe::Subscribe;

/// Logs every push message at info level.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_push(&self, msg: &PushMessage) {
        tracing::info!(
            channel = %msg.channel,
            event = %msg.event,
            seq = msg.seq,
            run = %msg.run_id,
            "push"
        );
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
