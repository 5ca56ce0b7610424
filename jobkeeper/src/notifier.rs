use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Signals sent to a running poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeMessage {
    /// A job became due at the given time; process no later than that.
    At(DateTime<Utc>),
    /// A running job released its slot; process now if the last cycle left ready jobs behind.
    IfBacklogged,
}

pub(crate) trait Notify: Send + Sync {
    fn notify(&self, message: WakeMessage);
}

impl Notify for mpsc::UnboundedSender<WakeMessage> {
    fn notify(&self, message: WakeMessage) {
        if let Err(err) = self.send(message) {
            // Expected once the poll loop has shut down.
            tracing::trace!(?err, "Failed to send executor wake message");
        }
    }
}
