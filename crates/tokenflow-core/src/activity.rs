//! Activity loggers: the side channel for per-step activity entries.
//!
//! Loggers only observe. Nothing they do feeds back into replay state, and
//! a logger that cannot deliver an entry drops it silently.

use tokenflow_types::{Activity, ActivityLevel};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Receives activity entries produced while replaying.
pub trait ActivityLogger: Send + Sync {
    /// Record one activity entry.
    fn log(&self, activity: &Activity);
}

/// Discards every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivityLogger;

impl ActivityLogger for NoopActivityLogger {
    fn log(&self, _activity: &Activity) {}
}

/// Emits each entry as a `tracing` event at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActivityLogger;

impl ActivityLogger for TracingActivityLogger {
    fn log(&self, activity: &Activity) {
        let node = activity.node_id.as_str();
        let tick = activity.tick;
        let kind = activity.kind.as_str();
        match activity.level {
            ActivityLevel::Info => info!(node, tick, kind, "{}", activity.message),
            ActivityLevel::Warn => warn!(node, tick, kind, "{}", activity.message),
            ActivityLevel::Error => error!(node, tick, kind, "{}", activity.message),
        }
    }
}

/// Forwards entries over an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelActivityLogger {
    tx: mpsc::UnboundedSender<Activity>,
}

impl ChannelActivityLogger {
    /// Create a logger and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Activity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ActivityLogger for ChannelActivityLogger {
    fn log(&self, activity: &Activity) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(activity.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::Value;
    use tokenflow_types::NodeId;

    use super::*;

    fn activity(level: ActivityLevel) -> Activity {
        Activity {
            node_id: NodeId::new("n"),
            tick: 3,
            event_id: None,
            level,
            kind: "emit".to_owned(),
            message: "hello".to_owned(),
            data: Value::Null,
        }
    }

    #[tokio::test]
    async fn channel_logger_delivers_in_order() {
        let (logger, mut rx) = ChannelActivityLogger::new();
        logger.log(&activity(ActivityLevel::Info));
        logger.log(&activity(ActivityLevel::Error));
        drop(logger);

        assert_eq!(rx.recv().await.map(|a| a.level), Some(ActivityLevel::Info));
        assert_eq!(rx.recv().await.map(|a| a.level), Some(ActivityLevel::Error));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (logger, rx) = ChannelActivityLogger::new();
        drop(rx);
        logger.log(&activity(ActivityLevel::Warn));
    }

    #[test]
    fn tracing_and_noop_loggers_accept_entries() {
        TracingActivityLogger.log(&activity(ActivityLevel::Warn));
        NoopActivityLogger.log(&activity(ActivityLevel::Info));
    }
}
