//! Bus-to-database event persistence
//!
//! Subscribes to the wildcard tap and records lifecycle emissions through
//! the event repository so historical queries reflect bus traffic. Metric
//! and log topics are excluded; those have their own stores.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::database::{Database, EventRepository};

use super::bus::{EventBus, EventEnvelope};

/// Topics that are persisted as process event records
const RECORDED_TOPICS: &[&str] = &[
    "process:start",
    "process:stop",
    "process:restart",
    "process:exit",
    "process:crash",
    "process:error",
    "health:fail",
    "health:restore",
];

/// Spawn the recorder task. Runs until the shutdown token fires.
pub fn spawn_recorder(bus: &EventBus, db: Arc<Database>, shutdown: CancellationToken) {
    let mut rx = bus.watch_all();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Event recorder stopped");
                    return;
                }
                result = rx.recv() => {
                    match result {
                        Ok(envelope) => record(&db, envelope).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Event recorder lagged, {} envelopes dropped", missed);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    });
}

async fn record(db: &Database, envelope: EventEnvelope) {
    if !RECORDED_TOPICS.contains(&envelope.event_type.as_str()) {
        return;
    }

    let process_id = envelope.data["processId"].as_i64().unwrap_or(0);
    let process_name = envelope.data["processName"]
        .as_str()
        .unwrap_or_default()
        .to_string();

    let kind = match envelope.event_type.as_str() {
        "health:fail" => "health-check-fail",
        "health:restore" => "health-check-restore",
        other => other.trim_start_matches("process:"),
    };

    if let Err(e) = db
        .insert_event(process_id, &process_name, kind, Some(envelope.data.clone()))
        .await
    {
        warn!("Failed to persist {} event: {}", envelope.event_type, e);
    }
}
