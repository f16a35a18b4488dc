//! Cron-restart scheduling
//!
//! Definitions carrying a `cron_restart` expression get a recurring timer
//! that fires a restart at each matching instant. Expressions use standard
//! five-field cron; a seconds field of `0` is prepended when missing.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::Remediator;

/// Cron scheduling errors
#[derive(Debug, Error)]
pub enum CronError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

/// Recurring restart timers keyed by process id
pub struct CronRestartScheduler {
    remediator: Arc<dyn Remediator>,
    entries: DashMap<i64, CancellationToken>,
    shutdown: CancellationToken,
    weak: std::sync::Weak<CronRestartScheduler>,
}

impl CronRestartScheduler {
    pub fn new(remediator: Arc<dyn Remediator>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            remediator,
            entries: DashMap::new(),
            shutdown,
            weak: weak.clone(),
        })
    }

    /// Schedule restarts for a process. Replaces any prior schedule for the
    /// same id.
    pub fn register(&self, id: i64, name: &str, expression: &str) -> Result<(), CronError> {
        let normalized = normalize_cron_expression(expression);
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        self.unregister(id);

        let token = self.shutdown.child_token();
        self.entries.insert(id, token.clone());

        let Some(scheduler) = self.weak.upgrade() else {
            return Ok(());
        };
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    debug!("Cron schedule for {} has no future firings", name);
                    return;
                };
                let wait = match (next - Utc::now()).to_std() {
                    Ok(wait) => wait,
                    Err(_) => continue, // already past, recompute
                };

                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cron restarts stopped for {}", name);
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }

                info!("Cron restart firing for {}", name);
                if let Err(e) = scheduler.remediator.restart_process(id).await {
                    warn!("Cron restart of {} failed: {}", name, e);
                }
            }
        });

        Ok(())
    }

    /// Drop the schedule for a process.
    pub fn unregister(&self, id: i64) {
        if let Some((_, token)) = self.entries.remove(&id) {
            token.cancel();
        }
    }

    /// Whether a process has an active schedule
    pub fn is_registered(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }
}

/// Prepend a seconds field to standard five-field expressions.
fn normalize_cron_expression(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingRemediator {
        restarts: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Remediator for RecordingRemediator {
        fn is_process_running(&self, _id: i64) -> bool {
            true
        }

        async fn restart_process(&self, id: i64) -> Result<(), String> {
            self.restarts.lock().push(id);
            Ok(())
        }
    }

    #[test]
    fn test_normalize_five_field() {
        assert_eq!(normalize_cron_expression("0 3 * * *"), "0 0 3 * * *");
        assert_eq!(normalize_cron_expression("* * * * * *"), "* * * * * *");
    }

    #[test]
    fn test_invalid_expression_rejected() {
        let remediator = Arc::new(RecordingRemediator {
            restarts: Mutex::new(Vec::new()),
        });
        let scheduler = CronRestartScheduler::new(remediator, CancellationToken::new());

        let err = scheduler.register(1, "app", "not a cron").unwrap_err();
        assert!(matches!(err, CronError::InvalidExpression { .. }));
        assert!(!scheduler.is_registered(1));
    }

    #[tokio::test]
    async fn test_every_second_schedule_fires() {
        let remediator = Arc::new(RecordingRemediator {
            restarts: Mutex::new(Vec::new()),
        });
        let scheduler =
            CronRestartScheduler::new(remediator.clone(), CancellationToken::new());

        scheduler.register(7, "app", "* * * * * *").unwrap();
        assert!(scheduler.is_registered(7));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.unregister(7);

        let fired = remediator.restarts.lock().len();
        assert!(fired >= 1, "expected at least one firing, got {}", fired);
        assert!(remediator.restarts.lock().iter().all(|id| *id == 7));
    }

    #[tokio::test]
    async fn test_unregister_stops_firing() {
        let remediator = Arc::new(RecordingRemediator {
            restarts: Mutex::new(Vec::new()),
        });
        let scheduler =
            CronRestartScheduler::new(remediator.clone(), CancellationToken::new());

        scheduler.register(1, "app", "* * * * * *").unwrap();
        scheduler.unregister(1);

        let before = remediator.restarts.lock().len();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let after = remediator.restarts.lock().len();
        assert_eq!(before, after);
    }
}
