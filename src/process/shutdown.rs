//! Graceful shutdown escalation
//!
//! Stop requests walk a fixed signal ladder: a structured shutdown message
//! over stdin (when the definition opts in), then INT, then TERM at the
//! shutdown timeout T, then KILL at T + T/2, resolving `None` 500 ms after
//! KILL if the child still has not reported an exit. Early exits cancel the
//! remaining stages.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::container::{Container, ExitOutcome};
use super::state::ProcessStatus;

/// Grace period after KILL before the stop resolves `None`
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Run the full escalation. Returns the child's exit code, or `None` when
/// the child had to be killed (or was already gone).
pub async fn graceful_stop(container: &Container) -> Option<i32> {
    let timeout = container.config().kill_timeout();
    let mut exit_rx = container.subscribe_exit();

    if !container.is_running() {
        container.set_status(ProcessStatus::Stopped);
        return current_outcome(&exit_rx).and_then(|o| o.code);
    }

    container.set_status(ProcessStatus::Stopping);

    if container.config().shutdown_message {
        container.send_shutdown_message().await;
    }

    // Stage 1: INT, wait up to T
    signal_container(container, Signal::SIGINT);
    if let Some(outcome) = wait_exit(&mut exit_rx, timeout).await {
        container.set_status(ProcessStatus::Stopped);
        return outcome.code;
    }

    // Stage 2: TERM, wait up to T/2
    debug!("Escalating {} to SIGTERM", container.name());
    signal_container(container, Signal::SIGTERM);
    if let Some(outcome) = wait_exit(&mut exit_rx, timeout / 2).await {
        container.set_status(ProcessStatus::Stopped);
        return outcome.code;
    }

    // Stage 3: KILL, wait the grace period, then give up
    warn!("Escalating {} to SIGKILL", container.name());
    signal_container(container, Signal::SIGKILL);
    let outcome = wait_exit(&mut exit_rx, KILL_GRACE).await;

    container.set_status(ProcessStatus::Stopped);
    outcome.and_then(|o| o.code)
}

/// Skip the escalation and KILL immediately.
pub async fn force_kill(container: &Container) -> Option<i32> {
    let mut exit_rx = container.subscribe_exit();

    if !container.is_running() {
        container.set_status(ProcessStatus::Stopped);
        return current_outcome(&exit_rx).and_then(|o| o.code);
    }

    container.set_status(ProcessStatus::Stopping);
    signal_container(container, Signal::SIGKILL);
    let outcome = wait_exit(&mut exit_rx, KILL_GRACE).await;

    container.set_status(ProcessStatus::Stopped);
    outcome.and_then(|o| o.code)
}

/// Send a signal to the container's PID. "No such process" counts as
/// success; the exit watcher will observe the reaped child shortly.
fn signal_container(container: &Container, signal: Signal) {
    let Some(pid) = container.pid() else {
        return;
    };

    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            debug!("{}: pid {} already gone", container.name(), pid);
        }
        Err(e) => {
            warn!("Failed to signal {} (pid {}): {}", container.name(), pid, e);
        }
    }
}

fn current_outcome(rx: &watch::Receiver<Option<ExitOutcome>>) -> Option<ExitOutcome> {
    *rx.borrow()
}

async fn wait_exit(
    rx: &mut watch::Receiver<Option<ExitOutcome>>,
    timeout: Duration,
) -> Option<ExitOutcome> {
    if let Some(outcome) = *rx.borrow() {
        return Some(outcome);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => {
                if let Some(outcome) = *rx.borrow() {
                    return Some(outcome);
                }
            }
            Ok(Err(_)) => return None,
            Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::definition::ProcessConfig;
    use std::time::Instant;

    fn sh_config(body: &str, kill_timeout: u64) -> ProcessConfig {
        let mut config = ProcessConfig::for_script(body.to_string());
        config.interpreter = Some("sh".into());
        config.interpreter_args = vec!["-c".into()];
        config.kill_timeout = kill_timeout;
        config
    }

    #[tokio::test]
    async fn test_graceful_stop_int_responsive() {
        // sh exits on INT by default
        let container = Container::new(1, "app", 0, sh_config("sleep 30", 5000));
        container.start(None).await.unwrap();

        let begun = Instant::now();
        let code = graceful_stop(&container).await;
        // Resolved well before the TERM stage
        assert!(begun.elapsed() < Duration::from_secs(4));
        assert_eq!(container.status(), ProcessStatus::Stopped);
        assert!(container.pid().is_none());
        // Interrupted children report a signal, not a code
        assert!(code.is_none() || code == Some(0) || code == Some(130));
    }

    #[tokio::test]
    async fn test_kill_escalation_for_stubborn_child() {
        // Trap INT and TERM so only KILL works
        let container = Container::new(1, "stubborn", 0, sh_config("trap '' INT TERM; sleep 30", 200));
        container.start(None).await.unwrap();

        let begun = Instant::now();
        let code = graceful_stop(&container).await;
        let elapsed = begun.elapsed();

        // INT window (200ms) + TERM window (100ms) passed before KILL
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(5));
        assert!(code.is_none());
        assert_eq!(container.status(), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_force_kill() {
        let container = Container::new(1, "app", 0, sh_config("trap '' INT TERM; sleep 30", 5000));
        container.start(None).await.unwrap();

        let begun = Instant::now();
        let code = container.stop(true).await;
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert!(code.is_none());
        assert!(!container.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let container = Container::new(1, "app", 0, sh_config("exit 0", 5000));
        let code = graceful_stop(&container).await;
        assert!(code.is_none());
        assert_eq!(container.status(), ProcessStatus::Stopped);
    }
}
