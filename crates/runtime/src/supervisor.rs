//! Supervised process runner
//!
//! Runs a child to completion while two reader tasks drain stdout and
//! stderr and a watchdog task kills the child once it stops producing
//! output. Used for dependency installation, but nothing here is specific
//! to it.

use crate::activity::{ActivityClock, CapturedOutput};
use crate::error::{Result, RuntimeError};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 1024;

/// Floor for polling periods; `tokio::time::interval` panics on zero.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Supervision limits
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Hard ceiling on total run time
    pub overall_timeout: Duration,

    /// Kill the child after this long without output
    pub idle_timeout: Duration,

    /// Watchdog polling period
    pub poll_interval: Duration,

    /// Cap on captured stderr (tail is kept)
    pub max_captured_bytes: usize,

    /// How long to wait for readers once the child is gone
    pub drain_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            max_captured_bytes: 64 * 1024,
            drain_grace: Duration::from_secs(2),
        }
    }
}

/// Result of a run that exited successfully
#[derive(Debug)]
pub struct SupervisedRun {
    pub status: ExitStatus,
    pub elapsed: Duration,
    /// Captured stderr
    pub output: String,
}

#[derive(Debug)]
enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Idle(Duration),
    WatchdogLost(String),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run `command` under supervision.
    pub async fn run(&self, command: Command, label: &str) -> Result<SupervisedRun> {
        let capture = Arc::new(CapturedOutput::new(self.config.max_captured_bytes));
        self.run_capturing(command, label, capture).await
    }

    /// Like [`Supervisor::run`], capturing stderr into a caller-owned buffer.
    ///
    /// Every task spawned for the run has finished by the time this returns,
    /// so `capture` is no longer written to afterwards.
    pub async fn run_capturing(
        &self,
        mut command: Command,
        label: &str,
        capture: Arc<CapturedOutput>,
    ) -> Result<SupervisedRun> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let deadline = started + self.config.overall_timeout;

        let mut child = command.spawn().map_err(|source| RuntimeError::ProcessStart {
            command: label.to_string(),
            source,
        })?;
        info!("{} started (pid {:?})", label, child.id());

        let label_arc: Arc<str> = Arc::from(label);
        let clock = Arc::new(ActivityClock::new());
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(
                stdout,
                Stream::Stdout,
                label_arc.clone(),
                clock.clone(),
                capture.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(
                stderr,
                Stream::Stderr,
                label_arc.clone(),
                clock.clone(),
                capture.clone(),
            )));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        let mut watchdog = tokio::spawn(watch_idle(
            clock.clone(),
            self.config.idle_timeout,
            self.config.poll_interval,
            exited_rx,
        ));
        let mut watchdog_joined = false;

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Ending::TimedOut,
            watched = &mut watchdog => {
                watchdog_joined = true;
                match watched {
                    Ok(Some(idle)) => Ending::Idle(idle),
                    Ok(None) => Ending::WatchdogLost("stopped while the child ran".to_string()),
                    Err(e) => Ending::WatchdogLost(e.to_string()),
                }
            }
        };

        match &ending {
            Ending::TimedOut => {
                warn!("{} exceeded {:?}, killing", label, self.config.overall_timeout);
                terminate(&mut child, label).await;
            }
            Ending::Idle(idle) => {
                warn!("{} silent for {:?}, killing", label, idle);
                terminate(&mut child, label).await;
            }
            Ending::WatchdogLost(reason) => {
                warn!("{} watchdog failed ({}), killing", label, reason);
                terminate(&mut child, label).await;
            }
            Ending::Exited(_) => {}
        }

        // Join barrier: watchdog first, then both readers.
        let _ = exited_tx.send(true);
        if !watchdog_joined {
            if let Err(e) = watchdog.await {
                warn!("{} watchdog ended abnormally: {}", label, e);
            }
        }
        join_readers(readers, self.config.drain_grace, label).await;

        // Cleanup kill; a no-op once the child has been reaped.
        terminate(&mut child, label).await;

        if let Ending::Idle(idle) = &ending {
            capture.append(
                format!("\n{} killed after {}s without output", label, idle.as_secs()).as_bytes(),
            );
        }

        let elapsed = started.elapsed();
        let label = label.to_string();
        match ending {
            Ending::Exited(Ok(status)) if status.success() => {
                info!("{} finished in {:?}", label, elapsed);
                Ok(SupervisedRun {
                    status,
                    elapsed,
                    output: capture.text(),
                })
            }
            Ending::Exited(Ok(status)) => Err(RuntimeError::ProcessFailed {
                label,
                status: status.to_string(),
                output: capture.text(),
            }),
            Ending::Exited(Err(e)) => Err(RuntimeError::ProcessFailed {
                label,
                status: format!("wait failed: {e}"),
                output: capture.text(),
            }),
            Ending::TimedOut => Err(RuntimeError::Timeout {
                label,
                after: self.config.overall_timeout,
                output: capture.text(),
            }),
            Ending::Idle(idle) => Err(RuntimeError::IdleTimeout {
                label,
                idle,
                output: capture.text(),
            }),
            Ending::WatchdogLost(reason) => Err(RuntimeError::ProcessFailed {
                label,
                status: format!("watchdog failed: {reason}"),
                output: capture.text(),
            }),
        }
    }
}

/// Interval ticking every `period`, never faster than [`MIN_TICK`].
pub(crate) fn ticker(period: Duration) -> Interval {
    tokio::time::interval(period.max(MIN_TICK))
}

/// Kill and reap `child`. Safe to call repeatedly.
pub async fn terminate(child: &mut Child, label: &str) {
    if let Err(e) = child.start_kill() {
        // already exited and reaped
        debug!("{} kill skipped: {}", label, e);
    }
    if let Err(e) = child.wait().await {
        debug!("{} reap failed: {}", label, e);
    }
}

async fn drain<R>(
    mut reader: R,
    stream: Stream,
    label: Arc<str>,
    clock: Arc<ActivityClock>,
    capture: Arc<CapturedOutput>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                clock.touch();
                match stream {
                    Stream::Stdout => {
                        info!("{} - {}", label, String::from_utf8_lossy(&buf[..n]).trim_end())
                    }
                    Stream::Stderr => capture.append(&buf[..n]),
                }
            }
            Err(e) => {
                debug!("{} {:?} read error: {}", label, stream, e);
                break;
            }
        }
    }
}

async fn watch_idle(
    clock: Arc<ActivityClock>,
    idle_timeout: Duration,
    poll_interval: Duration,
    mut exited: watch::Receiver<bool>,
) -> Option<Duration> {
    let mut ticker = ticker(poll_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = exited.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }

        if *exited.borrow() {
            return None;
        }

        let idle = clock.idle_for();
        if idle > idle_timeout {
            return Some(idle);
        }
    }
}

async fn join_readers(readers: Vec<JoinHandle<()>>, grace: Duration, label: &str) {
    let deadline = Instant::now() + grace;
    for mut reader in readers {
        if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
            // a grandchild still holds the pipe open
            warn!("{} output reader still blocked after {:?}, aborting", label, grace);
            reader.abort();
            let _ = reader.await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            overall_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            max_captured_bytes: 4096,
            drain_grace: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_success_returns_stderr() {
        let supervisor = Supervisor::new(fast_config());
        let run = supervisor
            .run(sh("echo collecting; echo 'warning: pinned' >&2"), "install")
            .await
            .unwrap();

        assert!(run.status.success());
        assert!(run.output.contains("warning: pinned"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_process_failed() {
        let supervisor = Supervisor::new(fast_config());
        let err = supervisor
            .run(sh("echo 'No matching distribution' >&2; exit 3"), "install")
            .await
            .unwrap_err();

        match err {
            RuntimeError::ProcessFailed { status, output, .. } => {
                assert!(status.contains('3'));
                assert!(output.contains("No matching distribution"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_process_start() {
        let supervisor = Supervisor::new(fast_config());
        let err = supervisor
            .run(Command::new("/nonexistent/pip"), "install")
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::ProcessStart { .. }));
    }

    #[tokio::test]
    async fn test_terminate_twice_is_noop() {
        let mut child = sh("exit 0").spawn().unwrap();
        child.wait().await.unwrap();
        terminate(&mut child, "done").await;
        terminate(&mut child, "done").await;
    }

    #[tokio::test]
    async fn test_ticker_floor() {
        assert_eq!(ticker(Duration::ZERO).period(), MIN_TICK);
        assert_eq!(ticker(Duration::from_secs(5)).period(), Duration::from_secs(5));
    }
}
