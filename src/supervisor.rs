//! Helper-process supervision.
//!
//! Upstream entries may own a local helper process (the thing actually
//! listening on the upstream port). The supervisor launches it, captures
//! its output, restarts it when it dies, probes its TCP port, and makes
//! sure it does not outlive the proxy.
//!
//! On Windows a Job Object with the kill-on-close limit owns the child,
//! so closing the handle terminates the whole process tree. Elsewhere the
//! guarantee is weaker: kill-on-drop for the child itself plus a SIGTERM
//! on the graceful path.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use n0_error::e;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::FutureExt;
use tracing::{debug, error, info, warn};

use crate::config::{HealthCheckConfig, ProcessConfig};
use crate::error::SupervisorError;

#[cfg(windows)]
mod job;

/// How often the crash monitor polls the child.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long `stop` waits for monitor tasks to wind down.
const MONITOR_STOP_WAIT: Duration = Duration::from_secs(2);
/// How long the polite termination path may take before escalating.
const POLITE_STOP_WAIT: Duration = Duration::from_secs(5);
/// How long the kill path may take.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Supervises one helper process.
pub struct Supervisor {
    inner: Arc<Shared>,
}

struct Shared {
    name: String,
    process: ProcessConfig,
    health: Option<HealthCheckConfig>,
    /// Host and port probed by the health monitor (the owning upstream's
    /// endpoint).
    probe: Option<(String, u16)>,
    child: Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopping: AtomicBool,
    cancel: CancellationToken,
    restart_attempts: AtomicU32,
    #[cfg(windows)]
    job: std::sync::Mutex<Option<job::JobHandle>>,
}

impl Supervisor {
    /// Creates a supervisor for one process; nothing is spawned until
    /// [`start`](Self::start).
    pub fn new(
        name: impl Into<String>,
        process: ProcessConfig,
        health: Option<HealthCheckConfig>,
        probe: Option<(String, u16)>,
    ) -> Self {
        #[cfg(windows)]
        let job = match job::JobHandle::new() {
            Ok(job) => Some(job),
            Err(err) => {
                warn!("failed to create job object: {err:#}");
                None
            }
        };
        Self {
            inner: Arc::new(Shared {
                name: name.into(),
                process,
                health,
                probe,
                child: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                stopping: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                restart_attempts: AtomicU32::new(0),
                #[cfg(windows)]
                job: std::sync::Mutex::new(job),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Crash-restart attempts consumed so far. Health-check restarts do
    /// not count against this.
    pub fn restart_attempts(&self) -> u32 {
        self.inner.restart_attempts.load(Ordering::SeqCst)
    }

    /// OS pid of the current child, if one is running.
    pub async fn child_id(&self) -> Option<u32> {
        self.inner.child.lock().await.as_ref().and_then(|c| c.id())
    }

    /// Launches the process and starts the crash and health monitors.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        {
            let mut slot = self.inner.child.lock().await;
            launch(&self.inner, &mut slot).await?;
        }

        let mut tasks = self.inner.tasks.lock().await;
        if self.inner.process.auto_restart {
            tasks.push(tokio::spawn(crash_monitor(self.inner.clone())));
        }
        if let (Some(health), Some((host, port))) = (&self.inner.health, &self.inner.probe) {
            if health.enabled && !host.is_empty() {
                tasks.push(tokio::spawn(health_monitor(
                    self.inner.clone(),
                    host.clone(),
                    *port,
                    health.clone(),
                )));
            }
        }
        Ok(())
    }

    /// Stops the monitors and the child.
    ///
    /// Sets `stopping` before cancelling the monitors so a dying child is
    /// not mistaken for a crash, waits briefly for the tasks, terminates
    /// the child politely, escalates to a kill, and releases the job
    /// handle last.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let tasks: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().await;
            tasks.drain(..).collect()
        };
        for mut task in tasks {
            if (&mut task).timeout(MONITOR_STOP_WAIT).await.is_err() {
                debug!(name = %self.inner.name, "monitor task ignored cancellation, aborting");
                task.abort();
            }
        }

        let mut slot = self.inner.child.lock().await;
        if let Some(mut child) = slot.take() {
            if child.try_wait().ok().flatten().is_none() {
                polite_terminate(&self.inner.name, &child);
                if child.wait().timeout(POLITE_STOP_WAIT).await.is_err() {
                    warn!(name = %self.inner.name, "helper ignored the polite stop, killing");
                    child.start_kill().ok();
                    let _ = child.wait().timeout(KILL_WAIT).await;
                }
            }
            info!(name = %self.inner.name, "helper process stopped");
        }
        drop(slot);

        #[cfg(windows)]
        {
            // Closing the job handle kills anything still in the job,
            // descendants included.
            if let Ok(mut guard) = self.inner.job.lock() {
                guard.take();
            }
        }
    }
}

/// Spawns the configured process into `slot` and waits out the startup
/// delay. The caller holds the child lock.
async fn launch(shared: &Shared, slot: &mut Option<Child>) -> Result<(), SupervisorError> {
    let file_name = expand_env_vars(&shared.process.file_name);
    if file_name.trim().is_empty() {
        return Err(e!(SupervisorError::MissingExecutable {
            name: shared.name.clone(),
        }));
    }

    let mut command = Command::new(&file_name);
    let arguments = expand_env_vars(&shared.process.arguments);
    command.args(arguments.split_whitespace());
    let working_directory = expand_env_vars(&shared.process.working_directory);
    if !working_directory.trim().is_empty() {
        command.current_dir(working_directory);
    }
    command.stdin(Stdio::null());
    if shared.process.redirect_output {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }
    command.kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);

    let mut child = command.spawn().map_err(|source| {
        e!(SupervisorError::Spawn {
            command: file_name.clone(),
            source,
        })
    })?;

    #[cfg(windows)]
    {
        if let Ok(guard) = shared.job.lock() {
            if let Some(job) = guard.as_ref() {
                if let Err(err) = job.assign(&child) {
                    warn!(name = %shared.name, "failed to assign child to job object: {err:#}");
                }
            }
        }
    }

    if shared.process.redirect_output {
        pump_output(&shared.name, &mut child);
    }
    info!(name = %shared.name, pid = child.id(), "helper process started");

    tokio::select! {
        _ = shared.cancel.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_millis(shared.process.startup_delay_ms)) => {}
    }
    if let Some(status) = child.try_wait().ok().flatten() {
        return Err(e!(SupervisorError::EarlyExit {
            name: shared.name.clone(),
            status: status.to_string(),
        }));
    }
    *slot = Some(child);
    Ok(())
}

/// Forwards captured child output into the log, line by line.
fn pump_output(name: &str, child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(helper = %name, "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(helper = %name, "{line}");
            }
        });
    }
}

/// Restarts the child when it exits unexpectedly, bounded by
/// `max_restart_attempts` (0 = unlimited).
async fn crash_monitor(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(MONITOR_POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        let exited = {
            let mut slot = shared.child.lock().await;
            match slot.as_mut() {
                None => None,
                Some(child) => child.try_wait().ok().flatten(),
            }
        };
        let Some(status) = exited else { continue };

        let attempts = shared.restart_attempts.load(Ordering::SeqCst);
        let max = shared.process.max_restart_attempts;
        if max > 0 && attempts >= max {
            error!(
                name = %shared.name,
                exit = %status,
                attempts,
                "helper exited; restart limit reached, giving up"
            );
            break;
        }
        warn!(
            name = %shared.name,
            exit = %status,
            attempt = attempts + 1,
            "helper exited unexpectedly, restarting"
        );
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(shared.process.restart_delay_ms)) => {}
        }
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        shared.restart_attempts.fetch_add(1, Ordering::SeqCst);
        let mut slot = shared.child.lock().await;
        if let Err(err) = launch(&shared, &mut slot).await {
            warn!(name = %shared.name, "restart failed: {err:#}");
        }
    }
    debug!(name = %shared.name, "crash monitor stopped");
}

/// Probes the upstream's TCP port and forces a respawn after
/// `failure_threshold` consecutive failures.
///
/// Health-driven respawns bypass the crash-restart accounting entirely.
async fn health_monitor(shared: Arc<Shared>, host: String, port: u16, config: HealthCheckConfig) {
    let interval = Duration::from_millis(config.interval_ms);
    let timeout = Duration::from_millis(config.timeout_ms);
    let mut tally = FailureTally::new(config.failure_threshold);
    loop {
        // Full interval before the first probe and between probes.
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        let healthy = probe(&host, port, timeout).await;
        match tally.record(healthy) {
            ProbeOutcome::Healthy => {}
            ProbeOutcome::Recovered { failures } => {
                info!(name = %shared.name, after_failures = failures, "health check recovered");
            }
            ProbeOutcome::Failed { consecutive } => {
                warn!(
                    name = %shared.name,
                    consecutive,
                    threshold = config.failure_threshold,
                    "health check failed"
                );
            }
            ProbeOutcome::ThresholdReached => {
                warn!(name = %shared.name, "health check threshold reached, restarting helper");
                let mut slot = shared.child.lock().await;
                if let Some(mut child) = slot.take() {
                    child.start_kill().ok();
                    child.wait().await.ok();
                }
                if let Err(err) = launch(&shared, &mut slot).await {
                    warn!(name = %shared.name, "health restart failed: {err:#}");
                }
            }
        }
    }
    debug!(name = %shared.name, "health monitor stopped");
}

async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        TcpStream::connect((host, port)).timeout(timeout).await,
        Ok(Ok(_))
    )
}

/// Consecutive-failure accounting for the health monitor.
struct FailureTally {
    consecutive: u32,
    threshold: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum ProbeOutcome {
    Healthy,
    Recovered { failures: u32 },
    Failed { consecutive: u32 },
    ThresholdReached,
}

impl FailureTally {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Folds one probe result in. Any success resets the counter; the
    /// threshold outcome resets it too, so a fresh window starts after a
    /// restart.
    fn record(&mut self, healthy: bool) -> ProbeOutcome {
        if healthy {
            let failures = std::mem::replace(&mut self.consecutive, 0);
            if failures > 0 {
                ProbeOutcome::Recovered { failures }
            } else {
                ProbeOutcome::Healthy
            }
        } else {
            self.consecutive += 1;
            if self.consecutive >= self.threshold {
                self.consecutive = 0;
                ProbeOutcome::ThresholdReached
            } else {
                ProbeOutcome::Failed {
                    consecutive: self.consecutive,
                }
            }
        }
    }

    #[cfg(test)]
    fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

#[cfg(unix)]
fn polite_terminate(name: &str, child: &Child) {
    if let Some(pid) = child.id() {
        debug!(%name, pid, "sending SIGTERM");
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn polite_terminate(_name: &str, _child: &Child) {}

/// Expands `%NAME%` references against the process environment. Unknown
/// names are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        let Some(end) = rest[start + 1..].find('%') else {
            break;
        };
        let name = &rest[start + 1..start + 1 + end];
        out.push_str(&rest[..start]);
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push('%');
                out.push_str(name);
                out.push('%');
            }
        }
        rest = &rest[start + end + 2..];
    }
    out.push_str(rest);
    out
}
