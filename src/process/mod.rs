//! The `Process` state machine: one OS child process backing one configured
//! model, plus the health-check and idle-eviction machinery that surrounds it.
//!
//! The in-flight RAII guard, atomic-state handle, child spawn, and
//! process-group signal delivery generalize a single READY/DOWN backend flag
//! into the five-state lifecycle this system needs.

pub mod group;
pub mod manager;

#[cfg(test)]
mod concurrency_tests;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex, Notify};

use crate::config::ModelConfig;
use crate::error::SwapError;

/// Lifecycle state of a single backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    /// Terminal: the daemon is shutting down. No further transitions happen.
    Shutdown,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Ready => "ready",
            ProcessState::Stopping => "stopping",
            ProcessState::Shutdown => "shutdown",
        }
    }
}

/// How a caller wants `Process::stop` to treat in-flight requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    /// Signal the child immediately regardless of in-flight request count.
    Immediately,
    /// Wait for `in_flight` to reach zero before signaling the child.
    WaitForInflight,
}

/// Broadcast on every state transition, for the `/processes` watch surface
/// and for tests asserting on ordering.
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub model_id: String,
    pub old: ProcessState,
    pub new: ProcessState,
    pub at: SystemTime,
}

struct Inner {
    state: ProcessState,
    pid: Option<u32>,
    last_request: Instant,
    started_at: Option<Instant>,
    failed_start_count: u32,
    ttl_handle: Option<tokio::task::JoinHandle<()>>,
}

/// One configured model's backend process and everything needed to drive it
/// through its lifecycle: spawn, health-check, serve, idle-evict, stop.
pub struct Process {
    pub id: String,
    pub model: Arc<ModelConfig>,
    inner: Mutex<Inner>,
    notify: Notify,
    in_flight: AtomicU32,
    events: broadcast::Sender<StateChangeEvent>,
    http: reqwest::Client,
}

/// RAII in-flight counter. Decrements on drop so every exit path of the
/// dispatcher — success, error, client disconnect mid-stream — releases it.
pub struct InFlightGuard {
    process: Arc<Process>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.process.remove_in_flight();
    }
}

impl Process {
    pub fn new(model: Arc<ModelConfig>, events: broadcast::Sender<StateChangeEvent>) -> Arc<Self> {
        Arc::new(Process {
            id: model.id.clone(),
            model,
            inner: Mutex::new(Inner {
                state: ProcessState::Stopped,
                pid: None,
                last_request: Instant::now(),
                started_at: None,
                failed_start_count: 0,
                ttl_handle: None,
            }),
            notify: Notify::new(),
            in_flight: AtomicU32::new(0),
            events,
            http: reqwest::Client::builder()
                .build()
                .expect("reqwest client with default TLS backend"),
        })
    }

    pub async fn state(&self) -> ProcessState {
        self.inner.lock().await.state
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn started_at(&self) -> Option<Instant> {
        self.inner.lock().await.started_at
    }

    pub fn touch(&self) {
        // Best-effort: a stale `last_request` under contention only delays
        // eviction by a tick, never triggers it early.
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.last_request = Instant::now();
        }
    }

    pub fn add_in_flight(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        InFlightGuard {
            process: Arc::clone(self),
        }
    }

    fn remove_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Acquire the lock and move to `new`, emitting a `StateChangeEvent`.
    /// Also (dis)arms the TTL ticker around the READY boundary.
    async fn transition(self: &Arc<Self>, inner: &mut Inner, new: ProcessState) {
        let old = inner.state;
        if old == new {
            return;
        }
        inner.state = new;
        if new == ProcessState::Ready {
            inner.started_at.get_or_insert(Instant::now());
            if let Some(ttl) = self.model.unload_after {
                if let Some(old_handle) = inner.ttl_handle.take() {
                    old_handle.abort();
                }
                inner.ttl_handle = Some(self.spawn_ttl_ticker(ttl));
            }
        }
        if old == ProcessState::Ready && new != ProcessState::Ready {
            if let Some(handle) = inner.ttl_handle.take() {
                handle.abort();
            }
        }
        if matches!(new, ProcessState::Stopped | ProcessState::Shutdown) {
            inner.pid = None;
            inner.started_at = None;
        }
        let _ = self.events.send(StateChangeEvent {
            model_id: self.id.clone(),
            old,
            new,
            at: SystemTime::now(),
        });
        self.notify.notify_waiters();
    }

    fn spawn_ttl_ticker(self: &Arc<Self>, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if process.state().await != ProcessState::Ready {
                    return;
                }
                if process.in_flight() > 0 {
                    continue;
                }
                let idle = {
                    let inner = process.inner.lock().await;
                    inner.last_request.elapsed()
                };
                if idle >= ttl {
                    tracing::info!(model = %process.id, idle_secs = idle.as_secs(), "ttl elapsed, evicting");
                    process.stop(StopStrategy::Immediately).await;
                    return;
                }
            }
        })
    }

    /// Idempotent start. Concurrent callers coalesce on the same attempt.
    pub async fn start(self: &Arc<Self>) -> Result<(), SwapError> {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ProcessState::Ready => return Ok(()),
                ProcessState::Starting | ProcessState::Stopping => {
                    drop(inner);
                    self.notify.notified().await;
                    continue;
                }
                ProcessState::Shutdown => return Err(SwapError::ShuttingDown),
                ProcessState::Stopped => {
                    // Claim the transition while still holding the lock so no
                    // other starter can observe STOPPED and race us here.
                    self.transition(&mut inner, ProcessState::Starting).await;
                    break;
                }
            }
        }

        match self.spawn_and_wait_ready().await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.failed_start_count += 1;
                if inner.state == ProcessState::Starting {
                    self.transition(&mut inner, ProcessState::Stopped).await;
                }
                Err(err)
            }
        }
    }

    async fn spawn_and_wait_ready(self: &Arc<Self>) -> Result<(), SwapError> {
        let argv = &self.model.cmd;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        for (k, v) in &self.model.env {
            cmd.env(k, v);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.kill_on_drop(false).spawn().map_err(|e| SwapError::SpawnFailed {
            model: self.id.clone(),
            source: anyhow::Error::new(e).context(format!("spawning {:?}", argv)),
        })?;
        let pid = child.id().ok_or_else(|| SwapError::SpawnFailed {
            model: self.id.clone(),
            source: anyhow::anyhow!("child exited before its pid could be read"),
        })?;

        {
            let mut inner = self.inner.lock().await;
            inner.pid = Some(pid);
        }

        spawn_log_pump(self.id.clone(), child.stdout.take(), tracing::Level::INFO);
        spawn_log_pump(self.id.clone(), child.stderr.take(), tracing::Level::WARN);
        self.spawn_exit_handler(child);

        tokio::time::sleep(Duration::from_millis(250)).await;
        if self.state().await != ProcessState::Starting {
            return Err(SwapError::UnexpectedExit {
                model: self.id.clone(),
                phase: "the 250ms startup delay",
            });
        }

        self.wait_healthy().await?;

        let mut inner = self.inner.lock().await;
        if inner.state != ProcessState::Starting {
            return Err(SwapError::UnexpectedExit {
                model: self.id.clone(),
                phase: "health checking",
            });
        }
        inner.failed_start_count = 0;
        self.transition(&mut inner, ProcessState::Ready).await;
        Ok(())
    }

    fn spawn_exit_handler(self: &Arc<Self>, mut child: Child) {
        let process = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            let mut inner = process.inner.lock().await;
            match status {
                Ok(status) => tracing::info!(model = %process.id, %status, "backend exited"),
                Err(err) => tracing::warn!(model = %process.id, error = %err, "wait() on backend failed"),
            }
            match inner.state {
                ProcessState::Stopping => {
                    process.transition(&mut inner, ProcessState::Stopped).await;
                }
                other => {
                    tracing::warn!(model = %process.id, state = other.as_str(), "backend exited unexpectedly");
                    process.transition(&mut inner, ProcessState::Stopped).await;
                }
            }
        });
    }

    async fn wait_healthy(self: &Arc<Self>) -> Result<(), SwapError> {
        use crate::config::CheckEndpoint;
        let path = match &self.model.check_endpoint {
            CheckEndpoint::None => return Ok(()),
            CheckEndpoint::Path(p) => p.clone(),
        };
        let url = format!("{}{}", self.model.proxy.trim_end_matches('/'), path);
        let deadline = Instant::now() + self.model.health_check_timeout;
        loop {
            if self.state().await != ProcessState::Starting {
                return Err(SwapError::UnexpectedExit {
                    model: self.id.clone(),
                    phase: "health checking",
                });
            }
            if Instant::now() >= deadline {
                return Err(SwapError::HealthTimeout {
                    model: self.id.clone(),
                    timeout_secs: self.model.health_check_timeout.as_secs(),
                });
            }
            let probe = self
                .http
                .get(&url)
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            if let Ok(resp) = probe {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }

    /// Stop the process. Returns once the stop has been *requested*; the
    /// STOPPING → STOPPED transition itself happens asynchronously in the
    /// child-exit handler when the OS actually reaps the process.
    pub async fn stop(self: &Arc<Self>, strategy: StopStrategy) {
        {
            let inner = self.inner.lock().await;
            if matches!(
                inner.state,
                ProcessState::Stopped | ProcessState::Stopping | ProcessState::Shutdown
            ) {
                return;
            }
        }
        if strategy == StopStrategy::WaitForInflight {
            loop {
                if self.in_flight() == 0 {
                    break;
                }
                self.notify.notified().await;
            }
        }

        let mut inner = self.inner.lock().await;
        if matches!(
            inner.state,
            ProcessState::Stopped | ProcessState::Stopping | ProcessState::Shutdown
        ) {
            return;
        }
        let pid = inner.pid;
        self.transition(&mut inner, ProcessState::Stopping).await;
        drop(inner);

        let Some(pid) = pid else {
            return;
        };
        if let Some(template) = &self.model.cmd_stop {
            let resolved = template.replace("${PID}", &pid.to_string());
            tracing::debug!(model = %self.id, cmd = %resolved, "running cmdStop");
            let _ = tokio::process::Command::new("sh").arg("-c").arg(resolved).spawn();
        } else {
            let _ = signal::kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM)
                .or_else(|_| signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM));
        }
    }

    /// Final, unconditional teardown for daemon shutdown: skips the
    /// WAIT_FOR_INFLIGHT courtesy and marks the terminal SHUTDOWN state once
    /// the child (if any) is gone.
    pub async fn shutdown(self: &Arc<Self>) {
        self.stop(StopStrategy::Immediately).await;
        loop {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ProcessState::Stopped => {
                    self.transition(&mut inner, ProcessState::Shutdown).await;
                    return;
                }
                ProcessState::Shutdown => return,
                _ => {
                    drop(inner);
                    self.notify.notified().await;
                }
            }
        }
    }
}

fn spawn_log_pump(
    model_id: String,
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    level: tracing::Level,
) {
    let Some(pipe) = pipe else { return };
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match level {
                tracing::Level::WARN => tracing::warn!(model = %model_id, "{line}"),
                _ => tracing::info!(model = %model_id, "{line}"),
            }
        }
    });
}
