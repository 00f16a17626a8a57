//! Process-backed container runtime
//!
//! Runs each compute unit as a local sandboxed worker process. The image
//! reference is interpreted as the worker command line (`sh -c`), the
//! reserved host port is passed via `AGENTHUB_WORKER_PORT`, and liveness
//! is a successful TCP connect to that port. Production deployments swap
//! in a daemon-backed `ContainerRuntime`; the seam is identical.

use crate::runtime::handle::{ContainerRuntime, HandleStats, ResourceHandle};
use crate::runtime::ports::PortPool;
use crate::utils::errors::{HubError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

const LOG_BUFFER_LINES: usize = 1000;

struct Unit {
    image_ref: String,
    env: Vec<(String, String)>,
    port: u16,
    child: Mutex<Option<Child>>,
    logs: Arc<parking_lot::Mutex<VecDeque<String>>>,
}

/// Local process implementation of the container runtime seam
pub struct ProcessRuntime {
    pool: Arc<PortPool>,
    units: DashMap<String, Arc<Unit>>,
    startup_timeout: Duration,
    stop_grace: Duration,
}

impl ProcessRuntime {
    pub fn new(pool: Arc<PortPool>, startup_timeout: Duration, stop_grace: Duration) -> Self {
        Self {
            pool,
            units: DashMap::new(),
            startup_timeout,
            stop_grace,
        }
    }

    fn unit(&self, handle: &ResourceHandle) -> Result<Arc<Unit>> {
        self.units
            .get(&handle.handle_id)
            .map(|u| u.clone())
            .ok_or_else(|| {
                HubError::HandleUnreachable(format!("no unit for handle {}", handle.handle_id))
            })
    }

    async fn pid_of(unit: &Unit) -> Result<u32> {
        let guard = unit.child.lock().await;
        guard
            .as_ref()
            .and_then(|c| c.id())
            .ok_or_else(|| HubError::HandleUnreachable("worker process not running".into()))
    }

    fn signal(pid: u32, sig: nix::sys::signal::Signal) -> Result<()> {
        use nix::unistd::Pid;
        nix::sys::signal::kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| HubError::HandleUnreachable(format!("signal {sig} to {pid}: {e}")))
    }

    fn spawn_log_reader<R>(reader: R, logs: Arc<parking_lot::Mutex<VecDeque<String>>>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut buf = logs.lock();
                if buf.len() == LOG_BUFFER_LINES {
                    buf.pop_front();
                }
                buf.push_back(line);
            }
        });
    }

    async fn wait_for_listener(&self, addr: SocketAddr, unit: &Unit) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            if TcpStream::connect(addr).await.is_ok() {
                return Ok(());
            }
            // A worker that already exited will never come up
            {
                let mut guard = unit.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(HubError::AllocationFailed(format!(
                            "worker exited during startup: {status}"
                        )));
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HubError::StartupTimeout(self.startup_timeout));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    async fn allocate(&self, image_ref: &str, env: &[(String, String)]) -> Result<ResourceHandle> {
        let port = self.pool.allocate()?;
        let handle_id = Ulid::new().to_string();

        self.units.insert(
            handle_id.clone(),
            Arc::new(Unit {
                image_ref: image_ref.to_string(),
                env: env.to_vec(),
                port,
                child: Mutex::new(None),
                logs: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            }),
        );

        debug!(handle_id, port, image_ref, "allocated worker unit");
        Ok(ResourceHandle {
            handle_id,
            image_ref: image_ref.to_string(),
            port,
        })
    }

    async fn start(&self, handle: &ResourceHandle) -> Result<SocketAddr> {
        let unit = self.unit(handle)?;
        let addr = handle.address();

        {
            let mut guard = unit.child.lock().await;
            if let Some(child) = guard.as_mut() {
                // Already started and still running: idempotent success
                if child.try_wait().ok().flatten().is_none() {
                    return Ok(addr);
                }
            }

            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&unit.image_ref)
                .env("AGENTHUB_WORKER_PORT", unit.port.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            for (key, value) in &unit.env {
                command.env(key, value);
            }

            let mut child = command
                .spawn()
                .map_err(|e| HubError::AllocationFailed(format!("spawn worker: {e}")))?;

            if let Some(stdout) = child.stdout.take() {
                Self::spawn_log_reader(stdout, unit.logs.clone());
            }
            if let Some(stderr) = child.stderr.take() {
                Self::spawn_log_reader(stderr, unit.logs.clone());
            }

            debug!(handle_id = %handle.handle_id, pid = ?child.id(), "worker spawned");
            *guard = Some(child);
        }

        match self.wait_for_listener(addr, &unit).await {
            Ok(()) => Ok(addr),
            Err(e) => {
                // Failed startup must not leak the process
                let mut guard = unit.child.lock().await;
                if let Some(mut child) = guard.take() {
                    let _ = child.kill().await;
                }
                Err(e)
            }
        }
    }

    async fn pause(&self, handle: &ResourceHandle) -> Result<()> {
        let unit = self.unit(handle)?;
        let pid = Self::pid_of(&unit).await?;
        Self::signal(pid, nix::sys::signal::Signal::SIGSTOP)
    }

    async fn unpause(&self, handle: &ResourceHandle) -> Result<()> {
        let unit = self.unit(handle)?;
        let pid = Self::pid_of(&unit).await?;
        Self::signal(pid, nix::sys::signal::Signal::SIGCONT)
    }

    async fn stop(&self, handle: &ResourceHandle) -> Result<()> {
        let unit = self.unit(handle)?;
        let mut guard = unit.child.lock().await;

        let Some(child) = guard.as_mut() else {
            return Ok(()); // never started, nothing to stop
        };
        if child.try_wait().ok().flatten().is_some() {
            *guard = None;
            return Ok(()); // already exited
        }

        if let Some(pid) = child.id() {
            // SIGCONT first so a paused worker can honor SIGTERM
            let _ = Self::signal(pid, nix::sys::signal::Signal::SIGCONT);
            let _ = Self::signal(pid, nix::sys::signal::Signal::SIGTERM);
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(handle_id = %handle.handle_id, %status, "worker exited");
            }
            Ok(Err(e)) => warn!(handle_id = %handle.handle_id, error = %e, "wait failed"),
            Err(_) => {
                warn!(handle_id = %handle.handle_id, "worker ignored SIGTERM, killing");
                let _ = child.kill().await;
            }
        }

        *guard = None;
        Ok(())
    }

    async fn remove(&self, handle: &ResourceHandle) -> Result<()> {
        if self.units.contains_key(&handle.handle_id) {
            self.stop(handle).await?;
        }
        if self.units.remove(&handle.handle_id).is_some() {
            self.pool.release(handle.port);
            debug!(handle_id = %handle.handle_id, "worker unit removed");
        }
        Ok(())
    }

    async fn stats(&self, handle: &ResourceHandle) -> Result<HandleStats> {
        let unit = self.unit(handle)?;
        let pid = Self::pid_of(&unit).await?;
        read_proc_stats(pid)
    }

    async fn logs(&self, handle: &ResourceHandle, tail_lines: usize) -> Result<Vec<String>> {
        let unit = self.unit(handle)?;
        let buf = unit.logs.lock();
        let skip = buf.len().saturating_sub(tail_lines);
        Ok(buf.iter().skip(skip).cloned().collect())
    }
}

#[cfg(target_os = "linux")]
fn read_proc_stats(pid: u32) -> Result<HandleStats> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map_err(|e| HubError::HandleUnreachable(format!("/proc/{pid}/stat: {e}")))?;
    // utime and stime are fields 14 and 15 (1-based), after the comm field
    // which may contain spaces; skip past the closing paren first.
    let after_comm = stat
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .unwrap_or(&stat);
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
    let ticks_per_sec = 100.0; // USER_HZ on every mainstream kernel config

    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).unwrap_or_default();
    let rss_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    Ok(HandleStats {
        cpu_seconds: (utime + stime) as f64 / ticks_per_sec,
        memory_bytes: rss_pages * 4096,
        network_bytes: 0,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stats(_pid: u32) -> Result<HandleStats> {
    // No /proc on this platform; report empty best-effort stats
    Ok(HandleStats::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> ProcessRuntime {
        ProcessRuntime::new(
            Arc::new(PortPool::new(18100, 50)),
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_allocate_reserves_port() {
        let rt = runtime();
        let h1 = rt.allocate("true", &[]).await.unwrap();
        let h2 = rt.allocate("true", &[]).await.unwrap();
        assert_ne!(h1.port, h2.port);

        rt.remove(&h1).await.unwrap();
        rt.remove(&h2).await.unwrap();
        assert_eq!(rt.pool.in_use_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let rt = runtime();
        let h = rt.allocate("true", &[]).await.unwrap();
        rt.remove(&h).await.unwrap();
        rt.remove(&h).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_worker_that_exits_immediately() {
        let rt = runtime();
        let h = rt.allocate("exit 3", &[]).await.unwrap();
        let err = rt.start(&h).await.unwrap_err();
        assert!(matches!(err, HubError::AllocationFailed(_)));
        rt.remove(&h).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_listening_worker() {
        let rt = runtime();
        // Minimal listening worker; python3 is assumed in PATH
        let worker = "python3 -c \"import os,socket,time;\ns=socket.socket();\ns.bind(('127.0.0.1', int(os.environ['AGENTHUB_WORKER_PORT'])));\ns.listen(1);\ntime.sleep(60)\"";
        let h = rt.allocate(worker, &[]).await.unwrap();

        let addr = rt.start(&h).await.unwrap();
        assert_eq!(addr.port(), h.port);

        // Idempotent second start
        let addr2 = rt.start(&h).await.unwrap();
        assert_eq!(addr, addr2);

        rt.stop(&h).await.unwrap();
        rt.stop(&h).await.unwrap(); // idempotent
        rt.remove(&h).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_unreachable_before_start() {
        let rt = runtime();
        let h = rt.allocate("true", &[]).await.unwrap();
        let err = rt.stats(&h).await.unwrap_err();
        assert!(matches!(err, HubError::HandleUnreachable(_)));
        rt.remove(&h).await.unwrap();
    }

    #[tokio::test]
    async fn test_logs_capture() {
        let rt = runtime();
        let worker = "echo line-one; echo line-two; python3 -c \"import os,socket,time;\ns=socket.socket();\ns.bind(('127.0.0.1', int(os.environ['AGENTHUB_WORKER_PORT'])));\ns.listen(1);\ntime.sleep(60)\"";
        let h = rt.allocate(worker, &[]).await.unwrap();
        rt.start(&h).await.unwrap();

        // Reader tasks drain stdout asynchronously
        tokio::time::sleep(Duration::from_millis(200)).await;
        let logs = rt.logs(&h, 10).await.unwrap();
        assert!(logs.iter().any(|l| l == "line-one"));

        let tail = rt.logs(&h, 1).await.unwrap();
        assert_eq!(tail.len(), 1);

        rt.remove(&h).await.unwrap();
    }
}
