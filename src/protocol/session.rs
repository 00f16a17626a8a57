//! ACP protocol session
//!
//! One session per Running instance. Owns the transport (duplex preferred,
//! polling fallback, selected once at handshake), a background reader that
//! correlates `TaskResponse` frames to pending requests, and a heartbeat
//! emitter. The session only *detects* degraded health; acting on it is
//! the monitor loop's job.

use crate::protocol::message::{AcpMessage, Payload, TaskStatus};
use crate::protocol::transport::{DuplexTransport, PollingTransport, Transport, TransportKind};
use crate::utils::config::ProtocolConfig;
use crate::utils::errors::{HubError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ulid::Ulid;

/// Bound on the farewell shutdown frame; teardown holds the instance's
/// serialization token and must not wait on a wedged worker.
const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Caller-facing result of one task execution, identical for both transports
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Snapshot of session liveness, read by the monitor loop
#[derive(Debug, Clone)]
pub struct SessionHealth {
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    pub last_heartbeat_received: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
}

struct Shared {
    instance_id: String,
    transport: Arc<dyn Transport>,
    pending: SyncMutex<HashMap<String, oneshot::Sender<Result<TaskOutcome>>>>,
    max_inflight: usize,
    last_hb_sent: SyncMutex<Option<(Instant, DateTime<Utc>)>>,
    last_hb_received: SyncMutex<Option<(Instant, DateTime<Utc>)>>,
    missed_heartbeats: AtomicU32,
}

impl Shared {
    fn resolve_all(&self, err: impl Fn() -> HubError) {
        let mut pending = self.pending.lock();
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(err()));
        }
    }
}

/// Stateful protocol session bound to one instance
pub struct ProtocolSession {
    session_id: String,
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl ProtocolSession {
    /// Establish a session: duplex first, polling fallback, handshake
    /// acknowledged within the configured window either way.
    pub async fn establish(
        instance_id: &str,
        addr: SocketAddr,
        config: &ProtocolConfig,
    ) -> Result<ProtocolSession> {
        let handshake_timeout = Duration::from_secs(config.handshake_timeout_secs);

        match Self::try_handshake_duplex(instance_id, addr, handshake_timeout).await {
            Ok(transport) => Ok(Self::spawn(instance_id, transport, config)),
            Err(duplex_err) => {
                debug!(
                    instance_id,
                    error = %duplex_err,
                    "duplex handshake failed, falling back to polling"
                );
                let transport =
                    Self::try_handshake_polling(instance_id, addr, handshake_timeout, config)
                        .await?;
                Ok(Self::spawn(instance_id, transport, config))
            }
        }
    }

    async fn try_handshake_duplex(
        instance_id: &str,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>> {
        let transport = DuplexTransport::connect(addr, timeout).await?;
        transport.send(&AcpMessage::handshake(instance_id)).await?;

        let reply = tokio::time::timeout(timeout, transport.receive())
            .await
            .map_err(|_| HubError::HandshakeFailed("no acknowledgment".into()))??;
        Self::check_handshake_ack(&reply)?;
        Ok(Arc::new(transport))
    }

    async fn try_handshake_polling(
        instance_id: &str,
        addr: SocketAddr,
        timeout: Duration,
        config: &ProtocolConfig,
    ) -> Result<Arc<dyn Transport>> {
        let transport = PollingTransport::new(
            addr,
            instance_id,
            Duration::from_millis(config.poll_interval_ms),
        );
        tokio::time::timeout(timeout, transport.send(&AcpMessage::handshake(instance_id)))
            .await
            .map_err(|_| HubError::HandshakeFailed("handshake request timed out".into()))?
            .map_err(|e| HubError::HandshakeFailed(e.to_string()))?;

        let reply = tokio::time::timeout(timeout, transport.receive())
            .await
            .map_err(|_| HubError::HandshakeFailed("no acknowledgment".into()))??;
        Self::check_handshake_ack(&reply)?;
        Ok(Arc::new(transport))
    }

    fn check_handshake_ack(reply: &AcpMessage) -> Result<()> {
        match reply.decode_payload()? {
            Payload::Handshake(p) if p.status.as_deref() == Some("ready") => Ok(()),
            other => Err(HubError::HandshakeFailed(format!(
                "unexpected reply {other:?}"
            ))),
        }
    }

    fn spawn(instance_id: &str, transport: Arc<dyn Transport>, config: &ProtocolConfig) -> Self {
        let shared = Arc::new(Shared {
            instance_id: instance_id.to_string(),
            transport,
            pending: SyncMutex::new(HashMap::new()),
            max_inflight: config.max_inflight_tasks,
            last_hb_sent: SyncMutex::new(None),
            last_hb_received: SyncMutex::new(None),
            missed_heartbeats: AtomicU32::new(0),
        });

        let reader_task = tokio::spawn(Self::reader_loop(shared.clone()));
        let heartbeat_task = tokio::spawn(Self::heartbeat_loop(
            shared.clone(),
            Duration::from_secs(config.heartbeat_interval_secs),
        ));

        Self {
            session_id: Ulid::new().to_string(),
            shared,
            reader_task,
            heartbeat_task,
        }
    }

    /// Dispatch inbound frames. Responses matching a pending request are
    /// delivered in arrival order; heartbeat traffic is independent.
    async fn reader_loop(shared: Arc<Shared>) {
        loop {
            let msg = match shared.transport.receive().await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(instance_id = %shared.instance_id, error = %e, "session reader stopping");
                    shared.resolve_all(|| HubError::Transport("session closed".into()));
                    return;
                }
            };

            match msg.decode_payload() {
                Ok(Payload::TaskResponse(p)) => {
                    let slot = shared.pending.lock().remove(&p.message_id);
                    match slot {
                        Some(tx) => {
                            let _ = tx.send(Ok(TaskOutcome {
                                status: p.status,
                                result: p.result,
                                error: p.error,
                            }));
                        }
                        None => {
                            // Late response after timeout/cancellation
                            debug!(message_id = %p.message_id, "response for unknown request");
                        }
                    }
                }
                Ok(Payload::Heartbeat) => {
                    *shared.last_hb_received.lock() = Some((Instant::now(), Utc::now()));
                    shared.missed_heartbeats.store(0, Ordering::Release);
                }
                Ok(Payload::StatusUpdate(update)) => {
                    debug!(instance_id = %shared.instance_id, health = %update.health, "worker status update");
                }
                Ok(Payload::Error(p)) => {
                    warn!(instance_id = %shared.instance_id, error = %p.error, "worker reported error");
                }
                Ok(_) => {}
                Err(e) => warn!(instance_id = %shared.instance_id, error = %e, "undecodable frame"),
            }
        }
    }

    /// Emit heartbeats at a fixed interval; an emission whose reply has
    /// not arrived by the next tick counts as one miss.
    async fn heartbeat_loop(shared: Arc<Shared>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let sent_at = shared.last_hb_sent.lock().map(|(i, _)| i);
            if let Some(sent_at) = sent_at {
                let answered = shared
                    .last_hb_received
                    .lock()
                    .map(|(i, _)| i >= sent_at)
                    .unwrap_or(false);
                if !answered {
                    let missed = shared.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(instance_id = %shared.instance_id, missed, "heartbeat unanswered");
                }
            }

            let hb = AcpMessage::heartbeat(&shared.instance_id);
            if let Err(e) = shared.transport.send(&hb).await {
                let missed = shared.missed_heartbeats.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(instance_id = %shared.instance_id, missed, error = %e, "heartbeat send failed");
                continue;
            }
            *shared.last_hb_sent.lock() = Some((Instant::now(), Utc::now()));
        }
    }

    /// Send one task request and wait for its correlated response.
    ///
    /// On timeout the pending slot is dropped and `TaskTimeout` returned;
    /// the session itself stays usable.
    pub async fn execute_task(
        &self,
        endpoint: &str,
        parameters: Value,
        timeout: Duration,
    ) -> Result<TaskOutcome> {
        let msg = AcpMessage::task_request(
            &self.shared.instance_id,
            endpoint,
            parameters,
            timeout.as_secs_f64(),
        );
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.shared.pending.lock();
            if pending.len() >= self.shared.max_inflight {
                return Err(HubError::Busy {
                    instance_id: self.shared.instance_id.clone(),
                    inflight: pending.len(),
                    limit: self.shared.max_inflight,
                });
            }
            pending.insert(msg.message_id.clone(), tx);
        }

        if let Err(e) = self.shared.transport.send(&msg).await {
            self.shared.pending.lock().remove(&msg.message_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::Cancelled("session closed".into())),
            Err(_) => {
                self.shared.pending.lock().remove(&msg.message_id);
                Err(HubError::TaskTimeout(timeout))
            }
        }
    }

    /// Resolve every outstanding request with `Cancelled`; called when the
    /// owning instance leaves Running.
    pub fn cancel_all(&self, reason: &str) {
        let reason = reason.to_string();
        self.shared
            .resolve_all(move || HubError::Cancelled(reason.clone()));
    }

    /// Best-effort shutdown frame, then tear the session down. Both the
    /// farewell send and the transport close are time-bounded.
    pub async fn close(&self, reason: &str) {
        self.cancel_all(reason);
        let shutdown = AcpMessage::shutdown(&self.shared.instance_id, reason);
        let _ = tokio::time::timeout(
            SHUTDOWN_SEND_TIMEOUT,
            self.shared.transport.send(&shutdown),
        )
        .await;
        self.heartbeat_task.abort();
        self.reader_task.abort();
        let _ = tokio::time::timeout(SHUTDOWN_SEND_TIMEOUT, self.shared.transport.close()).await;
        debug!(instance_id = %self.shared.instance_id, session_id = %self.session_id, "session closed");
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.shared.transport.kind()
    }

    pub fn inflight(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.shared.missed_heartbeats.load(Ordering::Acquire)
    }

    pub fn health(&self) -> SessionHealth {
        SessionHealth {
            last_heartbeat_sent: self.shared.last_hb_sent.lock().map(|(_, t)| t),
            last_heartbeat_received: self.shared.last_hb_received.lock().map(|(_, t)| t),
            missed_heartbeats: self.missed_heartbeats(),
        }
    }

    /// Staleness rule: healthy while the last heartbeat reply is younger
    /// than the configured window (or none was ever expected yet).
    pub fn is_healthy(&self, staleness: Duration) -> bool {
        match *self.shared.last_hb_received.lock() {
            Some((instant, _)) => instant.elapsed() < staleness,
            None => self.shared.last_hb_sent.lock().is_none(),
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
        self.reader_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageType, TaskResponsePayload};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct WorkerBehavior {
        ack_handshake: bool,
        answer_heartbeats: bool,
        task_delay: Duration,
        answer_tasks: bool,
    }

    impl Default for WorkerBehavior {
        fn default() -> Self {
            Self {
                ack_handshake: true,
                answer_heartbeats: true,
                task_delay: Duration::ZERO,
                answer_tasks: true,
            }
        }
    }

    async fn spawn_worker(behavior: WorkerBehavior) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, write) = stream.into_split();
            let write = Arc::new(tokio::sync::Mutex::new(write));
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg = AcpMessage::from_json(&line).unwrap();
                match msg.kind {
                    MessageType::Handshake if behavior.ack_handshake => {
                        let out = AcpMessage::handshake_ack(&msg.instance_id)
                            .to_json()
                            .unwrap()
                            + "\n";
                        let _ = write.lock().await.write_all(out.as_bytes()).await;
                    }
                    MessageType::Heartbeat if behavior.answer_heartbeats => {
                        let out = AcpMessage::heartbeat(&msg.instance_id).to_json().unwrap() + "\n";
                        let _ = write.lock().await.write_all(out.as_bytes()).await;
                    }
                    MessageType::TaskRequest if behavior.answer_tasks => {
                        let delay = behavior.task_delay;
                        let write = write.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let reply = AcpMessage::task_response(
                                &msg.instance_id,
                                &TaskResponsePayload {
                                    message_id: msg.message_id.clone(),
                                    status: TaskStatus::Completed,
                                    result: Some(serde_json::json!({"done": true})),
                                    error: None,
                                },
                            );
                            let out = reply.to_json().unwrap() + "\n";
                            let _ = write.lock().await.write_all(out.as_bytes()).await;
                        });
                    }
                    _ => {}
                }
            }
        });
        addr
    }

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout_secs: 2,
            heartbeat_interval_secs: 1,
            heartbeat_timeout_secs: 5,
            max_inflight_tasks: 2,
            poll_interval_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_establish_and_execute() {
        let addr = spawn_worker(WorkerBehavior::default()).await;
        let session = ProtocolSession::establish("inst_1", addr, &test_config())
            .await
            .unwrap();
        assert_eq!(session.transport_kind(), TransportKind::Duplex);

        let outcome = session
            .execute_task("/run", serde_json::json!({"n": 1}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_handshake_failure_when_no_worker() {
        let cfg = ProtocolConfig {
            handshake_timeout_secs: 1,
            ..test_config()
        };
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = ProtocolSession::establish("inst_1", addr, &cfg)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, HubError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_task_timeout_keeps_session_usable() {
        let addr = spawn_worker(WorkerBehavior {
            task_delay: Duration::from_secs(30),
            ..Default::default()
        })
        .await;
        let session = ProtocolSession::establish("inst_1", addr, &test_config())
            .await
            .unwrap();

        let err = session
            .execute_task("/slow", serde_json::json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::TaskTimeout(_)));

        // Slot was reclaimed, session still usable
        assert_eq!(session.inflight(), 0);
    }

    #[tokio::test]
    async fn test_inflight_limit() {
        let addr = spawn_worker(WorkerBehavior {
            task_delay: Duration::from_secs(30),
            ..Default::default()
        })
        .await;
        let session = Arc::new(
            ProtocolSession::establish("inst_1", addr, &test_config())
                .await
                .unwrap(),
        );

        // Fill both slots with slow tasks
        let s1 = session.clone();
        let t1 = tokio::spawn(async move {
            s1.execute_task("/slow", serde_json::json!({}), Duration::from_secs(10))
                .await
        });
        let s2 = session.clone();
        let t2 = tokio::spawn(async move {
            s2.execute_task("/slow", serde_json::json!({}), Duration::from_secs(10))
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.inflight(), 2);

        let err = session
            .execute_task("/slow", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Busy { .. }));

        session.cancel_all("test over");
        let r1 = t1.await.unwrap();
        let r2 = t2.await.unwrap();
        assert!(matches!(r1.unwrap_err(), HubError::Cancelled(_)));
        assert!(matches!(r2.unwrap_err(), HubError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_missed_heartbeats_accumulate() {
        let addr = spawn_worker(WorkerBehavior {
            answer_heartbeats: false,
            ..Default::default()
        })
        .await;
        let session = ProtocolSession::establish("inst_1", addr, &test_config())
            .await
            .unwrap();

        // Interval is 1s; after ~3.5s at least two sends went unanswered
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(session.missed_heartbeats() >= 2);
        assert!(!session.is_healthy(Duration::from_millis(500)));
    }

    /// Transport whose sends never complete, as seen against a worker
    /// that stopped draining its socket.
    struct StalledTransport;

    #[async_trait::async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _msg: &AcpMessage) -> Result<()> {
            std::future::pending().await
        }

        async fn receive(&self) -> Result<AcpMessage> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Duplex
        }
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_worker_wedged() {
        let session = ProtocolSession::spawn("inst_1", Arc::new(StalledTransport), &test_config());
        let started = Instant::now();
        session.close("going away").await;
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "close stalled for {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_heartbeats_answered_stay_healthy() {
        let addr = spawn_worker(WorkerBehavior::default()).await;
        let session = ProtocolSession::establish("inst_1", addr, &test_config())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(session.missed_heartbeats(), 0);
        assert!(session.is_healthy(Duration::from_secs(5)));
    }
}
