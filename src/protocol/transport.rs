//! ACP transports
//!
//! Two interchangeable transports behind one capability interface:
//!
//! - **DuplexTransport**: persistent TCP channel carrying newline-delimited
//!   JSON frames (preferred)
//! - **PollingTransport**: stateless HTTP request/poll fallback for workers
//!   that cannot hold a duplex channel open
//!
//! The polling transport synthesizes inbound frames (handshake ack,
//! heartbeat reply, task response) from HTTP exchanges so the session
//! layer sees the exact same message stream either way.

use crate::protocol::message::{AcpMessage, MessageType, TaskResponsePayload};
use crate::utils::errors::{HubError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

/// Transport selected once at handshake time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Duplex,
    Polling,
}

/// Capability interface both transports implement
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, msg: &AcpMessage) -> Result<()>;

    /// Next inbound frame; blocks until one arrives or the transport closes
    async fn receive(&self) -> Result<AcpMessage>;

    async fn close(&self) -> Result<()>;

    fn kind(&self) -> TransportKind;
}

type LineReader = FramedRead<tokio::net::tcp::OwnedReadHalf, LinesCodec>;
type LineWriter = FramedWrite<tokio::net::tcp::OwnedWriteHalf, LinesCodec>;

/// Persistent TCP channel, newline-delimited JSON frames
pub struct DuplexTransport {
    reader: Mutex<LineReader>,
    writer: Mutex<LineWriter>,
    closed: AtomicBool,
}

impl DuplexTransport {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HubError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| HubError::Transport(format!("connect to {addr}: {e}")))?;

        let (read_half, write_half) = stream.into_split();
        debug!(%addr, "duplex channel established");
        Ok(Self {
            reader: Mutex::new(FramedRead::new(read_half, LinesCodec::new())),
            writer: Mutex::new(FramedWrite::new(write_half, LinesCodec::new())),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, msg: &AcpMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Transport("channel closed".into()));
        }
        let line = msg.to_json()?;
        self.writer
            .lock()
            .await
            .send(line)
            .await
            .map_err(|e| HubError::Transport(format!("send frame: {e}")))
    }

    async fn receive(&self) -> Result<AcpMessage> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(HubError::Transport("channel closed".into()));
            }
            let line = self
                .reader
                .lock()
                .await
                .next()
                .await
                .ok_or_else(|| HubError::Transport("peer closed channel".into()))?
                .map_err(|e| HubError::Transport(format!("read frame: {e}")))?;

            match AcpMessage::from_json(&line) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    // Malformed frame: drop and keep the channel alive
                    warn!(error = %e, "discarding malformed frame");
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = SinkExt::<String>::close(&mut *writer).await;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Duplex
    }
}

/// HTTP request/poll fallback
pub struct PollingTransport {
    base: String,
    instance_id: String,
    client: Client<HttpConnector, Full<Bytes>>,
    inbound: SyncMutex<VecDeque<AcpMessage>>,
    pending: SyncMutex<Vec<String>>,
    poll_interval: Duration,
    closed: AtomicBool,
}

impl PollingTransport {
    pub fn new(addr: SocketAddr, instance_id: &str, poll_interval: Duration) -> Self {
        Self {
            base: format!("http://{addr}"),
            instance_id: instance_id.to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            inbound: SyncMutex::new(VecDeque::new()),
            pending: SyncMutex::new(Vec::new()),
            poll_interval,
            closed: AtomicBool::new(false),
        }
    }

    async fn post(&self, path: &str, body: String) -> Result<Bytes> {
        let req = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(format!("{}{}", self.base, path))
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| HubError::Transport(format!("build request: {e}")))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| HubError::Transport(format!("POST {path}: {e}")))?;

        if !resp.status().is_success() {
            return Err(HubError::Transport(format!(
                "POST {path}: status {}",
                resp.status()
            )));
        }
        resp.into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .map_err(|e| HubError::Transport(format!("read body: {e}")))
    }

    async fn get(&self, path: &str) -> Result<(hyper::StatusCode, Bytes)> {
        let req = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri(format!("{}{}", self.base, path))
            .body(Full::new(Bytes::new()))
            .map_err(|e| HubError::Transport(format!("build request: {e}")))?;

        let resp = self
            .client
            .request(req)
            .await
            .map_err(|e| HubError::Transport(format!("GET {path}: {e}")))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .map_err(|e| HubError::Transport(format!("read body: {e}")))?;
        Ok((status, body))
    }

    fn push_inbound(&self, msg: AcpMessage) {
        self.inbound.lock().push_back(msg);
    }

    /// One polling pass over outstanding task ids. Poll failures are
    /// absorbed: the id stays pending and is retried on the next pass,
    /// so a transient worker hiccup never tears the session down.
    async fn poll_pending(&self) {
        let ids: Vec<String> = self.pending.lock().clone();
        for id in ids {
            let (status, body) = match self.get(&format!("/acp/task/{id}")).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "task poll failed, retrying next pass");
                    continue;
                }
            };
            if status == hyper::StatusCode::ACCEPTED {
                continue; // still running
            }
            match serde_json::from_slice::<TaskResponsePayload>(&body) {
                Ok(payload) => {
                    self.pending.lock().retain(|p| p != &id);
                    self.push_inbound(AcpMessage::task_response(&self.instance_id, &payload));
                }
                Err(e) => {
                    warn!(message_id = %id, error = %e, "undecodable poll reply, retrying next pass");
                }
            }
        }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    async fn send(&self, msg: &AcpMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::Transport("transport closed".into()));
        }
        match msg.kind {
            MessageType::Handshake => {
                let body = self.post("/acp/handshake", msg.to_json()?).await?;
                let reply: serde_json::Value = serde_json::from_slice(&body)
                    .map_err(|e| HubError::Transport(format!("handshake body: {e}")))?;
                if reply["status"] != "ready" {
                    return Err(HubError::HandshakeFailed(format!(
                        "worker replied {reply}"
                    )));
                }
                self.push_inbound(AcpMessage::handshake_ack(&self.instance_id));
            }
            MessageType::Heartbeat => {
                self.post("/acp/heartbeat", msg.to_json()?).await?;
                // 200 is the heartbeat reply in the polling model
                self.push_inbound(AcpMessage::heartbeat(&self.instance_id));
            }
            MessageType::TaskRequest => {
                self.post("/acp/task", msg.to_json()?).await?;
                self.pending.lock().push(msg.message_id.clone());
            }
            MessageType::Shutdown => {
                // Best-effort; the worker may already be gone
                let _ = self.post("/acp/shutdown", msg.to_json()?).await;
            }
            other => {
                return Err(HubError::Transport(format!(
                    "polling transport cannot send {other:?}"
                )));
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<AcpMessage> {
        loop {
            if let Some(msg) = self.inbound.lock().pop_front() {
                return Ok(msg);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(HubError::Transport("transport closed".into()));
            }
            if !self.pending.lock().is_empty() {
                self.poll_pending().await;
                if let Some(msg) = self.inbound.lock().pop_front() {
                    return Ok(msg);
                }
            }
            // at most one status pass per interval
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }
}
