//! One session per upgraded WebSocket: an init phase, a reader loop and a
//! writer loop sharing a cancellation token. The reader applies agent
//! reports through the agent usecase; the writer drains a bounded outbound
//! queue. A slow or dead writer never starves the reader.

use crate::agent::usecase::{ApplyOutcome, ReportProcessor};
use crate::opamp::frame::{self, FrameError};
use crate::opamp::instance_uid::InstanceUid;
use crate::opamp::registry::ConnectionRegistry;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use opamp_proto::proto::ServerToAgent;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_OUT_QUEUE_CAP: usize = 64;
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Decode failures tolerated back-to-back before the connection is closed as
/// a policy violation.
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 5;

const WRITE_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const WRITE_BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Write retries for one frame before the transport is declared dead.
const MAX_WRITE_RETRIES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted,
    QueueFull,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    /// The agent re-connected elsewhere and the new session won the binding.
    SupersededConnection,
    /// Too many undecodable frames in a row.
    PolicyViolation,
    HandshakeTimeout,
    TransportError,
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the agent.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Normal | Self::SupersededConnection | Self::HandshakeTimeout | Self::Shutdown => {
                1000
            }
            Self::PolicyViolation => 1008,
            Self::TransportError => 1011,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::SupersededConnection => "superseded connection",
            Self::PolicyViolation => "policy violation",
            Self::HandshakeTimeout => "handshake timeout",
            Self::TransportError => "transport error",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub init_timeout: Duration,
    pub out_queue_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            out_queue_cap: DEFAULT_OUT_QUEUE_CAP,
        }
    }
}

/// The face a session shows to the registry, the dispatcher and the
/// reconciler. Enqueueing never blocks; closing is idempotent.
pub struct SessionHandle {
    connection_id: Uuid,
    outbound: mpsc::Sender<ServerToAgent>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
    bound_instance_uid: Mutex<Option<InstanceUid>>,
}

impl SessionHandle {
    /// Creates the handle and the mailbox its writer loop drains.
    pub fn new(
        connection_id: Uuid,
        out_queue_cap: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<ServerToAgent>) {
        let (outbound, mailbox) = mpsc::channel(out_queue_cap.max(1));
        (
            Arc::new(Self {
                connection_id,
                outbound,
                cancel,
                close_reason: Mutex::new(None),
                bound_instance_uid: Mutex::new(None),
            }),
            mailbox,
        )
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn bound_instance_uid(&self) -> Option<InstanceUid> {
        *self
            .bound_instance_uid
            .lock()
            .expect("bound uid lock poisoned")
    }

    /// Records which agent this connection carries. Set by the session once
    /// the first report identifies the agent.
    pub fn set_bound(&self, instance_uid: InstanceUid) {
        *self
            .bound_instance_uid
            .lock()
            .expect("bound uid lock poisoned") = Some(instance_uid);
    }

    /// Non-blocking append to the outbound queue. `QueueFull` tells the
    /// caller to leave redelivery to the reconciliation loop rather than
    /// block or double-send.
    pub fn enqueue(&self, frame: ServerToAgent) -> EnqueueResult {
        if self.cancel.is_cancelled() {
            return EnqueueResult::Closed;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => EnqueueResult::Accepted,
            Err(TrySendError::Full(_)) => EnqueueResult::QueueFull,
            Err(TrySendError::Closed(_)) => EnqueueResult::Closed,
        }
    }

    /// Cancels the session. The first reason wins; later calls are no-ops.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut current = self.close_reason.lock().expect("close reason lock poisoned");
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().expect("close reason lock poisoned")
    }

    async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

enum Inbound {
    Payload(Vec<u8>),
    NotBinary,
    PeerClosed,
    TransportError,
}

/// Drives one connection to completion. Constructed by the endpoint after
/// the WebSocket upgrade.
pub struct Session {
    handle: Arc<SessionHandle>,
    registry: Arc<ConnectionRegistry>,
    processor: Arc<dyn ReportProcessor>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        handle: Arc<SessionHandle>,
        registry: Arc<ConnectionRegistry>,
        processor: Arc<dyn ReportProcessor>,
        config: SessionConfig,
    ) -> Self {
        Self {
            handle,
            registry,
            processor,
            config,
        }
    }

    /// Runs the session until either side closes or a lifecycle error
    /// cancels it. Returns once both loops have exited and the close frame
    /// has been offered to the peer.
    pub async fn run(self, socket: WebSocket, mailbox: mpsc::Receiver<ServerToAgent>) {
        let (sink, stream) = socket.split();

        let writer_handle = self.handle.clone();
        let writer = tokio::spawn(writer_loop(sink, mailbox, writer_handle));

        self.read_side(stream).await;

        // Whatever ended the read side, make sure the writer unblocks.
        self.handle.close(CloseReason::Normal);
        let _ = writer.await;
    }

    async fn read_side(&self, mut stream: SplitStream<WebSocket>) {
        let mut decode_errors: u32 = 0;

        // Init: the first frame must arrive within the handshake window.
        let deadline = tokio::time::Instant::now() + self.config.init_timeout;
        loop {
            if self.handle.is_closed() {
                return;
            }
            let inbound = tokio::select! {
                _ = self.handle.cancelled() => return,
                inbound = tokio::time::timeout_at(deadline, next_inbound(&mut stream)) => inbound,
            };
            match inbound {
                Err(_elapsed) => {
                    warn!(
                        connection_id = %self.handle.connection_id(),
                        "no AgentToServer within the handshake window"
                    );
                    self.handle.close(CloseReason::HandshakeTimeout);
                    return;
                }
                Ok(inbound) => {
                    if self.process_inbound(inbound, &mut decode_errors).await {
                        break;
                    }
                    if self.handle.is_closed() {
                        return;
                    }
                }
            }
        }

        // Reader loop: apply errors keep the loop alive, transport errors
        // cancel the session.
        loop {
            let inbound = tokio::select! {
                _ = self.handle.cancelled() => return,
                inbound = next_inbound(&mut stream) => inbound,
            };
            self.process_inbound(inbound, &mut decode_errors).await;
            if self.handle.is_closed() {
                return;
            }
        }
    }

    /// Handles one inbound message. Returns true once a frame has been
    /// decoded and applied, which is what ends the init phase.
    async fn process_inbound(&self, inbound: Inbound, decode_errors: &mut u32) -> bool {
        match inbound {
            Inbound::Payload(payload) => match frame::decode(&payload) {
                Ok(report) => {
                    *decode_errors = 0;
                    self.apply_report(report).await;
                    true
                }
                Err(err) => {
                    self.count_decode_error(decode_errors, &err);
                    false
                }
            },
            Inbound::NotBinary => {
                self.count_decode_error(decode_errors, &FrameError::BadFrame("text frame"));
                false
            }
            Inbound::PeerClosed => {
                debug!(connection_id = %self.handle.connection_id(), "peer closed the connection");
                self.handle.close(CloseReason::Normal);
                false
            }
            Inbound::TransportError => {
                self.handle.close(CloseReason::TransportError);
                false
            }
        }
    }

    async fn apply_report(&self, report: opamp_proto::proto::AgentToServer) {
        match self.processor.apply(report).await {
            Ok(outcome) => self.settle(outcome),
            Err(err) => {
                // An ill-formed report must not kill the connection.
                warn!(
                    connection_id = %self.handle.connection_id(),
                    error_msg = %err,
                    "failed to apply agent report"
                );
            }
        }
    }

    /// Applies the usecase outcome to this connection: binds the agent on
    /// first contact, pushes whatever the usecase asked for, honours a
    /// disconnect announcement.
    fn settle(&self, outcome: ApplyOutcome) {
        if self.handle.bound_instance_uid() != Some(outcome.instance_uid) {
            self.handle.set_bound(outcome.instance_uid);
            self.registry
                .bind(self.handle.connection_id(), outcome.instance_uid);
            info!(
                connection_id = %self.handle.connection_id(),
                instance_uid = %outcome.instance_uid,
                "agent bound to connection"
            );
        }
        if let Some(push) = outcome.push {
            match self.handle.enqueue(push) {
                EnqueueResult::Accepted => {}
                EnqueueResult::QueueFull => {
                    // The reconciliation loop owns redelivery.
                    warn!(
                        connection_id = %self.handle.connection_id(),
                        "outbound queue full, deferring push"
                    );
                }
                EnqueueResult::Closed => {}
            }
        }
        if outcome.disconnect {
            debug!(
                connection_id = %self.handle.connection_id(),
                "agent announced disconnect"
            );
            self.handle.close(CloseReason::Normal);
        }
    }

    fn count_decode_error(&self, decode_errors: &mut u32, err: &FrameError) {
        *decode_errors += 1;
        warn!(
            connection_id = %self.handle.connection_id(),
            error_msg = %err,
            consecutive = *decode_errors,
            "dropping undecodable frame"
        );
        if *decode_errors >= MAX_CONSECUTIVE_DECODE_ERRORS {
            self.handle.close(CloseReason::PolicyViolation);
        }
    }
}

async fn next_inbound(stream: &mut SplitStream<WebSocket>) -> Inbound {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(payload))) => return Inbound::Payload(payload.to_vec()),
            Some(Ok(Message::Text(_))) => return Inbound::NotBinary,
            // The transport layer answers pings on its own.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Inbound::PeerClosed,
            Some(Err(_)) => return Inbound::TransportError,
        }
    }
}

/// Drains the outbound queue into the socket. The sink half lives only in
/// this task, so writes are serialized by construction. A failed write keeps
/// the frame in a local slot and retries with capped backoff, preserving the
/// enqueue order; persistent failure cancels the session.
async fn writer_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut mailbox: mpsc::Receiver<ServerToAgent>,
    handle: Arc<SessionHandle>,
) {
    let mut backoff = WRITE_BACKOFF_INITIAL;
    let mut retries: u32 = 0;
    let mut pending: Option<ServerToAgent> = None;

    loop {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => {
                tokio::select! {
                    _ = handle.cancelled() => break,
                    maybe = mailbox.recv() => match maybe {
                        Some(frame) => frame,
                        None => break,
                    },
                }
            }
        };

        let payload = frame::encode(&frame);
        match sink.send(Message::Binary(payload.into())).await {
            Ok(()) => {
                backoff = WRITE_BACKOFF_INITIAL;
                retries = 0;
            }
            Err(err) => {
                retries += 1;
                if retries > MAX_WRITE_RETRIES {
                    warn!(
                        connection_id = %handle.connection_id(),
                        error_msg = %err,
                        "giving up on outbound frame, transport is dead"
                    );
                    handle.close(CloseReason::TransportError);
                    break;
                }
                debug!(
                    connection_id = %handle.connection_id(),
                    error_msg = %err,
                    retry = retries,
                    "write failed, backing off"
                );
                pending = Some(frame);
                tokio::select! {
                    _ = handle.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = crate::utils::retry::next_backoff(backoff, WRITE_BACKOFF_CAP);
            }
        }
    }

    let reason = handle.close_reason().unwrap_or(CloseReason::Normal);
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: reason.close_code(),
            reason: reason.as_str().into(),
        })))
        .await;
}
