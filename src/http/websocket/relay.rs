//! Bidirectional message relay between the client and the backend.
//!
//! # Data Flow
//! ```text
//! Client ──── messages ───▶ relay (client to upstream) ───▶ Backend
//! Client ◀─── messages ──── relay (upstream to client) ◀─── Backend
//! ```
//!
//! # Design Decisions
//! - One task per direction; each reports exactly one outcome on its own
//!   oneshot channel, so a finished loop never blocks
//! - The session ends at the first outcome; the other is never awaited
//! - Both tasks are aborted on the way out, which drops every socket half
//! - A read failure is forwarded to the other side as a close message
//! - The idle deadline belongs to the session: a message in either
//!   direction resets it, and on expiry both sides are sent a close

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use crate::http::websocket::dial::BackendSocket;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Close reasons must fit a control frame alongside the 2-byte code.
const MAX_REASON_BYTES: usize = 123;

/// How long the relay loops get to deliver their closes after an idle expiry.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Direction of message flow through a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client to upstream"),
            Direction::UpstreamToClient => f.write_str("upstream to client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

/// Code and reason of a close message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
}

impl CloseStatus {
    /// Normal closure carrying `reason`, cut to fit a close frame.
    pub fn normal(reason: &str) -> Self {
        let mut end = reason.len().min(MAX_REASON_BYTES);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        Self {
            code: NORMAL_CLOSURE,
            reason: reason[..end].to_string(),
        }
    }
}

/// How one relay loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The source sent a close message.
    Closed(CloseStatus),
    /// Read or write error, idle timeout, or a connection that vanished.
    Failed(String),
}

impl RelayOutcome {
    /// Structured closes end a session without being errors.
    pub fn is_close(&self) -> bool {
        matches!(self, RelayOutcome::Closed(_))
    }
}

impl Display for RelayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayOutcome::Closed(status) if status.code == NO_STATUS_RECEIVED => {
                write!(f, "close {} (no status)", status.code)
            }
            RelayOutcome::Closed(status) if status.reason.is_empty() => {
                write!(f, "close {}", status.code)
            }
            RelayOutcome::Closed(status) => write!(f, "close {}: {}", status.code, status.reason),
            RelayOutcome::Failed(reason) => f.write_str(reason),
        }
    }
}

/// A websocket message as seen by a relay loop.
pub trait RelayMessage: Sized {
    fn kind(&self) -> MessageKind;

    /// Code and reason of a close message, if it carries one.
    fn close_status(&self) -> Option<CloseStatus>;

    fn close(status: CloseStatus) -> Self;
}

impl RelayMessage for UpstreamMessage {
    fn kind(&self) -> MessageKind {
        match self {
            UpstreamMessage::Text(_) => MessageKind::Text,
            UpstreamMessage::Binary(_) | UpstreamMessage::Frame(_) => MessageKind::Binary,
            UpstreamMessage::Ping(_) => MessageKind::Ping,
            UpstreamMessage::Pong(_) => MessageKind::Pong,
            UpstreamMessage::Close(_) => MessageKind::Close,
        }
    }

    fn close_status(&self) -> Option<CloseStatus> {
        match self {
            UpstreamMessage::Close(Some(frame)) => Some(CloseStatus {
                code: frame.code.into(),
                reason: frame.reason.as_str().to_owned(),
            }),
            _ => None,
        }
    }

    fn close(status: CloseStatus) -> Self {
        UpstreamMessage::Close(Some(UpstreamCloseFrame {
            code: CloseCode::from(status.code),
            reason: status.reason.into(),
        }))
    }
}

impl RelayMessage for ClientMessage {
    fn kind(&self) -> MessageKind {
        match self {
            ClientMessage::Text(_) => MessageKind::Text,
            ClientMessage::Binary(_) => MessageKind::Binary,
            ClientMessage::Ping(_) => MessageKind::Ping,
            ClientMessage::Pong(_) => MessageKind::Pong,
            ClientMessage::Close(_) => MessageKind::Close,
        }
    }

    fn close_status(&self) -> Option<CloseStatus> {
        match self {
            ClientMessage::Close(Some(frame)) => Some(CloseStatus {
                code: frame.code,
                reason: frame.reason.as_str().to_owned(),
            }),
            _ => None,
        }
    }

    fn close(status: CloseStatus) -> Self {
        ClientMessage::Close(Some(ClientCloseFrame {
            code: status.code,
            reason: status.reason.into(),
        }))
    }
}

fn into_upstream(message: ClientMessage) -> UpstreamMessage {
    match message {
        ClientMessage::Text(text) => UpstreamMessage::text(text.as_str()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|frame| UpstreamCloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().into(),
        })),
    }
}

/// Raw frames never come out of a reader; they have no client equivalent.
fn into_client(message: UpstreamMessage) -> Option<ClientMessage> {
    let message = match message {
        UpstreamMessage::Text(text) => ClientMessage::Text(text.as_str().into()),
        UpstreamMessage::Binary(data) => ClientMessage::Binary(data),
        UpstreamMessage::Ping(data) => ClientMessage::Ping(data),
        UpstreamMessage::Pong(data) => ClientMessage::Pong(data),
        UpstreamMessage::Close(frame) => ClientMessage::Close(frame.map(|frame| ClientCloseFrame {
            code: frame.code.into(),
            reason: frame.reason.as_str().into(),
        })),
        UpstreamMessage::Frame(_) => return None,
    };
    Some(message)
}

/// When a message last crossed the tunnel, in either direction.
#[derive(Debug)]
pub struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }

    /// Resolves once nothing has been relayed for `limit`.
    pub async fn wait_idle(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy messages from `source` to `destination` until the first terminal event.
///
/// A close from the source is passed on with its own code and reason (a
/// close without status becomes a normal closure). Any other read failure is
/// passed on as a normal closure carrying the failure text, and so is the
/// reason `stop` resolves with. Every message read touches `activity`.
pub async fn relay<M, R, W, RE, WE, S>(
    mut source: R,
    mut destination: W,
    activity: &Activity,
    stop: S,
) -> RelayOutcome
where
    M: RelayMessage,
    R: Stream<Item = Result<M, RE>> + Unpin,
    W: Sink<M, Error = WE> + Unpin,
    RE: Display,
    WE: Display,
    S: Future<Output = String>,
{
    tokio::pin!(stop);

    loop {
        let next = tokio::select! {
            next = source.next() => next,
            reason = &mut stop => return fail(&mut destination, reason).await,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => return fail(&mut destination, e.to_string()).await,
            None => {
                let reason = "connection closed without a close message".to_string();
                return fail(&mut destination, reason).await;
            }
        };
        activity.touch();

        if message.kind() == MessageKind::Close {
            let status = message.close_status().unwrap_or(CloseStatus {
                code: NO_STATUS_RECEIVED,
                reason: String::new(),
            });
            let outcome = RelayOutcome::Closed(status.clone());
            let payload = if status.code == NO_STATUS_RECEIVED {
                CloseStatus::normal(&outcome.to_string())
            } else {
                status
            };
            let _ = destination.send(M::close(payload)).await;
            return outcome;
        }

        if let Err(e) = destination.send(message).await {
            return RelayOutcome::Failed(e.to_string());
        }
    }
}

async fn fail<M, W>(destination: &mut W, reason: String) -> RelayOutcome
where
    M: RelayMessage,
    W: Sink<M> + Unpin,
{
    let _ = destination.send(M::close(CloseStatus::normal(&reason))).await;
    RelayOutcome::Failed(reason)
}

/// How a tunnel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEnd {
    /// The first relay loop to finish, and how it finished.
    Relay(Direction, RelayOutcome),
    /// Nothing crossed the tunnel for this long.
    Idle(Duration),
}

/// A spawned relay loop. Aborted when dropped, which releases its halves.
struct DirectionTask {
    outcome: oneshot::Receiver<RelayOutcome>,
    stop: Option<oneshot::Sender<String>>,
    handle: AbortHandle,
}

impl DirectionTask {
    /// Ask the loop to close its destination with `reason` and finish.
    fn stop(&mut self, reason: String) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(reason);
        }
    }
}

impl Drop for DirectionTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn spawn_direction<M, R, W, RE, WE>(
    source: R,
    destination: W,
    activity: Arc<Activity>,
) -> DirectionTask
where
    M: RelayMessage + Send + 'static,
    R: Stream<Item = Result<M, RE>> + Unpin + Send + 'static,
    W: Sink<M, Error = WE> + Unpin + Send + 'static,
    RE: Display + Send + 'static,
    WE: Display + Send + 'static,
{
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<String>();

    let task = tokio::spawn(async move {
        let stop = async move {
            match stop_rx.await {
                Ok(reason) => reason,
                Err(_) => future::pending().await,
            }
        };
        let _ = outcome_tx.send(relay(source, destination, &activity, stop).await);
    });

    DirectionTask {
        outcome: outcome_rx,
        stop: Some(stop_tx),
        handle: task.abort_handle(),
    }
}

/// Wait for the first relay loop to finish, or for the session to go idle.
///
/// On idle expiry both loops are stopped, so each side is sent a normal
/// closure naming the timeout, and given [`CLOSE_GRACE`] to deliver it.
async fn finish(
    mut to_upstream: DirectionTask,
    mut to_client: DirectionTask,
    activity: &Activity,
    idle: Option<Duration>,
) -> TunnelEnd {
    let idle_expired = async {
        match idle {
            Some(limit) => {
                activity.wait_idle(limit).await;
                limit
            }
            None => future::pending().await,
        }
    };

    let first = tokio::select! {
        outcome = &mut to_upstream.outcome => Ok((Direction::ClientToUpstream, outcome)),
        outcome = &mut to_client.outcome => Ok((Direction::UpstreamToClient, outcome)),
        limit = idle_expired => Err(limit),
    };

    match first {
        Ok((direction, outcome)) => {
            let outcome = outcome.unwrap_or_else(|_| {
                RelayOutcome::Failed("relay task ended without an outcome".to_string())
            });
            TunnelEnd::Relay(direction, outcome)
        }
        Err(limit) => {
            let reason = format!("idle timeout: no message for {:?}", limit);
            to_upstream.stop(reason.clone());
            to_client.stop(reason);
            let closed = future::join(&mut to_upstream.outcome, &mut to_client.outcome);
            let _ = tokio::time::timeout(CLOSE_GRACE, closed).await;
            TunnelEnd::Idle(limit)
        }
    }
}

/// Relay both directions until the first terminal event from either one, or
/// until the session has been idle for `idle`.
///
/// Both connections are released before this returns or when it is cancelled.
pub async fn run(client: WebSocket, backend: BackendSocket, idle: Option<Duration>) -> TunnelEnd {
    let (client_sink, client_stream) = client.split();
    let (backend_sink, backend_stream) = backend.split();

    let client_stream = client_stream.map(|message| message.map(into_upstream));
    let backend_stream = backend_stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => into_client(message).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });

    let activity = Arc::new(Activity::new());
    let to_upstream = spawn_direction(client_stream, backend_sink, Arc::clone(&activity));
    let to_client = spawn_direction(backend_stream, client_sink, Arc::clone(&activity));

    finish(to_upstream, to_client, &activity, idle).await
}
