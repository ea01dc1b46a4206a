//! The duplex, message-framed channel a session talks through.
//!
//! A channel is split in two halves: the [`FrameSource`] is owned by the session that reads
//! from it, while the [`FrameSink`] is shared (through a [`PeerHandle`]) with every other
//! session that needs to deliver to this peer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use axum::extract::ws::close_code;

/// A single message frame as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed by peer (code: {code:?}, reason: {reason:?})")]
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
    #[error("channel cancelled by server shutdown")]
    Cancelled,
    #[error("connection lifetime expired")]
    Expired,
    #[error("transport error: {0}")]
    Transport(String),
}

/// How a session's receive loop came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The client closed with a normal or going-away code.
    Normal,
    /// Shutdown or the connection lifetime ceiling ended the channel.
    Cancelled,
    /// Anything else: missing close frame, unusual close code, transport failure.
    Abnormal,
}

impl Termination {
    pub fn classify(err: &ChannelError) -> Self {
        match err {
            ChannelError::Closed {
                code: Some(close_code::NORMAL | close_code::AWAY),
                ..
            } => Termination::Normal,
            ChannelError::Cancelled | ChannelError::Expired => Termination::Cancelled,
            ChannelError::Closed { .. } | ChannelError::Transport(_) => Termination::Abnormal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Termination::Normal => "normal",
            Termination::Cancelled => "cancelled",
            Termination::Abnormal => "abnormal",
        }
    }
}

/// Receive half of a channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Blocks until the next data frame arrives. Any error is terminal for the channel.
    async fn recv(&mut self) -> Result<Frame, ChannelError>;
}

/// Send half of a channel, shareable across sessions.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError>;
}

/// Registry-facing handle for one accepted connection.
///
/// Handles are compared by connection id, never by the identity registered through them,
/// so a session can tell whether the registry still points at its own connection.
#[derive(Clone)]
pub struct PeerHandle {
    connection_id: Uuid,
    sink: Arc<dyn FrameSink>,
}

impl PeerHandle {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            sink,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn is_same_connection(&self, other: &PeerHandle) -> bool {
        self.connection_id == other.connection_id
    }

    pub async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.sink.send(Frame::Text(text)).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
        self.sink.close(code, reason).await
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// In-memory channel used by the unit tests to drive sessions without a socket.
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{ChannelError, Frame, FrameSink, FrameSource};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Outbound {
        Frame(Frame),
        Close { code: u16, reason: String },
    }

    pub(crate) struct MemorySource {
        inbound: mpsc::UnboundedReceiver<Result<Frame, ChannelError>>,
    }

    pub(crate) struct MemorySink {
        outbound: mpsc::UnboundedSender<Outbound>,
        broken: Arc<AtomicBool>,
    }

    /// The client's end of an in-memory channel.
    pub(crate) struct MemoryRemote {
        inbound: Option<mpsc::UnboundedSender<Result<Frame, ChannelError>>>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        broken: Arc<AtomicBool>,
    }

    pub(crate) fn pair() -> (MemorySource, Arc<MemorySink>, MemoryRemote) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        (
            MemorySource { inbound: inbound_rx },
            Arc::new(MemorySink {
                outbound: outbound_tx,
                broken: broken.clone(),
            }),
            MemoryRemote {
                inbound: Some(inbound_tx),
                outbound: outbound_rx,
                broken,
            },
        )
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn recv(&mut self) -> Result<Frame, ChannelError> {
            match self.inbound.recv().await {
                Some(result) => result,
                None => Err(ChannelError::Closed {
                    code: None,
                    reason: None,
                }),
            }
        }
    }

    impl MemorySink {
        fn push(&self, outbound: Outbound) -> Result<(), ChannelError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ChannelError::Transport("broken pipe".into()));
            }
            self.outbound
                .send(outbound)
                .map_err(|_| ChannelError::Transport("remote dropped".into()))
        }
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
            self.push(Outbound::Frame(frame))
        }

        async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
            self.push(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
        }
    }

    impl MemoryRemote {
        fn inject(&self, item: Result<Frame, ChannelError>) {
            self.inbound
                .as_ref()
                .expect("remote already hung up")
                .send(item)
                .expect("session dropped its source");
        }

        pub(crate) fn send_json(&self, value: serde_json::Value) {
            self.inject(Ok(Frame::Text(value.to_string())));
        }

        pub(crate) fn send_text(&self, text: &str) {
            self.inject(Ok(Frame::Text(text.to_string())));
        }

        pub(crate) fn send_binary(&self, data: &[u8]) {
            self.inject(Ok(Frame::Binary(data.to_vec())));
        }

        pub(crate) fn fail(&self, err: ChannelError) {
            self.inject(Err(err));
        }

        /// Drops the inbound side; the session sees a close without a status code.
        pub(crate) fn hang_up(&mut self) {
            self.inbound = None;
        }

        /// Makes every later send to this peer fail, as a dead socket would.
        pub(crate) fn break_link(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }

        pub(crate) async fn next_outbound(&mut self) -> Option<Outbound> {
            self.outbound.recv().await
        }

        pub(crate) async fn next_json(&mut self) -> serde_json::Value {
            match self.next_outbound().await {
                Some(Outbound::Frame(Frame::Text(text))) => {
                    serde_json::from_str(&text).expect("server sent invalid json")
                }
                other => panic!("expected a text frame, got {other:?}"),
            }
        }

        pub(crate) fn try_next_outbound(&mut self) -> Option<Outbound> {
            self.outbound.try_recv().ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn normal_and_going_away_closes_are_normal() {
        for code in [close_code::NORMAL, close_code::AWAY] {
            let err = ChannelError::Closed {
                code: Some(code),
                reason: None,
            };
            assert_eq!(Termination::classify(&err), Termination::Normal);
        }
    }

    #[test_timeout::timeout]
    fn missing_close_code_is_abnormal() {
        let err = ChannelError::Closed {
            code: None,
            reason: None,
        };
        assert_eq!(Termination::classify(&err), Termination::Abnormal);
        assert_eq!(
            Termination::classify(&ChannelError::Transport("reset".into())),
            Termination::Abnormal
        );
    }

    #[test_timeout::timeout]
    fn shutdown_and_expiry_are_cancellations() {
        assert_eq!(
            Termination::classify(&ChannelError::Cancelled),
            Termination::Cancelled
        );
        assert_eq!(
            Termination::classify(&ChannelError::Expired),
            Termination::Cancelled
        );
    }

    #[test_timeout::timeout]
    fn handles_compare_by_connection() {
        let (_, sink, _remote) = memory::pair();
        let first = PeerHandle::new(sink.clone());
        let second = PeerHandle::new(sink);
        assert!(first.is_same_connection(&first.clone()));
        assert!(!first.is_same_connection(&second));
    }
}
