use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::channel::{ChannelError, Frame, FrameSink, FrameSource};

/// Send half of an upgraded socket. Frames from concurrent senders are written one at a time.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.inner
            .lock()
            .await
            .send(message)
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), ChannelError> {
        let frame = CloseFrame {
            code,
            reason: Cow::Owned(reason.to_string()),
        };
        let mut sink = self.inner.lock().await;
        if sink.send(Message::Close(Some(frame))).await.is_ok() {
            return Ok(());
        }
        // The peer closed first and the socket refuses new frames. Closing the sink flushes
        // the close reply queued when the peer's frame was read.
        sink.close()
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }
}

/// Receive half of an upgraded socket.
///
/// Ends with [`ChannelError::Expired`] once the connection outlives its lifetime ceiling and
/// with [`ChannelError::Cancelled`] once the server starts shutting down.
pub struct WsSource {
    stream: SplitStream<WebSocket>,
    deadline: Instant,
    shutdown: watch::Receiver<bool>,
}

impl WsSource {
    pub fn new(
        stream: SplitStream<WebSocket>,
        lifetime: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            deadline: Instant::now() + lifetime,
            shutdown,
        }
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Result<Frame, ChannelError> {
        loop {
            let next = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Err(ChannelError::Cancelled),
                next = tokio::time::timeout_at(self.deadline, self.stream.next()) => next,
            };

            let message = match next {
                Err(_) => return Err(ChannelError::Expired),
                Ok(None) => {
                    return Err(ChannelError::Closed {
                        code: None,
                        reason: None,
                    })
                }
                Ok(Some(Err(err))) => return Err(ChannelError::Transport(err.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => return Ok(Frame::Text(text)),
                Message::Binary(data) => return Ok(Frame::Binary(data)),
                Message::Close(frame) => {
                    return Err(ChannelError::Closed {
                        code: frame.as_ref().map(|frame| frame.code),
                        reason: frame.map(|frame| frame.reason.into_owned()),
                    })
                }
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the server is gone, which ends the session the same way.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
