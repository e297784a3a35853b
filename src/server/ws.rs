//! Bridge transport over an axum WebSocket

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use crate::bridge::{Frame, FrameReader, FrameWriter, SinkError};

/// Split a socket into the halves the bridge's writer task owns
pub fn split(socket: WebSocket) -> (WsFrameWriter, WsFrameReader) {
    let (sink, stream) = socket.split();
    (WsFrameWriter { sink }, WsFrameReader { stream })
}

pub struct WsFrameWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), SinkError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes),
            Frame::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }
}

pub struct WsFrameReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn wait_closed(&mut self) {
        // Inbound data is not part of the protocol; only a close matters
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}
