//! WebSocket frame abstraction.
//!
//! The relay side speaks through axum's WebSocket type and the client side
//! through tokio-tungstenite. Both are reduced to [`Frame`] so the connection
//! loops are written once.

use std::borrow::Cow;

use futures_util::{Stream, StreamExt};

use crate::error::{Error, Result};

/// Transport-level view of one incoming WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary,
    Ping,
    Pong,
    Close,
}

/// WebSocket message type of one of the supported transports.
pub trait WireMessage: Sized + Send + 'static {
    fn text(text: String) -> Self;
    /// Close frame with the normal-closure status code.
    fn close_normal() -> Self;
    fn into_frame(self) -> Frame;
}

impl WireMessage for axum::extract::ws::Message {
    fn text(text: String) -> Self {
        Self::Text(text)
    }

    fn close_normal() -> Self {
        Self::Close(Some(axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: Cow::Borrowed("closing connection"),
        }))
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::Text(text),
            Self::Binary(_) => Frame::Binary,
            Self::Ping(_) => Frame::Ping,
            Self::Pong(_) => Frame::Pong,
            Self::Close(_) => Frame::Close,
        }
    }
}

impl WireMessage for tokio_tungstenite::tungstenite::Message {
    fn text(text: String) -> Self {
        Self::Text(text)
    }

    fn close_normal() -> Self {
        use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
        Self::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("closing connection"),
        }))
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::Text(text),
            Self::Binary(_) => Frame::Binary,
            Self::Ping(_) => Frame::Ping,
            Self::Pong(_) => Frame::Pong,
            Self::Close(_) => Frame::Close,
            // Raw frames only surface when writing.
            Self::Frame(_) => Frame::Binary,
        }
    }
}

/// Next text payload from `stream`.
///
/// Ping and pong frames are skipped. `None` means the peer closed or the
/// stream ended; a binary frame or transport failure is an error.
pub async fn next_text<S, M, E>(stream: &mut S) -> Option<Result<String>>
where
    S: Stream<Item = std::result::Result<M, E>> + Unpin,
    M: WireMessage,
    E: Into<Error>,
{
    loop {
        let msg = match stream.next().await? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e.into())),
        };
        match msg.into_frame() {
            Frame::Text(text) => return Some(Ok(text)),
            Frame::Ping | Frame::Pong => continue,
            Frame::Binary => return Some(Err(Error::UnsupportedFrame("binary"))),
            Frame::Close => return None,
        }
    }
}
