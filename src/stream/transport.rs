//! Socket abstraction consumed by the connection worker.
//!
//! The worker only needs a stream of inbound frames and a sink for outbound
//! frames. [`TungsteniteConnector`] provides both over `tokio-tungstenite`;
//! tests and embedders can plug in their own [`Connector`].

use std::borrow::Cow;
use std::pin::Pin;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Frame exchanged with the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseInfo>),
}

/// Close code and reason reported by the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Errors produced by a transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The websocket upgrade was answered with a non-101 HTTP status.
    #[error("websocket upgrade rejected with status {0}")]
    Rejected(u16),

    /// The endpoint could not be parsed into a websocket request.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Any other socket-level failure.
    #[error("transport error: {0}")]
    Io(String),
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Http(response) => Self::Rejected(response.status().as_u16()),
            WsError::Url(err) => Self::InvalidEndpoint(err.to_string()),
            other => Self::Io(other.to_string()),
        }
    }
}

/// Bidirectional frame socket.
pub trait Socket:
    Stream<Item = Result<Frame, TransportError>> + Sink<Frame, Error = TransportError> + Send
{
}

impl<T> Socket for T where
    T: Stream<Item = Result<Frame, TransportError>> + Sink<Frame, Error = TransportError> + Send
{
}

/// Owned, type-erased socket handed to the connection worker.
pub type BoxSocket = Pin<Box<dyn Socket>>;

/// Opens sockets for the connection worker.
///
/// `connect` is called once per attempt, including every reconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<BoxSocket, TransportError>>;
}

/// Default connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

impl Connector for TungsteniteConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<BoxSocket, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let (socket, _) = connect_async(url).await?;
            let socket = socket
                .sink_map_err(TransportError::from)
                .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))))
                .filter_map(|item| future::ready(frame_from_message(item)));
            Ok(Box::pin(socket) as BoxSocket)
        })
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Ping(payload) => Message::Ping(payload),
            Frame::Pong(payload) => Message::Pong(payload),
            Frame::Close(info) => Message::Close(info.map(|info| CloseFrame {
                code: CloseCode::from(info.code),
                reason: Cow::Owned(info.reason),
            })),
        }
    }
}

fn frame_from_message(item: Result<Message, WsError>) -> Option<Result<Frame, TransportError>> {
    let message = match item {
        Ok(message) => message,
        Err(err) => return Some(Err(err.into())),
    };
    match message {
        Message::Text(text) => Some(Ok(Frame::Text(text))),
        Message::Binary(bytes) => String::from_utf8(bytes).ok().map(|text| Ok(Frame::Text(text))),
        Message::Ping(payload) => Some(Ok(Frame::Ping(payload))),
        Message::Pong(payload) => Some(Ok(Frame::Pong(payload))),
        Message::Close(frame) => Some(Ok(Frame::Close(frame.map(|frame| CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        })))),
        Message::Frame(_) => None,
    }
}
