//! In-memory connector used by the integration tests.
//!
//! Every accepted connection hands the test a [`ServerSide`] that plays the
//! realtime endpoint: it pushes frames to the client and reads what the
//! client wrote.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{Sink, Stream};
use realtime_sdk::stream::transport::{BoxSocket, Connector, Frame, TransportError};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the connector does on one connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Attempt {
    Accept,
    Refuse,
    Reject(u16),
    Hang,
}

struct ConnectorState {
    script: Mutex<VecDeque<Attempt>>,
    fallback: Mutex<Attempt>,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
    accepted: mpsc::UnboundedSender<ServerSide>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> (Self, Incoming) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(ConnectorState {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Attempt::Accept),
                attempts: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                accepted,
            }),
        };
        (connector, Incoming { rx })
    }

    /// Queues the behaviour of the next attempts, in order.
    pub fn script(&self, attempts: impl IntoIterator<Item = Attempt>) {
        self.state
            .script
            .lock()
            .expect("script lock")
            .extend(attempts);
    }

    /// Behaviour once the script is exhausted.
    pub fn set_fallback(&self, attempt: Attempt) {
        *self.state.fallback.lock().expect("fallback lock") = attempt;
    }

    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.urls.lock().expect("urls lock").clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<BoxSocket, TransportError>> {
        let state = Arc::clone(&self.state);
        let url = url.to_string();
        Box::pin(async move {
            state.attempts.fetch_add(1, Ordering::SeqCst);
            state.urls.lock().expect("urls lock").push(url);
            let attempt = state
                .script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| *state.fallback.lock().expect("fallback lock"));

            match attempt {
                Attempt::Refuse => Err(TransportError::Io("connection refused".to_string())),
                Attempt::Reject(status) => Err(TransportError::Rejected(status)),
                Attempt::Hang => std::future::pending::<Result<BoxSocket, TransportError>>().await,
                Attempt::Accept => {
                    let (to_client, inbound) = mpsc::unbounded_channel();
                    let (outbound, from_client) = mpsc::unbounded_channel();
                    let _ = state.accepted.send(ServerSide {
                        to_client: Some(to_client),
                        from_client,
                    });
                    Ok(Box::pin(MockSocket {
                        inbound,
                        outbound: Some(outbound),
                    }) as BoxSocket)
                }
            }
        })
    }
}

/// Accepted connections, in connect order.
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<ServerSide>,
}

impl Incoming {
    pub async fn accept(&mut self) -> ServerSide {
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    pub async fn expect_no_connection(&mut self, wait: Duration) {
        if let Ok(Some(_)) = timeout(wait, self.rx.recv()).await {
            panic!("unexpected connection");
        }
    }
}

struct MockSocket {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

impl Stream for MockSocket {
    type Item = Result<Frame, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inbound.poll_recv(cx)
    }
}

impl Sink<Frame> for MockSocket {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &self.outbound {
            Some(outbound) if !outbound.is_closed() => Poll::Ready(Ok(())),
            _ => Poll::Ready(Err(TransportError::Io("peer went away".to_string()))),
        }
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        self.get_mut()
            .outbound
            .as_ref()
            .ok_or_else(|| TransportError::Io("socket closed".to_string()))?
            .send(frame)
            .map_err(|_| TransportError::Io("peer went away".to_string()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().outbound = None;
        Poll::Ready(Ok(()))
    }
}

/// Server end of one accepted connection.
pub struct ServerSide {
    to_client: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerSide {
    pub fn send_json(&self, value: Value) {
        self.send_frame(Frame::Text(value.to_string()));
    }

    pub fn send_text(&self, text: &str) {
        self.send_frame(Frame::Text(text.to_string()));
    }

    pub fn send_frame(&self, frame: Frame) {
        if let Some(to_client) = &self.to_client {
            let _ = to_client.send(Ok(frame));
        }
    }

    /// Sends a close frame and stops talking to the client.
    pub fn close(&mut self) {
        self.send_frame(Frame::Close(None));
        self.to_client = None;
    }

    /// Ends the inbound stream without a close frame.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    pub async fn recv_frame(&mut self) -> Option<Frame> {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next text frame written by the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            match self.recv_frame().await {
                Some(Frame::Text(text)) => {
                    return serde_json::from_str(&text).expect("client wrote valid json");
                }
                Some(_) => continue,
                None => panic!("client closed the socket while a frame was expected"),
            }
        }
    }

    /// Next text frame written by the client, verbatim.
    pub async fn recv_text(&mut self) -> String {
        loop {
            match self.recv_frame().await {
                Some(Frame::Text(text)) => return text,
                Some(_) => continue,
                None => panic!("client closed the socket while a frame was expected"),
            }
        }
    }

    /// Asserts the client writes nothing for `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = timeout(wait, self.from_client.recv()).await {
            panic!("unexpected client frame {frame:?}");
        }
    }

    /// Waits until the client closes or drops its end.
    pub async fn closed(&mut self) {
        loop {
            let next = timeout(WAIT, self.from_client.recv())
                .await
                .expect("timed out waiting for the client to close");
            if next.is_none() {
                return;
            }
        }
    }
}
