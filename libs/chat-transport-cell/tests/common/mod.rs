#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use chat_transport_cell::*;
use shared_config::AppConfig;
use shared_utils::test_utils::TestConfig;

/// How the fake server answers one handshake.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Open,
    Fail,
    OpenAfter(Duration),
    Hang,
    Panic,
}

/// Server side of one socket the fake connector opened.
pub struct FakeSocket {
    pub url: Url,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    outbound: Mutex<mpsc::UnboundedReceiver<OutboundFrame>>,
    history: Mutex<Vec<OutboundFrame>>,
}

impl FakeSocket {
    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(InboundFrame::Text(text.to_string()));
    }

    pub fn close(&self, code: CloseCode) {
        let _ = self.inbound.send(InboundFrame::Closed { code, reason: None });
    }

    /// Every frame the client wrote so far, oldest first.
    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        let mut outbound = self.outbound.lock();
        let mut history = self.history.lock();
        while let Ok(frame) = outbound.try_recv() {
            history.push(frame);
        }
        history.clone()
    }

    pub fn sent_texts(&self) -> Vec<serde_json::Value> {
        self.sent_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                OutboundFrame::Text(text) => serde_json::from_str(&text).ok(),
                OutboundFrame::Close(_) => None,
            })
            .collect()
    }

    pub fn was_closed_normally(&self) -> bool {
        self.sent_frames()
            .contains(&OutboundFrame::Close(CloseCode::Normal))
    }
}

/// Scripted in-memory connector.
pub struct FakeConnector {
    default_outcome: Outcome,
    script: Mutex<VecDeque<Outcome>>,
    by_path: Mutex<HashMap<String, Outcome>>,
    attempts: Mutex<Vec<Url>>,
    sockets: Mutex<Vec<Arc<FakeSocket>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Self::with_default(Outcome::Open)
    }

    pub fn with_default(default_outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            default_outcome,
            script: Mutex::new(VecDeque::new()),
            by_path: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
        })
    }

    /// Outcomes for the next handshakes, in order; afterwards the default.
    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script.lock().extend(outcomes);
    }

    /// Fixed outcome for every handshake on `path` (e.g. "/ws/chat").
    pub fn on_path(&self, path: &str, outcome: Outcome) {
        self.by_path.lock().insert(path.to_string(), outcome);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.attempts.lock().clone()
    }

    pub fn sockets(&self) -> Vec<Arc<FakeSocket>> {
        self.sockets.lock().clone()
    }

    pub fn socket(&self, index: usize) -> Arc<FakeSocket> {
        self.sockets.lock()[index].clone()
    }

    pub fn last_socket(&self) -> Arc<FakeSocket> {
        self.sockets
            .lock()
            .last()
            .cloned()
            .expect("no socket has been opened")
    }

    fn next_outcome(&self, url: &Url) -> Outcome {
        if let Some(outcome) = self.by_path.lock().get(url.path()) {
            return *outcome;
        }
        self.script.lock().pop_front().unwrap_or(self.default_outcome)
    }

    fn open(&self, url: &Url) -> SocketChannel {
        let (channel, peer) = SocketChannel::pair();
        let SocketPeer { outbound, inbound } = peer;
        self.sockets.lock().push(Arc::new(FakeSocket {
            url: url.clone(),
            inbound,
            outbound: Mutex::new(outbound),
            history: Mutex::new(Vec::new()),
        }));
        channel
    }
}

#[async_trait]
impl SocketConnector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<SocketChannel, TransportError> {
        self.attempts.lock().push(url.clone());

        match self.next_outcome(url) {
            Outcome::Open => Ok(self.open(url)),
            Outcome::OpenAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.open(url))
            }
            Outcome::Fail => Err(TransportError::HandshakeFailed {
                url: redact(url),
                reason: "connection refused".to_string(),
            }),
            Outcome::Hang => futures::future::pending().await,
            Outcome::Panic => panic!("connector blew up"),
        }
    }
}

/// Everything a transport told its subscribers.
#[derive(Clone, Default)]
pub struct Recorder {
    pub messages: Arc<Mutex<Vec<ChatMessage>>>,
    pub connection: Arc<Mutex<Vec<bool>>>,
    pub errors: Arc<Mutex<Vec<Arc<TransportError>>>>,
}

impl Recorder {
    pub fn attach(transport: &ChatTransport) -> Self {
        let recorder = Self::default();

        let messages = recorder.messages.clone();
        transport.on_message(move |message| messages.lock().push(message.clone()));

        let connection = recorder.connection.clone();
        transport.on_connection_change(move |connected| connection.lock().push(*connected));

        let errors = recorder.errors.clone();
        transport.on_error(move |error| errors.lock().push(error.clone()));

        recorder
    }

    pub fn message_contents(&self) -> Vec<String> {
        self.messages.lock().iter().map(|m| m.content.clone()).collect()
    }

    pub fn connection_changes(&self) -> Vec<bool> {
        self.connection.lock().clone()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn count_errors(&self, predicate: impl Fn(&TransportError) -> bool) -> usize {
        self.errors.lock().iter().filter(|e| predicate(e)).count()
    }
}

pub fn test_config() -> AppConfig {
    TestConfig::default().to_app_config()
}

pub fn transport_with(connector: Arc<FakeConnector>) -> ChatTransport {
    init_tracing();
    ChatTransport::builder(test_config())
        .connector(connector)
        .build()
}

/// Let spawned tasks run without moving the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
