use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use shared_config::AppConfig;
use shared_models::auth::BearerToken;
use shared_utils::token::TokenProvider;

use crate::services::codec::{decode_inbound, encode_outbound};
use crate::services::endpoint::{EndpointResolver, FixedEndpoint, ProbingResolver, SocketTarget};
use crate::services::registry::{panic_message, ListenerRegistry, Subscription};
use crate::services::socket::{
    redact, InboundFrame, OutboundFrame, SocketChannel, SocketConnector, WsConnector,
};
use crate::{
    ChatMessage, CloseCode, ConnectOptions, ConnectionState, InboundEvent, SenderType,
    TransportError,
};

macro_rules! lifecycle {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

struct TransportState {
    /// Bumped on every connect/disconnect; a session driver whose
    /// generation is stale must not touch anything.
    generation: u64,
    session_id: Option<String>,
    connection_state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<OutboundFrame>>,
    reconnect_attempts: u32,
    driver: Option<JoinHandle<()>>,
    verbose: bool,
}

struct Core {
    config: AppConfig,
    connector: Arc<dyn SocketConnector>,
    resolver: Arc<dyn EndpointResolver>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    state: Mutex<TransportState>,
    messages: ListenerRegistry<ChatMessage>,
    connection: ListenerRegistry<bool>,
    errors: ListenerRegistry<Arc<TransportError>>,
}

/// Owns the single live chat connection.
///
/// Cloning yields another handle to the same transport. When the last handle
/// is dropped the connection is torn down as if `disconnect` had been called.
///
/// Socket events, reconnect timers and handler dispatch all run on one
/// spawned task per connect call, so handlers for a given connection never
/// run concurrently with each other.
#[derive(Clone)]
pub struct ChatTransport {
    owner: Arc<Owner>,
}

struct Owner {
    core: Arc<Core>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

pub struct ChatTransportBuilder {
    config: AppConfig,
    connector: Option<Arc<dyn SocketConnector>>,
    resolver: Option<Arc<dyn EndpointResolver>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl ChatTransportBuilder {
    pub fn connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn build(self) -> ChatTransport {
        let resolver: Arc<dyn EndpointResolver> = match self.resolver {
            Some(resolver) => resolver,
            None if self.config.has_endpoint_candidates() => {
                Arc::new(ProbingResolver::from_config(&self.config))
            }
            None => Arc::new(FixedEndpoint::new(self.config.chat_ws_endpoint.clone())),
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new()) as Arc<dyn SocketConnector>);

        ChatTransport {
            owner: Arc::new(Owner {
                core: Arc::new(Core {
                    config: self.config,
                    connector,
                    resolver,
                    token_provider: self.token_provider,
                    state: Mutex::new(TransportState {
                        generation: 0,
                        session_id: None,
                        connection_state: ConnectionState::Idle,
                        outbound: None,
                        reconnect_attempts: 0,
                        driver: None,
                        verbose: false,
                    }),
                    messages: ListenerRegistry::new("message"),
                    connection: ListenerRegistry::new("connection"),
                    errors: ListenerRegistry::new("error"),
                }),
            }),
        }
    }
}

impl ChatTransport {
    pub fn new(config: AppConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: AppConfig) -> ChatTransportBuilder {
        ChatTransportBuilder {
            config,
            connector: None,
            resolver: None,
            token_provider: None,
        }
    }

    /// Open (or re-open) the connection for `session_id`.
    ///
    /// A no-op when that session is already open. Any other connection is
    /// torn down first. Resolves once the first handshake attempt has either
    /// opened or failed; failures are reported to error handlers, never
    /// returned.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn connect(&self, session_id: &str, token: &str, options: ConnectOptions) {
        let core = &self.owner.core;
        let session_id = session_id.trim();

        if session_id.is_empty() {
            core.report(TransportError::InvalidOptions("session id is empty".to_string()));
            return;
        }
        if let Err(e) = options.validate() {
            core.report(e);
            return;
        }

        let token = match BearerToken::parse(token) {
            Ok(token) => token,
            Err(e) => match core.fresh_token() {
                Some(token) => token,
                None => {
                    core.report(TransportError::Connection(format!("no usable bearer token: {}", e)));
                    return;
                }
            },
        };

        {
            let state = core.state.lock();
            if state.session_id.as_deref() == Some(session_id)
                && state.connection_state == ConnectionState::Open
            {
                debug!("Chat session {} already open, nothing to do", session_id);
                return;
            }
        }

        core.teardown();

        let (ready_tx, ready_rx) = oneshot::channel();
        let generation = {
            let mut state = core.state.lock();
            state.generation += 1;
            state.session_id = Some(session_id.to_string());
            state.connection_state = ConnectionState::Connecting;
            state.reconnect_attempts = 0;
            state.verbose = options.debug;
            state.generation
        };

        let handle = tokio::spawn(run_session(
            core.clone(),
            generation,
            session_id.to_string(),
            token,
            options,
            ready_tx,
        ));

        {
            let mut state = core.state.lock();
            if state.generation == generation {
                state.driver = Some(handle);
            } else {
                // Disconnected while we were spawning.
                handle.abort();
            }
        }

        // An error here means the session was torn down before its first
        // handshake finished.
        let _ = ready_rx.await;
    }

    /// Close the connection on purpose. Never triggers a reconnect and
    /// cancels any pending one. Idempotent.
    pub fn disconnect(&self) {
        self.owner.core.teardown();
    }

    /// Hand a message to the socket. `false` (plus an error notification)
    /// when there is no open connection or the message cannot be written.
    /// Delivery is not acknowledged.
    pub fn send(&self, content: &str, sender_type: SenderType) -> bool {
        let core = &self.owner.core;

        if content.trim().is_empty() {
            core.report(TransportError::EmptyMessage);
            return false;
        }

        let target = {
            let state = core.state.lock();
            match (&state.session_id, &state.outbound, state.connection_state) {
                (Some(session_id), Some(outbound), ConnectionState::Open) => {
                    Some((session_id.clone(), outbound.clone()))
                }
                _ => None,
            }
        };

        let Some((session_id, outbound)) = target else {
            core.report(TransportError::NotConnected);
            return false;
        };

        let frame = match encode_outbound(&session_id, content, &sender_type) {
            Ok(frame) => frame,
            Err(e) => {
                core.report(e);
                return false;
            }
        };

        if outbound.send(OutboundFrame::Text(frame)).is_err() {
            core.report(TransportError::Send("socket is no longer writable".to_string()));
            return false;
        }

        debug!("Sent message to chat {} as {}", session_id, sender_type);
        true
    }

    pub fn on_message<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.owner.core.messages.subscribe(handler)
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.owner.core.connection.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Arc<TransportError>) + Send + Sync + 'static,
    {
        self.owner.core.errors.subscribe(handler)
    }

    pub fn is_connected(&self) -> bool {
        let state = self.owner.core.state.lock();
        state.connection_state == ConnectionState::Open
            && state.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn state(&self) -> ConnectionState {
        self.owner.core.state.lock().connection_state
    }

    pub fn session_id(&self) -> Option<String> {
        self.owner.core.state.lock().session_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.owner.core.state.lock().reconnect_attempts
    }

    pub fn config(&self) -> &AppConfig {
        &self.owner.core.config
    }
}

impl fmt::Debug for ChatTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.owner.core.state.lock();
        f.debug_struct("ChatTransport")
            .field("session_id", &state.session_id)
            .field("state", &state.connection_state)
            .field("reconnect_attempts", &state.reconnect_attempts)
            .finish()
    }
}

impl Core {
    fn report(&self, error: TransportError) {
        debug!("Reporting {} error: {}", error.classification(), error);
        self.errors.dispatch(&Arc::new(error));
    }

    fn fresh_token(&self) -> Option<BearerToken> {
        self.token_provider.as_ref().and_then(|p| p.current_token())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    /// Deliberate close of whatever is live, from `disconnect`, a replacing
    /// `connect`, or the last handle going away.
    fn teardown(&self) {
        let (was_open, driver, outbound, session_id, verbose) = {
            let mut state = self.state.lock();
            let previous = state.connection_state;
            if state.driver.is_none() && state.outbound.is_none() && !previous.is_live() {
                state.session_id = None;
                return;
            }

            state.generation += 1;
            state.connection_state = ConnectionState::Closing;
            (
                previous == ConnectionState::Open,
                state.driver.take(),
                state.outbound.take(),
                state.session_id.take(),
                state.verbose,
            )
        };

        // Cancels the reconnect timer and any probe still in flight.
        if let Some(driver) = driver {
            driver.abort();
        }
        if let Some(outbound) = outbound {
            let _ = outbound.send(OutboundFrame::Close(CloseCode::Normal));
        }

        {
            let mut state = self.state.lock();
            if state.connection_state == ConnectionState::Closing {
                state.connection_state = ConnectionState::Closed;
                state.reconnect_attempts = 0;
            }
        }

        lifecycle!(
            verbose,
            "Disconnected from chat {}",
            session_id.as_deref().unwrap_or("<none>")
        );

        if was_open {
            self.connection.dispatch(&false);
        }
    }

    /// Teardown without notifying anyone; the handles are gone.
    fn shutdown(&self) {
        let (driver, outbound) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.connection_state = ConnectionState::Closed;
            state.session_id = None;
            (state.driver.take(), state.outbound.take())
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        if let Some(outbound) = outbound {
            let _ = outbound.send(OutboundFrame::Close(CloseCode::Normal));
        }
    }

    fn mark_connecting(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.connection_state = ConnectionState::Connecting;
        true
    }

    fn mark_open(&self, generation: u64, outbound: mpsc::UnboundedSender<OutboundFrame>) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.connection_state = ConnectionState::Open;
        state.outbound = Some(outbound);
        state.reconnect_attempts = 0;
        true
    }

    fn mark_closed(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.connection_state = ConnectionState::Closed;
        state.outbound = None;
        true
    }

    fn record_attempt(&self, generation: u64, attempts: u32) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.reconnect_attempts = attempts;
        true
    }

    /// The session driver is finished; forget its handle.
    fn release(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.driver = None;
            state.outbound = None;
            if state.connection_state != ConnectionState::Open {
                state.connection_state = ConnectionState::Closed;
            }
        }
    }

    fn handle_inbound(&self, text: &str) {
        match decode_inbound(text) {
            Ok(InboundEvent::Message(message)) => {
                self.messages.dispatch(&message);
            }
            Ok(InboundEvent::Error(message)) => {
                warn!("Chat server error: {}", message);
                self.report(TransportError::Server(message));
            }
            Ok(InboundEvent::Unrecognized(value)) => {
                debug!("Ignoring unrecognized chat payload: {}", value);
            }
            Err(e) => {
                warn!("Dropping malformed chat payload: {}", e);
                self.report(e);
            }
        }
    }
}

/// Drives one connect call: endpoint resolution, handshakes, the read loop
/// and the bounded reconnect policy.
async fn run_session(
    core: Arc<Core>,
    generation: u64,
    session_id: String,
    token: BearerToken,
    options: ConnectOptions,
    ready_tx: oneshot::Sender<()>,
) {
    let verbose = options.debug;
    let mut ready = Some(ready_tx);
    let target = SocketTarget::new(&core.config, token, options.extra_params.clone());

    let resolver: Arc<dyn EndpointResolver> = match &options.endpoint_candidates {
        Some(candidates) => Arc::new(ProbingResolver::new(
            candidates.clone(),
            core.config.probe_timeout(),
        )),
        None => core.resolver.clone(),
    };

    let resolved = AssertUnwindSafe(resolver.resolve(core.connector.as_ref(), &target))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(panicked("endpoint resolver", payload)));

    let endpoint = match resolved {
        Ok(endpoint) => endpoint,
        Err(e) => {
            if core.mark_closed(generation) {
                warn!("Could not resolve a chat endpoint for {}: {}", session_id, e);
                core.report(e);
                core.release(generation);
            }
            return;
        }
    };

    let mut attempts: u32 = 0;

    loop {
        // Reconnects pick up a refreshed credential when one is available.
        let attempt_target = if attempts > 0 {
            match core.fresh_token() {
                Some(token) => target.with_token(token),
                None => target.clone(),
            }
        } else {
            target.clone()
        };

        let url = match attempt_target.url_for(&endpoint) {
            Ok(url) => url,
            Err(e) => {
                if core.mark_closed(generation) {
                    core.report(e);
                    core.release(generation);
                }
                return;
            }
        };

        if !core.mark_connecting(generation) {
            return;
        }
        lifecycle!(verbose, "Connecting chat {} to {}", session_id, redact(&url));

        let handshake = AssertUnwindSafe(core.connector.connect(&url))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked("socket connector", payload)));

        let close_code = match handshake {
            Ok(SocketChannel { outbound, mut inbound }) => {
                if !core.mark_open(generation, outbound.clone()) {
                    let _ = outbound.send(OutboundFrame::Close(CloseCode::Normal));
                    return;
                }
                attempts = 0;
                lifecycle!(verbose, "Chat {} connected", session_id);
                core.connection.dispatch(&true);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }

                let (code, reason) = loop {
                    match inbound.recv().await {
                        Some(InboundFrame::Text(text)) => core.handle_inbound(&text),
                        Some(InboundFrame::Closed { code, reason }) => break (code, reason),
                        None => break (CloseCode::Abnormal, None),
                    }
                    if !core.is_current(generation) {
                        return;
                    }
                };

                if !core.mark_closed(generation) {
                    return;
                }
                lifecycle!(
                    verbose,
                    "Chat {} closed with code {} ({})",
                    session_id,
                    code.as_u16(),
                    reason.as_deref().unwrap_or("no reason")
                );
                core.connection.dispatch(&false);
                code
            }
            Err(e) => {
                if !core.mark_closed(generation) {
                    return;
                }
                warn!("Chat {} handshake failed: {}", session_id, e);
                core.report(e);
                core.connection.dispatch(&false);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(());
                }
                CloseCode::Abnormal
            }
        };

        // A handler may have disconnected or reconnected us.
        if !core.is_current(generation) {
            return;
        }

        if !close_code.is_abnormal() {
            info!("Chat {} closed normally by the server", session_id);
            break;
        }

        if attempts >= options.max_reconnect_attempts {
            warn!(
                "Chat {} giving up after {} reconnect attempts",
                session_id, attempts
            );
            core.report(TransportError::ReconnectExhausted { attempts });
            break;
        }

        attempts += 1;
        if !core.record_attempt(generation, attempts) {
            return;
        }
        lifecycle!(
            verbose,
            "Reconnecting chat {} in {:?} (attempt {}/{})",
            session_id,
            options.reconnect_delay,
            attempts,
            options.max_reconnect_attempts
        );
        tokio::time::sleep(options.reconnect_delay).await;
    }

    core.release(generation);
}

/// A panicking connector or resolver is a failed attempt, not a dead driver.
fn panicked(component: &str, payload: Box<dyn Any + Send>) -> TransportError {
    let message = panic_message(payload.as_ref());
    error!("Chat {} panicked: {}", component, message);
    TransportError::Connection(format!("{} panicked: {}", component, message))
}
