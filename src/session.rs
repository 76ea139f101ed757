//! Per-socket XMPP session.
//!
//! A [`Session`] owns the protocol client for one socket connection and folds
//! three event sources into one sequential loop: socket commands, client
//! lifecycle events and inbound stanzas. Listeners reach the session's
//! services through a [`SessionHandle`].

use crate::client::{BoundJid, ClientEvent, ClientHandle, Connector, StanzaSender};
use crate::credentials::{
    normalize_anonymous_login, normalize_password_login, LoginRequest, Normalized,
};
use crate::error::{ClientError, CredentialsError, ErrorNotification, ReplyError};
use crate::jid::{Jid, JidKind};
use crate::listener::{Dispatch, Listener, ListenerChain};
use crate::socket::{CommandHandler, CommandRegistry, SocketCommand, SocketTx};
use crate::stanza::Element;
use crate::tracker::{ReplyCallback, Taken, Tracker};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument, Span};

pub const EVENT_LOGIN: &str = "xmpp.login";
pub const EVENT_LOGIN_ANONYMOUS: &str = "xmpp.login.anonymous";
pub const EVENT_LOGOUT: &str = "xmpp.logout";
pub const EVENT_ERROR: &str = "xmpp.error";
pub const EVENT_CONNECTION: &str = "xmpp.connection";

/// How long a tracked stanza waits for its reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// How often expired tracked stanzas are swept.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Domain appended to password-login identities without one.
    pub default_host: Option<String>,
    /// `None` keeps tracked stanzas until their reply arrives.
    pub reply_timeout: Option<Duration>,
    /// Period of the expiry sweep; at least one millisecond.
    pub sweep_interval: Duration,
    /// Prefix of generated stanza ids.
    pub id_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_host: None,
            reply_timeout: Some(DEFAULT_REPLY_TIMEOUT),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            id_prefix: "bridge".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Online,
}

/// Invoked with `true` once a logout has torn the client down.
pub type LogoutCallback = Box<dyn FnOnce(bool) + Send>;

#[derive(Default)]
struct Identity {
    jid: Option<Jid>,
    domain: Option<String>,
}

struct Shared {
    socket: SocketTx,
    tracker: Mutex<Tracker>,
    commands: Mutex<CommandRegistry>,
    identity: RwLock<Identity>,
    outbound: RwLock<Option<StanzaSender>>,
    id_prefix: String,
    id_counter: AtomicU64,
}

/// Services a session exposes to its listeners.
///
/// Cheap to clone. Holding one does not keep the client alive: once the
/// session logs out, `send` reports failure.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Shared>,
}

impl SessionHandle {
    fn new(socket: SocketTx, config: &SessionConfig) -> Self {
        Self {
            inner: Arc::new(Shared {
                socket,
                tracker: Mutex::new(Tracker::new(config.reply_timeout)),
                commands: Mutex::new(CommandRegistry::default()),
                identity: RwLock::new(Identity::default()),
                outbound: RwLock::new(None),
                id_prefix: config.id_prefix.clone(),
                id_counter: AtomicU64::new(1),
            }),
        }
    }

    pub fn socket(&self) -> &SocketTx {
        &self.inner.socket
    }

    /// Emit a notification on the socket.
    pub fn emit(&self, event: &str, data: Value) {
        self.inner.socket.send(event, data);
    }

    /// Hand a stanza to the live client. Returns false when there is none.
    pub fn send(&self, stanza: Element) -> bool {
        let outbound = self.inner.outbound.read();
        match outbound.as_ref() {
            Some(sender) => sender.send(stanza),
            None => {
                debug!(stanza = %stanza, "No live client, dropping outbound stanza");
                false
            }
        }
    }

    /// Fresh id for an outbound stanza, unique within this session.
    pub fn next_id(&self) -> String {
        let n = self.inner.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.inner.id_prefix, n)
    }

    /// Route the reply carrying `id` to `callback` instead of the listeners.
    /// A callback already waiting on the same id is failed with
    /// [`ReplyError::Replaced`].
    pub fn track_id(&self, id: impl Into<String>, callback: ReplyCallback) {
        self.sweep_tracked();
        let replaced = self.inner.tracker.lock().track(id, callback);
        if let Some(replaced) = replaced {
            replaced(Err(ReplyError::Replaced));
        }
    }

    /// Send `stanza` and track its reply. An id is assigned when the stanza
    /// has none. Returns the id, or `None` if there is no live client, in
    /// which case `callback` has already been failed with
    /// [`ReplyError::NotSent`].
    pub fn request(&self, mut stanza: Element, callback: ReplyCallback) -> Option<String> {
        let id = match stanza.id() {
            Some(id) => id.to_string(),
            None => {
                let id = self.next_id();
                stanza.set_attr("id", id.clone());
                id
            }
        };
        self.track_id(id.clone(), callback);
        if self.send(stanza) {
            return Some(id);
        }
        let callback = self.inner.tracker.lock().remove(&id);
        if let Some(callback) = callback {
            callback(Err(ReplyError::NotSent));
        }
        None
    }

    /// Deliver `stanza` to the callback tracking its id. Returns false when
    /// nothing was waiting for it. A reply past its timeout fails the
    /// callback and is left to the listeners.
    pub fn catch_tracked(&self, stanza: &Element) -> bool {
        let taken = self.inner.tracker.lock().take(stanza);
        match taken {
            Some(Taken::Reply(callback)) => {
                callback(Ok(stanza));
                true
            }
            Some(Taken::Late(callback)) => {
                callback(Err(ReplyError::Timeout));
                false
            }
            None => false,
        }
    }

    /// Fail tracked stanzas whose reply timeout elapsed.
    pub fn sweep_tracked(&self) -> usize {
        let expired = self.inner.tracker.lock().evict_expired(Instant::now());
        let count = expired.len();
        for (_, callback) in expired {
            callback(Err(ReplyError::Timeout));
        }
        count
    }

    /// Fail every tracked stanza with `reason`.
    fn fail_tracked(&self, reason: ReplyError) {
        let pending = self.inner.tracker.lock().drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), reason = %reason, "Failing pending tracked stanzas");
        }
        for (_, callback) in pending {
            callback(Err(reason));
        }
    }

    pub fn pending_tracked(&self) -> usize {
        self.inner.tracker.lock().len()
    }

    /// The bound address in the requested form; `None` until online.
    pub fn jid(&self, kind: JidKind) -> Option<String> {
        self.inner
            .identity
            .read()
            .jid
            .as_ref()
            .map(|jid| jid.project(kind))
    }

    pub fn full_jid(&self) -> Option<String> {
        self.jid(JidKind::Full)
    }

    pub fn bare_jid(&self) -> Option<String> {
        self.jid(JidKind::Bare)
    }

    /// Domain of the current login, known from the moment it starts.
    pub fn domain(&self) -> Option<String> {
        let identity = self.inner.identity.read();
        identity
            .jid
            .as_ref()
            .map(|jid| jid.domain().to_string())
            .or_else(|| identity.domain.clone())
    }

    /// Register a handler for a socket event.
    pub fn on(&self, event: &str, handler: CommandHandler) {
        if self.inner.commands.lock().on(event, handler) {
            debug!(event, "Replaced socket event handler");
        }
    }

    pub fn off(&self, event: &str) -> bool {
        self.inner.commands.lock().off(event)
    }

    fn command(&self, event: &str) -> Option<CommandHandler> {
        self.inner.commands.lock().get(event)
    }

    fn set_outbound(&self, sender: Option<StanzaSender>) {
        *self.inner.outbound.write() = sender;
    }

    fn begin_login(&self, domain: String) {
        let mut identity = self.inner.identity.write();
        identity.jid = None;
        identity.domain = Some(domain);
    }

    fn set_bound(&self, jid: Jid) {
        let mut identity = self.inner.identity.write();
        identity.domain = Some(jid.domain().to_string());
        identity.jid = Some(jid);
    }

    fn reset_identity(&self) {
        *self.inner.identity.write() = Identity::default();
    }
}

/// One socket connection's XMPP session.
pub struct Session<C: Connector> {
    connector: C,
    handle: SessionHandle,
    listeners: ListenerChain,
    client: Option<ClientHandle>,
    state: ConnectionState,
    config: SessionConfig,
    span: Span,
}

impl<C: Connector> Session<C> {
    pub fn new(
        connector: C,
        socket: SocketTx,
        config: SessionConfig,
        listeners: Vec<Box<dyn Listener>>,
    ) -> Self {
        Self {
            connector,
            handle: SessionHandle::new(socket, &config),
            listeners: ListenerChain::new(listeners),
            client: None,
            state: ConnectionState::Disconnected,
            config,
            span: Span::none(),
        }
    }

    /// Span the run loop is instrumented with.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn jid(&self, kind: JidKind) -> Option<String> {
        self.handle.jid(kind)
    }

    /// Put `listener` ahead of all others. It is initialized right away when
    /// the session is already online.
    pub fn add_listener(&mut self, mut listener: Box<dyn Listener>) {
        if self.state == ConnectionState::Online {
            listener.init(self.handle.clone());
        }
        debug!(listener = listener.name(), "Adding listener");
        self.listeners.push_front(listener);
    }

    pub fn clear_listeners(&mut self) {
        self.listeners.clear();
    }

    pub fn listener_names(&self) -> Vec<&'static str> {
        self.listeners.names()
    }

    pub fn handle_command(&mut self, command: SocketCommand) {
        let SocketCommand { event, data, ack } = command;
        match event.as_str() {
            EVENT_LOGIN => self.login(data),
            EVENT_LOGIN_ANONYMOUS => self.anonymous_login(data),
            EVENT_LOGOUT => {
                let callback = ack.map(|ack| {
                    Box::new(move |ok: bool| ack.ok(json!(ok))) as LogoutCallback
                });
                self.logout(callback);
            }
            other => match self.handle.command(other) {
                Some(handler) => handler(&self.handle, data, ack),
                None => debug!(event = other, "No handler for socket event"),
            },
        }
    }

    /// Password login. Any live client is discarded first.
    pub fn login(&mut self, data: Value) {
        self.logout(Some(Box::new(|_: bool| {})));
        let request = LoginRequest::from_value(&data);
        match normalize_password_login(&request, self.config.default_host.as_deref()) {
            Ok(normalized) => self.connect(normalized),
            Err(err) => self.reject_login(err, data),
        }
    }

    /// Anonymous login. A request without an identity is dropped silently.
    pub fn anonymous_login(&mut self, data: Value) {
        self.logout(Some(Box::new(|_: bool| {})));
        let request = LoginRequest::from_value(&data);
        match normalize_anonymous_login(&request) {
            Ok(normalized) => self.connect(normalized),
            Err(CredentialsError::MissingJid) => {
                debug!("Anonymous login without jid, ignoring");
            }
            Err(err) => self.reject_login(err, data),
        }
    }

    fn reject_login(&mut self, err: CredentialsError, request: Value) {
        warn!(error = %err, "Rejected login request");
        self.handle.emit(
            EVENT_ERROR,
            ErrorNotification::client_error(&err, request).to_value(),
        );
    }

    fn connect(&mut self, normalized: Normalized) {
        let Normalized {
            credentials,
            domain,
        } = normalized;
        info!(jid = %credentials.jid, domain = %domain, "Connecting to XMPP server");
        self.handle.begin_login(domain);
        let client = self.connector.connect(credentials);
        self.handle.set_outbound(Some(client.sender()));
        self.client = Some(client);
        self.state = ConnectionState::Connecting;
    }

    /// Tear down the live client, if any.
    ///
    /// With a callback the socket stays open and the callback gets `true`;
    /// without one the socket is closed as well.
    pub fn logout(&mut self, callback: Option<LogoutCallback>) {
        let Some(client) = self.client.take() else {
            return;
        };
        client.end();
        self.handle.set_outbound(None);
        self.handle.fail_tracked(ReplyError::Disconnected);
        self.handle.reset_identity();
        self.state = ConnectionState::Disconnected;
        info!("Logged out");
        match callback {
            Some(callback) => callback(true),
            None => self.handle.socket().end(),
        }
    }

    pub fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Online(bound) => self.online(bound),
            ClientEvent::Error(err) => self.protocol_error(err),
            ClientEvent::Stanza(stanza) => self.handle_stanza(&stanza),
        }
    }

    /// Handle every client event already queued, without waiting. Returns
    /// how many were handled.
    pub fn drain_client_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(event) = self
            .client
            .as_mut()
            .and_then(|client| client.try_next_event())
        {
            self.handle_client_event(event);
            handled += 1;
        }
        handled
    }

    fn online(&mut self, bound: BoundJid) {
        let jid = Jid::new(Some(&bound.user), &bound.domain, Some(&bound.resource));
        let full = jid.to_string();
        info!(jid = %full, "Connected");
        self.handle.set_bound(jid);
        self.state = ConnectionState::Online;
        self.listeners.init_all(&self.handle);
        self.handle.emit(
            EVENT_CONNECTION,
            json!({ "status": "online", "jid": full }),
        );
    }

    fn protocol_error(&mut self, err: ClientError) {
        error!(kind = err.kind(), error = %err, "XMPP client error");
        self.state = ConnectionState::Disconnected;
        self.handle.set_outbound(None);
        self.handle.fail_tracked(ReplyError::Disconnected);
        self.handle
            .emit(EVENT_ERROR, ErrorNotification::from_client_error(&err).to_value());
    }

    /// Tracked replies go to their callback; everything else walks the chain.
    pub fn handle_stanza(&mut self, stanza: &Element) {
        debug!(stanza = %stanza, "Stanza received");
        if self.handle.catch_tracked(stanza) {
            return;
        }
        match self.listeners.dispatch(stanza) {
            Dispatch::Stopped(listener) => debug!(listener, "Stanza handled"),
            Dispatch::Claimed => debug!("Stanza handled without stopping the chain"),
            Dispatch::Unclaimed => info!(stanza = %stanza, "No listeners for stanza"),
        }
    }

    /// Drive the session until the command channel closes, then end the
    /// client and release the listeners.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SocketCommand>) {
        let span = self.span.clone();
        async move {
            let period = self.config.sweep_interval.max(Duration::from_millis(1));
            let mut sweep = tokio::time::interval(period);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    command = commands.recv() => match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    },
                    event = next_client_event(&mut self.client) => {
                        self.handle_client_event(event);
                    }
                    _ = sweep.tick() => {
                        let evicted = self.handle.sweep_tracked();
                        if evicted > 0 {
                            debug!(evicted, "Swept expired tracked stanzas");
                        }
                    }
                }
            }
            self.shutdown();
        }
        .instrument(span)
        .await
    }

    fn shutdown(&mut self) {
        self.clear_listeners();
        if let Some(client) = self.client.take() {
            client.end();
        }
        self.handle.set_outbound(None);
        self.handle.fail_tracked(ReplyError::Disconnected);
        self.state = ConnectionState::Disconnected;
        debug!("Session closed");
    }
}

async fn next_client_event(client: &mut Option<ClientHandle>) -> ClientEvent {
    match client {
        Some(client) => client.next_event().await,
        None => std::future::pending().await,
    }
}
