//! XMPP external component connection (XEP-0114).
//!
//! One [`XmppComponent`] owns one logical connection to the server's component
//! listener. Three kinds of tasks touch it concurrently:
//!
//! - the connection task: connects, opens the stream, then reads and dispatches
//!   stanzas until the transport fails or the stream closes;
//! - the writer task of the current connection (see `output`);
//! - the one-second scheduler (keep-alive and request retries, see `timer`).
//!
//! Shared state is split into small independent locks (session, correlator, handler
//! registry, QoS ledger, keep-alive) and no callback or event ever runs while one of
//! them is held. Each (re)connection gets a new generation number; tasks of an older
//! generation notice and stop instead of tearing down their successor.

mod config;
mod dispatch;
mod endpoint;
mod error;
mod events;
mod framing;
mod handlers;
mod output;
mod qos;
mod requests;
mod roster;
mod stanza;
mod timer;
mod transport;
mod xml;

pub use config::{ComponentConfig, Identity, DEFAULT_COMPONENT_PORT, MAX_KEEP_ALIVE_SECONDS};
pub use endpoint::{parse_endpoint, Endpoint};
pub use error::{ComponentError, StreamError};
pub use events::{ComponentEvents, ConnectionState};
pub use framing::{FragmentTokenizer, FramingError, Token, MAX_FRAGMENT_SIZE};
pub use handlers::{IqHandler, MessageHandler, NS_DISCO_INFO, NS_PING};
pub use output::WriteCallback;
pub use qos::{DeliveryCallback, OutgoingMessage, QosLevel, NS_QOS};
pub use requests::{ResponseCallback, RetryPolicy};
pub use roster::{RosterItem, RosterLookup, StaticRoster, SubscriptionState};
pub use stanza::{
    bare_jid, Availability, ErrorType, HandlerError, IqRequest, IqResponse, IqType, MessageEvent,
    MessageType, PresenceEvent, PresenceType, StanzaError, StanzaErrorKind,
};
pub use transport::{Connector, TcpConnector, Transport, TCP_CONNECT_TIMEOUT};
pub use xml::{decode, encode, Element, Node, XmlError};

use events::ConnectionState as State;
use handlers::{IqKind, Registry};
use output::OutputQueue;
use qos::AssuredLedger;
use requests::Correlator;
use sha1::{Digest, Sha1};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use xml::StreamHeader;

pub const NS_COMPONENT: &str = "jabber:component:accept";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";

/// Transport read size. Fragments may span any number of reads.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long `shutdown` waits for the stream footer to be written.
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Run application code, reporting a panic instead of unwinding into the engine.
pub(crate) fn guarded(what: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = what, "Callback panicked");
    }
}

struct KeepAlive {
    next_ping: Instant,
    supports_ping: bool,
}

/// Resources of the current connection attempt.
struct Session {
    generation: u64,
    endpoint: Endpoint,
    output: Option<OutputQueue>,
    stream: Option<StreamHeader>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    fn teardown(&mut self) {
        self.output = None;
        self.stream = None;
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
    }
}

struct Inner {
    config: ComponentConfig,
    connector: Arc<dyn Connector>,
    events: Option<Arc<dyn ComponentEvents>>,
    roster: Option<Arc<dyn RosterLookup>>,
    state: Mutex<State>,
    session: Mutex<Session>,
    requests: Mutex<Correlator>,
    registry: RwLock<Registry>,
    ledger: Mutex<AssuredLedger>,
    keep_alive: Mutex<KeepAlive>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.get_mut().unwrap_or_else(PoisonError::into_inner).teardown();
        if let Some(task) = self.timer.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// Builder for [`XmppComponent`].
pub struct ComponentBuilder {
    config: ComponentConfig,
    connector: Option<Arc<dyn Connector>>,
    events: Option<Arc<dyn ComponentEvents>>,
    roster: Option<Arc<dyn RosterLookup>>,
}

impl ComponentBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn events(mut self, events: Arc<dyn ComponentEvents>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn roster(mut self, roster: Arc<dyn RosterLookup>) -> Self {
        self.roster = Some(roster);
        self
    }

    /// Validate the configuration and register the built-in handlers. Nothing
    /// connects until [`XmppComponent::start`].
    pub fn build(self) -> Result<XmppComponent, ComponentError> {
        self.config.validate()?;

        let mut registry = Registry::default();
        registry.register_iq(IqKind::Get, "query", NS_DISCO_INFO, Arc::new(handlers::disco_info), true)?;
        registry.register_iq(IqKind::Get, "ping", NS_PING, Arc::new(handlers::ping), true)?;
        registry.register_iq(IqKind::Set, "acknowledged", NS_QOS, Arc::new(qos::handle_acknowledged), true)?;
        registry.register_iq(IqKind::Set, "assured", NS_QOS, Arc::new(qos::handle_assured), false)?;
        registry.register_iq(IqKind::Set, "deliver", NS_QOS, Arc::new(qos::handle_deliver), false)?;

        let endpoint = Endpoint::new(self.config.host.clone(), self.config.port);
        let keep_alive = self.config.keep_alive_interval();
        Ok(XmppComponent {
            inner: Arc::new(Inner {
                connector: self.connector.unwrap_or_else(|| Arc::new(TcpConnector)),
                events: self.events,
                roster: self.roster,
                state: Mutex::new(State::Connecting),
                session: Mutex::new(Session {
                    generation: 0,
                    endpoint,
                    output: None,
                    stream: None,
                    reader: None,
                    writer: None,
                }),
                requests: Mutex::new(Correlator::default()),
                registry: RwLock::new(registry),
                ledger: Mutex::new(AssuredLedger::default()),
                keep_alive: Mutex::new(KeepAlive {
                    next_ping: Instant::now() + keep_alive,
                    supports_ping: true,
                }),
                timer: Mutex::new(None),
                config: self.config,
            }),
        })
    }
}

/// Handle to an XMPP component connection. Cheap to clone; all clones share the
/// same connection.
#[derive(Clone)]
pub struct XmppComponent {
    inner: Arc<Inner>,
}

/// Handle held by the component's own tasks and stored callbacks. It does not keep
/// the component alive: once the last [`XmppComponent`] is dropped, upgrades fail
/// and the connection is torn down.
#[derive(Clone)]
pub(crate) struct WeakComponent(Weak<Inner>);

impl WeakComponent {
    pub(crate) fn upgrade(&self) -> Option<XmppComponent> {
        self.0.upgrade().map(|inner| XmppComponent { inner })
    }
}

impl std::fmt::Debug for XmppComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppComponent")
            .field("sub_domain", &self.inner.config.component_sub_domain)
            .field("state", &self.state())
            .finish()
    }
}

impl XmppComponent {
    pub fn builder(config: ComponentConfig) -> ComponentBuilder {
        ComponentBuilder {
            config,
            connector: None,
            events: None,
            roster: None,
        }
    }

    pub fn new(config: ComponentConfig) -> Result<Self, ComponentError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Server endpoint used by the current or next connection attempt.
    pub fn endpoint(&self) -> Endpoint {
        lock(&self.inner.session).endpoint.clone()
    }

    /// Start the scheduler and the first connection attempt. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) {
        {
            let mut timer = lock(&self.inner.timer);
            if timer.is_none() {
                *timer = Some(timer::spawn(self.downgrade()));
            }
        }
        self.restart(None);
    }

    /// Drop the current connection, purge pending requests and connect again.
    pub fn reconnect(&self) {
        self.restart(None);
    }

    /// Close the stream politely, then release everything.
    pub async fn shutdown(&self) {
        if self.state() == State::Connected {
            let (tx, rx) = oneshot::channel();
            let footer = self.write(
                "</stream:stream>",
                Some(Box::new(move || {
                    let _ = tx.send(());
                })),
            );
            if footer.is_ok() && tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, rx).await.is_err() {
                warn!("Stream footer not flushed before shutdown");
            }
        }
        self.hard_offline();
        if let Some(task) = lock(&self.inner.timer).take() {
            task.abort();
        }
    }

    /// Drop the transport immediately without closing the stream.
    pub fn hard_offline(&self) {
        {
            let mut session = lock(&self.inner.session);
            session.generation += 1;
            session.teardown();
        }
        let purged = lock(&self.inner.requests).clear();
        info!(purged, "Component offline");
        self.set_state(State::Offline);
    }

    fn restart(&self, endpoint: Option<Endpoint>) {
        let purged = lock(&self.inner.requests).clear();
        {
            let mut session = lock(&self.inner.session);
            session.teardown();
            session.generation += 1;
            if let Some(endpoint) = endpoint {
                session.endpoint = endpoint;
            }
            let generation = session.generation;
            session.reader = Some(tokio::spawn(run_connection(self.downgrade(), generation)));
            debug!(generation, purged, "Connection task started");
        }
        {
            let mut keep_alive = lock(&self.inner.keep_alive);
            keep_alive.supports_ping = true;
            keep_alive.next_ping = Instant::now() + self.inner.config.keep_alive_interval();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.inner.session).generation == generation
    }

    pub(crate) fn downgrade(&self) -> WeakComponent {
        WeakComponent(Arc::downgrade(&self.inner))
    }

    fn process_token(&self, generation: u64, token: Token) -> dispatch::Flow {
        match token {
            Token::StreamOpen(xml) => {
                debug!(xml = %xml, "RX");
                match self.open_stream(&xml) {
                    Ok(()) => dispatch::Flow::Continue,
                    Err(e) => {
                        self.connection_failed(generation, e);
                        dispatch::Flow::Stop
                    }
                }
            }
            Token::Fragment(xml) => {
                debug!(xml = %xml, "RX");
                let stream = lock(&self.inner.session).stream.clone();
                let Some(stream) = stream else {
                    self.connection_failed(generation, ComponentError::Protocol("stanza before stream header".into()));
                    return dispatch::Flow::Stop;
                };
                match xml::parse_fragment(&stream, &xml) {
                    Ok(stanza) => self.process_stanza(generation, stanza),
                    Err(e) => {
                        self.connection_failed(generation, e.into());
                        dispatch::Flow::Stop
                    }
                }
            }
            Token::StreamClosed => {
                info!(generation, "Stream closed by server");
                if self.is_current(generation) {
                    self.hard_offline();
                }
                dispatch::Flow::Stop
            }
        }
    }

    /// Validate the server's stream header and answer with the handshake digest.
    fn open_stream(&self, xml: &str) -> Result<(), ComponentError> {
        let header = xml::parse_stream_header(xml)?;
        let sub_domain = &self.inner.config.component_sub_domain;
        if header.from.as_deref() != Some(sub_domain.as_str()) {
            return Err(ComponentError::Protocol(format!(
                "stream opened from {:?}, expected {}",
                header.from.as_deref().unwrap_or(""),
                sub_domain
            )));
        }
        let stream_id = header.id.clone().unwrap_or_default();
        lock(&self.inner.session).stream = Some(header);

        let digest = handshake_digest(&stream_id, &self.inner.config.shared_secret);
        info!(stream_id = %stream_id, "Stream opened, sending handshake");
        self.write(&format!("<handshake>{digest}</handshake>"), None)
    }

    pub(crate) fn handshake_accepted(&self) {
        info!(sub_domain = %self.inner.config.component_sub_domain, "Handshake accepted");
        self.refresh_keep_alive();
        self.set_state(State::Connected);
    }

    /// Server asked us to move elsewhere. Not reported as an error.
    pub(crate) fn redirect(&self, generation: u64, endpoint: Endpoint) {
        if self.is_current(generation) {
            info!(host = %endpoint.host, port = endpoint.port, "Redirected by server");
            self.restart(Some(endpoint));
        }
    }

    /// Fatal failure of the connection of `generation`; stale generations are ignored.
    pub(crate) fn connection_failed(&self, generation: u64, error: ComponentError) {
        {
            let mut session = lock(&self.inner.session);
            if session.generation != generation {
                debug!(generation, error = %error, "Ignoring error of superseded connection");
                return;
            }
            session.generation += 1;
            session.teardown();
        }
        error!(error = %error, generation, "Connection error");
        if let Some(events) = &self.inner.events {
            events.on_connection_error(&error);
        }
        self.set_state(State::Error);
    }

    fn set_state(&self, state: State) {
        {
            let mut current = lock(&self.inner.state);
            if *current == state {
                return;
            }
            *current = state;
        }
        info!(state = %state, "State changed");
        if let Some(events) = &self.inner.events {
            events.on_state_changed(state);
        }
    }

    pub(crate) fn events(&self) -> Option<&Arc<dyn ComponentEvents>> {
        self.inner.events.as_ref()
    }

    pub(crate) fn refresh_keep_alive(&self) {
        lock(&self.inner.keep_alive).next_ping = Instant::now() + self.inner.config.keep_alive_interval();
    }

    pub(crate) fn lookup_roster(&self, bare_jid: &str) -> Option<RosterItem> {
        self.inner.roster.as_ref()?.lookup(bare_jid)
    }

    /// Queue raw XML on the current connection.
    pub(crate) fn write(&self, xml: &str, on_complete: Option<WriteCallback>) -> Result<(), ComponentError> {
        let output = lock(&self.inner.session)
            .output
            .clone()
            .ok_or(ComponentError::NotConnected)?;
        output.enqueue(xml, on_complete)
    }

    // Handler registry

    pub fn register_iq_get_handler(
        &self,
        local_name: &str,
        namespace: &str,
        handler: IqHandler,
        advertise: bool,
    ) -> Result<(), ComponentError> {
        write(&self.inner.registry).register_iq(IqKind::Get, local_name, namespace, handler, advertise)
    }

    pub fn register_iq_set_handler(
        &self,
        local_name: &str,
        namespace: &str,
        handler: IqHandler,
        advertise: bool,
    ) -> Result<(), ComponentError> {
        write(&self.inner.registry).register_iq(IqKind::Set, local_name, namespace, handler, advertise)
    }

    /// Returns false unless `handler` is the one registered under the key.
    pub fn unregister_iq_get_handler(&self, local_name: &str, namespace: &str, handler: &IqHandler) -> bool {
        write(&self.inner.registry).unregister_iq(IqKind::Get, local_name, namespace, handler)
    }

    pub fn unregister_iq_set_handler(&self, local_name: &str, namespace: &str, handler: &IqHandler) -> bool {
        write(&self.inner.registry).unregister_iq(IqKind::Set, local_name, namespace, handler)
    }

    pub fn register_message_handler(
        &self,
        local_name: &str,
        namespace: &str,
        handler: MessageHandler,
        advertise: bool,
    ) -> Result<(), ComponentError> {
        write(&self.inner.registry).register_message(local_name, namespace, handler, advertise)
    }

    pub fn unregister_message_handler(&self, local_name: &str, namespace: &str, handler: &MessageHandler) -> bool {
        write(&self.inner.registry).unregister_message(local_name, namespace, handler)
    }

    pub fn register_feature(&self, namespace: &str) -> bool {
        write(&self.inner.registry).register_feature(namespace)
    }

    pub fn unregister_feature(&self, namespace: &str) -> bool {
        write(&self.inner.registry).unregister_feature(namespace)
    }

    /// Advertised feature namespaces.
    pub fn features(&self) -> Vec<String> {
        read(&self.inner.registry).features()
    }

    // Outgoing iq

    pub fn send_iq_get(
        &self,
        from: &str,
        to: &str,
        xml: &str,
        callback: impl FnOnce(IqResponse) + Send + 'static,
    ) -> Result<u32, ComponentError> {
        self.send_request(IqType::Get, from, to, xml, Box::new(callback), self.config().default_retry_policy())
    }

    pub fn send_iq_get_with(
        &self,
        from: &str,
        to: &str,
        xml: &str,
        callback: impl FnOnce(IqResponse) + Send + 'static,
        policy: RetryPolicy,
    ) -> Result<u32, ComponentError> {
        self.send_request(IqType::Get, from, to, xml, Box::new(callback), policy)
    }

    pub fn send_iq_set(
        &self,
        from: &str,
        to: &str,
        xml: &str,
        callback: impl FnOnce(IqResponse) + Send + 'static,
    ) -> Result<u32, ComponentError> {
        self.send_request(IqType::Set, from, to, xml, Box::new(callback), self.config().default_retry_policy())
    }

    pub fn send_iq_set_with(
        &self,
        from: &str,
        to: &str,
        xml: &str,
        callback: impl FnOnce(IqResponse) + Send + 'static,
        policy: RetryPolicy,
    ) -> Result<u32, ComponentError> {
        self.send_request(IqType::Set, from, to, xml, Box::new(callback), policy)
    }

    /// Register the request and write it. Fails with `NotConnected`, leaving nothing
    /// pending, when there is no transport.
    fn send_request(
        &self,
        iq_type: IqType,
        from: &str,
        to: &str,
        xml: &str,
        callback: ResponseCallback,
        policy: RetryPolicy,
    ) -> Result<u32, ComponentError> {
        let output = lock(&self.inner.session)
            .output
            .clone()
            .ok_or(ComponentError::NotConnected)?;

        let (seq, iq) = {
            let mut requests = lock(&self.inner.requests);
            let seq = requests.next_sequence();
            let iq = iq_xml(iq_type, &seq.to_string(), from, to, xml);
            requests.insert(seq, to.to_string(), iq.clone(), callback, policy, Instant::now());
            (seq, iq)
        };
        if let Err(e) = output.enqueue(&iq, None) {
            lock(&self.inner.requests).take(seq);
            return Err(e);
        }
        Ok(seq)
    }

    pub fn send_iq_result(&self, request: &IqRequest, xml: &str) -> Result<(), ComponentError> {
        self.send_response(IqType::Result, &request.id, &request.to, &request.from, xml)
    }

    pub fn send_iq_error(&self, request: &IqRequest, error: &StanzaError) -> Result<(), ComponentError> {
        self.send_response(IqType::Error, &request.id, &request.to, &request.from, &error.to_xml())
    }

    pub(crate) fn send_response(
        &self,
        iq_type: IqType,
        id: &str,
        from: &str,
        to: &str,
        xml: &str,
    ) -> Result<(), ComponentError> {
        self.write(&iq_xml(iq_type, id, from, to, xml), None)
    }

    /// Send an iq get and wait for its response, at most `timeout`.
    ///
    /// Returns the response `<iq>` element. An error response becomes
    /// `ComponentError::Stanza`. The timeout is independent of the retry policy.
    pub async fn iq_get(&self, from: &str, to: &str, xml: &str, timeout: Duration) -> Result<Element, ComponentError> {
        self.request(IqType::Get, from, to, xml, timeout).await
    }

    pub async fn iq_set(&self, from: &str, to: &str, xml: &str, timeout: Duration) -> Result<Element, ComponentError> {
        self.request(IqType::Set, from, to, xml, timeout).await
    }

    async fn request(
        &self,
        iq_type: IqType,
        from: &str,
        to: &str,
        xml: &str,
        timeout: Duration,
    ) -> Result<Element, ComponentError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(
            iq_type,
            from,
            to,
            xml,
            Box::new(move |response| {
                let _ = tx.send(response);
            }),
            self.config().default_retry_policy(),
        )?;
        let response = tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| ComponentError::Timeout)?
            .map_err(|_| ComponentError::NotConnected)?;
        if response.ok {
            Ok(response.stanza)
        } else {
            Err(ComponentError::Stanza(
                response
                    .error
                    .unwrap_or_else(|| StanzaError::new(StanzaErrorKind::UndefinedCondition)),
            ))
        }
    }

    /// XEP-0199 ping. An empty `to` leaves the address off.
    pub fn send_ping(
        &self,
        from: &str,
        to: &str,
        callback: impl FnOnce(IqResponse) + Send + 'static,
    ) -> Result<u32, ComponentError> {
        self.send_iq_get(from, to, &format!("<ping xmlns='{NS_PING}'/>"), callback)
    }

    // Messages

    pub fn send_message(
        &self,
        qos: QosLevel,
        message: &OutgoingMessage,
        callback: Option<DeliveryCallback>,
    ) -> Result<(), ComponentError> {
        qos::send_message(self, qos, message, callback)
    }

    pub fn send_chat_message(&self, from: &str, to: &str, body: &str) -> Result<(), ComponentError> {
        self.send_message(QosLevel::Unacknowledged, &OutgoingMessage::chat(from, to, body), None)
    }

    // Presence

    /// Announce availability from `from`. Only allowed while connected.
    ///
    /// `statuses` pairs a language (empty for none) with a status text.
    pub fn set_presence(
        &self,
        from: &str,
        availability: Availability,
        custom_xml: Option<&str>,
        statuses: &[(String, String)],
    ) -> Result<(), ComponentError> {
        if self.state() != State::Connected {
            return Err(ComponentError::NotConnected);
        }
        let presence_type = if availability == Availability::Offline {
            PresenceType::Unavailable
        } else {
            PresenceType::Available
        };
        let mut xml = String::from("<presence");
        push_presence_type(&mut xml, presence_type);
        xml.push_str(&format!(" from='{}'>", encode(from)));
        if let Some(show) = availability.show() {
            xml.push_str(&format!("<show>{show}</show>"));
        }
        for (language, status) in statuses {
            if language.is_empty() {
                xml.push_str(&format!("<status>{}</status>", encode(status)));
            } else {
                xml.push_str(&format!(
                    "<status xml:lang='{}'>{}</status>",
                    encode(language),
                    encode(status)
                ));
            }
        }
        if let Some(custom) = custom_xml {
            xml.push_str(custom);
        }
        xml.push_str("</presence>");
        self.write(&xml, None)
    }

    pub fn request_presence_subscription(&self, from: &str, to: &str) -> Result<(), ComponentError> {
        self.send_presence_request(PresenceType::Subscribe, from, to)
    }

    pub fn request_presence_unsubscription(&self, from: &str, to: &str) -> Result<(), ComponentError> {
        self.send_presence_request(PresenceType::Unsubscribe, from, to)
    }

    fn send_presence_request(&self, presence_type: PresenceType, from: &str, to: &str) -> Result<(), ComponentError> {
        let id = lock(&self.inner.requests).next_sequence();
        let mut xml = String::from("<presence");
        push_presence_type(&mut xml, presence_type);
        xml.push_str(&format!(" id='{id}' from='{}' to='{}'/>", encode(from), encode(to)));
        self.write(&xml, None)
    }

    /// Accept an incoming subscription request.
    pub fn accept_subscription(&self, request: &PresenceEvent) -> Result<(), ComponentError> {
        self.answer_presence(request, PresenceType::Subscribed)
    }

    pub fn decline_subscription(&self, request: &PresenceEvent) -> Result<(), ComponentError> {
        self.answer_presence(request, PresenceType::Unsubscribed)
    }

    pub fn accept_unsubscription(&self, request: &PresenceEvent) -> Result<(), ComponentError> {
        self.answer_presence(request, PresenceType::Unsubscribed)
    }

    /// Decline an unsubscription request, i.e. keep the subscription.
    pub fn decline_unsubscription(&self, request: &PresenceEvent) -> Result<(), ComponentError> {
        self.answer_presence(request, PresenceType::Subscribed)
    }

    fn answer_presence(&self, request: &PresenceEvent, presence_type: PresenceType) -> Result<(), ComponentError> {
        let mut xml = String::from("<presence");
        push_presence_type(&mut xml, presence_type);
        if !request.id.is_empty() {
            xml.push_str(&format!(" id='{}'", encode(&request.id)));
        }
        xml.push_str(&format!(" from='{}' to='{}'/>", encode(&request.to), encode(&request.from)));
        self.write(&xml, None)
    }
}

/// Connection task of one generation: connect, open the stream, then read and
/// dispatch until the connection ends. The component is only held between awaits.
async fn run_connection(weak: WeakComponent, generation: u64) {
    let Some(component) = weak.upgrade() else {
        return;
    };
    let endpoint = component.endpoint();
    component.set_state(State::Connecting);
    info!(host = %endpoint.host, port = endpoint.port, generation, "Connecting");
    let connector = component.inner.connector.clone();
    drop(component);

    let connected = connector.connect(&endpoint).await;
    let Some(component) = weak.upgrade() else {
        return;
    };
    let transport = match connected {
        Ok(transport) => transport,
        Err(e) => {
            component.connection_failed(generation, ComponentError::Transport(e));
            return;
        }
    };
    let (mut reader, writer) = tokio::io::split(transport);
    {
        let mut session = lock(&component.inner.session);
        if session.generation != generation {
            debug!(generation, "Connection superseded before stream open");
            return;
        }
        let (output, task) = OutputQueue::spawn(writer, weak.clone(), generation);
        session.output = Some(output);
        session.writer = Some(task);
    }

    component.set_state(State::StreamNegotiation);
    let open = format!(
        "<?xml version='1.0'?><stream:stream to='{}' xmlns='{NS_COMPONENT}' xmlns:stream='{NS_STREAM}'>",
        encode(&component.inner.config.component_sub_domain)
    );
    if let Err(e) = component.write(&open, None) {
        component.connection_failed(generation, e);
        return;
    }
    drop(component);

    let mut tokenizer = FragmentTokenizer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut tokens = Vec::new();
    loop {
        let read = reader.read(&mut buf).await;
        let Some(component) = weak.upgrade() else {
            debug!(generation, "Component dropped, closing connection");
            return;
        };
        let n = match read {
            Ok(0) => {
                let e = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "Connection closed by server");
                component.connection_failed(generation, e.into());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Read error");
                component.connection_failed(generation, e.into());
                return;
            }
        };

        let fed = tokenizer.feed(&buf[..n], &mut tokens);
        for token in tokens.drain(..) {
            if !component.is_current(generation) {
                return;
            }
            if let dispatch::Flow::Stop = component.process_token(generation, token) {
                return;
            }
        }
        if let Err(e) = fed {
            error!(error = %e, depth = tokenizer.depth(), "Malformed stream");
            component.connection_failed(generation, e.into());
            return;
        }
    }
}

fn push_presence_type(xml: &mut String, presence_type: PresenceType) {
    if let Some(t) = presence_type.as_attr() {
        xml.push_str(&format!(" type='{t}'"));
    }
}

fn iq_xml(iq_type: IqType, id: &str, from: &str, to: &str, payload: &str) -> String {
    let mut xml = format!("<iq type='{}' id='{}'", iq_type.as_str(), encode(id));
    if !from.is_empty() {
        xml.push_str(&format!(" from='{}'", encode(from)));
    }
    if !to.is_empty() {
        xml.push_str(&format!(" to='{}'", encode(to)));
    }
    xml.push('>');
    xml.push_str(payload);
    xml.push_str("</iq>");
    xml
}

/// Lowercase hex SHA-1 of stream id followed by the shared secret.
pub fn handshake_digest(stream_id: &str, shared_secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(shared_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_digest() {
        assert_eq!(handshake_digest("3BF96D32", "secret"), "b09ea9b3b7f586be8a08d0a3dd7466f110aeb136");
        assert_eq!(handshake_digest("", ""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_iq_xml() {
        assert_eq!(
            iq_xml(IqType::Get, "4", "comp.example.org", "", "<ping xmlns='urn:xmpp:ping'/>"),
            "<iq type='get' id='4' from='comp.example.org'><ping xmlns='urn:xmpp:ping'/></iq>"
        );
        assert_eq!(
            iq_xml(IqType::Result, "a'b", "x", "y", ""),
            "<iq type='result' id='a&apos;b' from='x' to='y'></iq>"
        );
    }

    #[test]
    fn test_presence_type_attribute() {
        let mut xml = String::from("<presence");
        push_presence_type(&mut xml, PresenceType::Available);
        assert_eq!(xml, "<presence");
        push_presence_type(&mut xml, PresenceType::Unsubscribed);
        assert_eq!(xml, "<presence type='unsubscribed'");
    }

    #[test]
    fn test_build_registers_default_features() {
        let component =
            XmppComponent::new(ComponentConfig::new("localhost", 5347, "comp.example.org", "secret")).unwrap();
        assert_eq!(component.state(), ConnectionState::Connecting);
        let features = component.features();
        assert!(features.contains(&NS_DISCO_INFO.to_string()));
        assert!(features.contains(&NS_PING.to_string()));
        assert!(features.contains(&NS_QOS.to_string()));
        assert_eq!(features.len(), 3);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = XmppComponent::new(ComponentConfig::new("localhost", 5347, "", "secret")).unwrap_err();
        assert!(matches!(err, ComponentError::Config(_)));

        let mut config = ComponentConfig::new("localhost", 5347, "comp.example.org", "secret");
        config.keep_alive_seconds = u64::MAX / 100;
        let err = XmppComponent::new(config).unwrap_err();
        assert!(matches!(err, ComponentError::Config(_)));
    }

    #[test]
    fn test_send_while_disconnected() {
        let component =
            XmppComponent::new(ComponentConfig::new("localhost", 5347, "comp.example.org", "secret")).unwrap();
        let err = component.send_iq_get("comp.example.org", "a@b", "<x/>", |_| {}).unwrap_err();
        assert!(matches!(err, ComponentError::NotConnected));
        assert!(lock(&component.inner.requests).is_empty());
        assert!(matches!(
            component.set_presence("comp.example.org", Availability::Online, None, &[]),
            Err(ComponentError::NotConnected)
        ));
    }
}
