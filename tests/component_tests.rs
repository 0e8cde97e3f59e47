//! End-to-end tests driving a component against a scripted in-memory server.

use fluux_component::component::{
    handshake_digest, ComponentConfig, ComponentError, ComponentEvents, ConnectionState, Connector, Endpoint,
    FragmentTokenizer, HandlerError, IqHandler, IqRequest, MessageEvent, MessageHandler, OutgoingMessage,
    PresenceEvent, QosLevel, RetryPolicy, StanzaError, StanzaErrorKind, StaticRoster, Token, Transport,
    XmppComponent, NS_QOS,
};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const SUB: &str = "comp.example.org";
const SECRET: &str = "secret";
const STEP: Duration = Duration::from_secs(30);

/// Hands the server end of every new connection to the test.
struct DuplexConnector {
    accepted: mpsc::UnboundedSender<(Endpoint, DuplexStream)>,
}

impl Connector for DuplexConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, io::Result<Box<dyn Transport>>> {
        Box::pin(async move {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.accepted
                .send((endpoint.clone(), server))
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "test server gone"))?;
            Ok(Box::new(client) as Box<dyn Transport>)
        })
    }
}

struct Server {
    accepted: mpsc::UnboundedReceiver<(Endpoint, DuplexStream)>,
}

impl Server {
    async fn accept(&mut self) -> Peer {
        let (endpoint, stream) = timeout(STEP, self.accepted.recv())
            .await
            .expect("no connection attempt")
            .expect("connector dropped");
        Peer {
            endpoint,
            stream,
            tokenizer: FragmentTokenizer::new(),
            pending: VecDeque::new(),
        }
    }
}

/// Server side of one connection.
struct Peer {
    endpoint: Endpoint,
    stream: DuplexStream,
    tokenizer: FragmentTokenizer,
    pending: VecDeque<Token>,
}

impl Peer {
    async fn next(&mut self) -> Token {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return token;
            }
            let mut buf = [0u8; 4096];
            let n = timeout(STEP, self.stream.read(&mut buf))
                .await
                .expect("component stayed silent")
                .expect("read failed");
            assert!(n > 0, "component closed the connection");
            let mut tokens = Vec::new();
            self.tokenizer.feed(&buf[..n], &mut tokens).expect("component sent malformed XML");
            self.pending.extend(tokens);
        }
    }

    async fn next_fragment(&mut self) -> String {
        match self.next().await {
            Token::Fragment(xml) => xml,
            other => panic!("expected a stanza, got {other:?}"),
        }
    }

    /// Raw text of the next read; empty once the component closed the connection.
    async fn read_raw(&mut self) -> String {
        let mut buf = [0u8; 4096];
        let n = timeout(STEP, self.stream.read(&mut buf))
            .await
            .expect("component stayed silent")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    async fn send(&mut self, xml: &str) {
        self.stream.write_all(xml.as_bytes()).await.expect("write failed");
    }

    async fn open_stream(&mut self, from: &str, stream_id: &str) {
        match self.next().await {
            Token::StreamOpen(xml) => {
                assert!(xml.contains(&format!("to='{SUB}'")), "{xml}");
                assert!(xml.contains("xmlns='jabber:component:accept'"), "{xml}");
            }
            other => panic!("expected stream header, got {other:?}"),
        }
        self.send(&format!(
            "<?xml version='1.0'?><stream:stream xmlns='jabber:component:accept' xmlns:stream='http://etherx.jabber.org/streams' from='{from}' id='{stream_id}'>"
        ))
        .await;
    }

    async fn handshake(&mut self, stream_id: &str) {
        self.open_stream(SUB, stream_id).await;
        let handshake = self.next_fragment().await;
        assert_eq!(
            handshake,
            format!("<handshake>{}</handshake>", handshake_digest(stream_id, SECRET))
        );
        self.send("<handshake/>").await;
    }
}

/// Value of the first `name='...'` attribute in serialized output.
fn attr<'a>(xml: &'a str, name: &str) -> &'a str {
    let key = format!(" {name}='");
    let start = xml
        .find(&key)
        .map(|i| i + key.len())
        .unwrap_or_else(|| panic!("no {name} in {xml}"));
    let end = xml[start..].find('\'').expect("unterminated attribute");
    &xml[start..start + end]
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    State(ConnectionState),
    ConnectionError(String),
    Error(String),
    Chat { from: String, body: String },
    Normal { from: String, body: String },
    Presence(String),
}

/// Records every event; accepts subscription requests.
struct Recorder {
    seen: mpsc::UnboundedSender<Seen>,
}

impl ComponentEvents for Recorder {
    fn on_state_changed(&self, state: ConnectionState) {
        let _ = self.seen.send(Seen::State(state));
    }

    fn on_connection_error(&self, error: &ComponentError) {
        let _ = self.seen.send(Seen::ConnectionError(error.to_string()));
    }

    fn on_error(&self, error: &ComponentError) {
        let _ = self.seen.send(Seen::Error(error.to_string()));
    }

    fn on_presence(&self, _: &XmppComponent, presence: &PresenceEvent) {
        let _ = self.seen.send(Seen::Presence(presence.from.clone()));
    }

    fn on_presence_subscribe(&self, component: &XmppComponent, presence: &PresenceEvent) {
        let _ = component.accept_subscription(presence);
    }

    fn on_chat_message(&self, _: &XmppComponent, message: &MessageEvent) {
        let _ = self.seen.send(Seen::Chat {
            from: message.from.clone(),
            body: message.body.clone().unwrap_or_default(),
        });
    }

    fn on_normal_message(&self, _: &XmppComponent, message: &MessageEvent) {
        let _ = self.seen.send(Seen::Normal {
            from: message.from.clone(),
            body: message.body.clone().unwrap_or_default(),
        });
    }
}

struct Harness {
    component: XmppComponent,
    server: Server,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl Harness {
    fn new(config: ComponentConfig) -> Self {
        Self::with_roster(config, StaticRoster::default())
    }

    fn with_roster(config: ComponentConfig, roster: StaticRoster) -> Self {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let component = XmppComponent::builder(config)
            .connector(Arc::new(DuplexConnector { accepted: accepted_tx }))
            .events(Arc::new(Recorder { seen: seen_tx }))
            .roster(Arc::new(roster))
            .build()
            .unwrap();
        Self {
            component,
            server: Server { accepted: accepted_rx },
            seen: seen_rx,
        }
    }

    /// Start, accept and authenticate; returns the connected peer.
    async fn connect(&mut self) -> Peer {
        self.component.start();
        let mut peer = self.server.accept().await;
        peer.handshake("3BF96D32").await;
        self.wait_for(Seen::State(ConnectionState::Connected)).await;
        peer
    }

    async fn next_event(&mut self) -> Seen {
        timeout(STEP, self.seen.recv())
            .await
            .expect("no event")
            .expect("event channel closed")
    }

    /// Skip events until `wanted`; returns the ones skipped.
    async fn wait_for(&mut self, wanted: Seen) -> Vec<Seen> {
        let mut skipped = Vec::new();
        loop {
            let event = self.next_event().await;
            if event == wanted {
                return skipped;
            }
            skipped.push(event);
        }
    }
}

fn config() -> ComponentConfig {
    let mut config = ComponentConfig::new("xmpp.example.org", 5347, SUB, SECRET);
    // keep-alive traffic would interleave with scripted exchanges
    config.keep_alive_seconds = 3_600;
    config
}

#[tokio::test]
async fn test_handshake_reaches_connected() {
    let mut h = Harness::new(config());
    h.component.start();
    let mut peer = h.server.accept().await;
    assert_eq!(peer.endpoint, Endpoint::new("xmpp.example.org", 5347));
    peer.handshake("3BF96D32").await;

    let before = h.wait_for(Seen::State(ConnectionState::Connected)).await;
    assert_eq!(before, vec![Seen::State(ConnectionState::StreamNegotiation)]);
    assert_eq!(h.component.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_sub_domain_mismatch_is_fatal() {
    let mut h = Harness::new(config());
    h.component.start();
    let mut peer = h.server.accept().await;
    peer.open_stream("other.example.org", "1").await;

    let before = h.wait_for(Seen::State(ConnectionState::Error)).await;
    assert!(
        before
            .iter()
            .any(|e| matches!(e, Seen::ConnectionError(msg) if msg.contains("other.example.org"))),
        "{before:?}"
    );
}

#[tokio::test]
async fn test_disco_info_lists_identity_and_features() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<iq type='get' id='d1' from='user@example.org/desk' to='comp.example.org'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>")
        .await;
    let response = peer.next_fragment().await;
    assert!(
        response.starts_with(
            "<iq type='result' id='d1' from='comp.example.org' to='user@example.org/desk'><query xmlns='http://jabber.org/protocol/disco#info'><identity category='component' type='generic' name='fluux component'/>"
        ),
        "{response}"
    );
    assert!(response.contains("<feature var='http://jabber.org/protocol/disco#info'/>"));
    assert!(response.contains("<feature var='urn:xmpp:ping'/>"));
    assert!(response.contains(&format!("<feature var='{NS_QOS}'/>")));
}

#[tokio::test]
async fn test_ping_is_answered() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<iq type='get' id='p1' from='example.org' to='comp.example.org'><ping xmlns='urn:xmpp:ping'/></iq>")
        .await;
    assert_eq!(
        peer.next_fragment().await,
        "<iq type='result' id='p1' from='comp.example.org' to='example.org'></iq>"
    );
}

#[tokio::test]
async fn test_unhandled_iq_gets_feature_not_implemented() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<iq type='set' id='u1' from='a@example.org' to='comp.example.org'><unknown xmlns='urn:example:unknown'/></iq>")
        .await;
    let response = peer.next_fragment().await;
    assert_eq!(attr(&response, "type"), "error");
    assert_eq!(attr(&response, "id"), "u1");
    assert_eq!(attr(&response, "to"), "a@example.org");
    assert!(response.contains("<feature-not-implemented xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>"));
}

#[tokio::test]
async fn test_handler_error_becomes_iq_error() {
    let mut h = Harness::new(config());
    let handler: IqHandler = Arc::new(|_: &XmppComponent, _: &IqRequest| {
        Err(HandlerError::from(StanzaError::item_not_found("No such node.")))
    });
    h.component
        .register_iq_get_handler("items", "urn:example:items", handler, true)
        .unwrap();
    let panicking: IqHandler = Arc::new(|_: &XmppComponent, _: &IqRequest| panic!("boom"));
    h.component
        .register_iq_set_handler("items", "urn:example:items", panicking, false)
        .unwrap();
    let mut peer = h.connect().await;

    peer.send("<iq type='get' id='g1' from='a@example.org' to='comp.example.org'><items xmlns='urn:example:items'/></iq>")
        .await;
    assert_eq!(
        peer.next_fragment().await,
        "<iq type='error' id='g1' from='comp.example.org' to='a@example.org'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>No such node.</text></error></iq>"
    );

    peer.send("<iq type='set' id='s1' from='a@example.org' to='comp.example.org'><items xmlns='urn:example:items'/></iq>")
        .await;
    let response = peer.next_fragment().await;
    assert_eq!(attr(&response, "id"), "s1");
    assert!(response.contains("internal-server-error"), "{response}");
}

#[tokio::test]
async fn test_iq_get_round_trip() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    let component = h.component.clone();
    let request = tokio::spawn(async move {
        component
            .iq_get(SUB, "user@example.org", "<query xmlns='jabber:iq:version'/>", STEP)
            .await
    });
    let sent = peer.next_fragment().await;
    assert_eq!(attr(&sent, "type"), "get");
    assert_eq!(attr(&sent, "from"), SUB);
    assert_eq!(attr(&sent, "to"), "user@example.org");
    let id = attr(&sent, "id").to_string();

    peer.send(&format!(
        "<iq type='result' id='{id}' from='user@example.org' to='comp.example.org'><query xmlns='jabber:iq:version'><name>fluux</name></query></iq>"
    ))
    .await;
    let response = request.await.unwrap().unwrap();
    let query = response.first_element().unwrap();
    assert!(query.is("query", "jabber:iq:version"));
    assert_eq!(query.get_child("name", "jabber:iq:version").unwrap().text(), "fluux");
}

#[tokio::test]
async fn test_iq_error_response() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    let component = h.component.clone();
    let request = tokio::spawn(async move {
        component
            .iq_set(SUB, "pubsub.example.org", "<pubsub xmlns='http://jabber.org/protocol/pubsub'/>", STEP)
            .await
    });
    let sent = peer.next_fragment().await;
    let id = attr(&sent, "id").to_string();
    peer.send(&format!(
        "<iq type='error' id='{id}' from='pubsub.example.org' to='comp.example.org'><error type='cancel'><item-not-found xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>"
    ))
    .await;

    match request.await.unwrap() {
        Err(ComponentError::Stanza(error)) => assert_eq!(error.kind, StanzaErrorKind::ItemNotFound),
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_retries_then_times_out() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    let (tx, rx) = oneshot::channel();
    let policy = RetryPolicy {
        timeout_ms: 1_000,
        retries: 2,
        drop_off: false,
        max_timeout_ms: 1_000,
    };
    let seq = h
        .component
        .send_iq_get_with(
            SUB,
            "user@example.org",
            "<query xmlns='jabber:iq:version'/>",
            move |response| {
                let _ = tx.send(response);
            },
            policy,
        )
        .unwrap();

    let first = peer.next_fragment().await;
    assert_eq!(attr(&first, "id"), seq.to_string());
    assert_eq!(peer.next_fragment().await, first);
    assert_eq!(peer.next_fragment().await, first);

    let response = timeout(STEP, rx).await.unwrap().unwrap();
    assert!(!response.ok);
    assert_eq!(response.id, seq);
    assert_eq!(response.error.unwrap().kind, StanzaErrorKind::RecipientUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_sends_ping() {
    let mut config = config();
    config.keep_alive_seconds = 2;
    let mut h = Harness::new(config);
    let mut peer = h.connect().await;

    let ping = peer.next_fragment().await;
    assert_eq!(attr(&ping, "type"), "get");
    assert_eq!(attr(&ping, "from"), SUB);
    assert!(ping.contains("<ping xmlns='urn:xmpp:ping'/>"), "{ping}");
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_falls_back_to_whitespace() {
    let mut config = config();
    config.keep_alive_seconds = 2;
    let mut h = Harness::new(config);
    let mut peer = h.connect().await;

    let ping = peer.next_fragment().await;
    assert!(ping.contains("<ping xmlns='urn:xmpp:ping'/>"), "{ping}");
    peer.send(&format!(
        "<iq type='error' id='{}' from='{SUB}' to='{SUB}'><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        attr(&ping, "id")
    ))
    .await;

    for _ in 0..3 {
        let keep_alive = peer.read_raw().await;
        assert!(!keep_alive.is_empty());
        assert!(keep_alive.trim().is_empty(), "{keep_alive}");
    }
    assert_eq!(h.component.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_ping_reconnects() {
    let mut config = config();
    config.keep_alive_seconds = 2;
    let mut h = Harness::new(config);
    let mut peer = h.connect().await;

    let ping = peer.next_fragment().await;
    peer.send(&format!(
        "<iq type='error' id='{}' from='{SUB}' to='{SUB}'><error type='wait'><recipient-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
        attr(&ping, "id")
    ))
    .await;

    let mut second = h.server.accept().await;
    second.handshake("4C0A7E11").await;
    h.wait_for(Seen::State(ConnectionState::Connected)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_purges_pending_requests() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let policy = RetryPolicy {
        timeout_ms: 1_000,
        retries: 2,
        drop_off: false,
        max_timeout_ms: 1_000,
    };
    h.component
        .send_iq_get_with(
            SUB,
            "user@example.org",
            "<query xmlns='jabber:iq:version'/>",
            move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            },
            policy,
        )
        .unwrap();
    peer.next_fragment().await;

    h.component.reconnect();
    let mut second = h.server.accept().await;
    second.handshake("4C0A7E11").await;
    h.wait_for(Seen::State(ConnectionState::Connected)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropping_last_handle_closes_connection() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    drop(h);
    assert_eq!(peer.read_raw().await, "");
}

#[test]
fn test_handler_registration_rules() {
    let component = XmppComponent::new(config()).unwrap();
    let handler: IqHandler = Arc::new(|_: &XmppComponent, _: &IqRequest| Ok(()));
    let other: IqHandler = Arc::new(|_: &XmppComponent, _: &IqRequest| Ok(()));

    component
        .register_iq_get_handler("query", "urn:example:a", handler.clone(), true)
        .unwrap();
    assert!(matches!(
        component.register_iq_get_handler("query", "urn:example:a", other.clone(), false),
        Err(ComponentError::AlreadyRegistered { .. })
    ));
    assert!(component.features().contains(&"urn:example:a".to_string()));

    assert!(!component.unregister_iq_get_handler("query", "urn:example:a", &other));
    assert!(!component.unregister_iq_set_handler("query", "urn:example:a", &handler));
    assert!(component.unregister_iq_get_handler("query", "urn:example:a", &handler));
    assert!(!component.features().contains(&"urn:example:a".to_string()));

    let on_message: MessageHandler = Arc::new(|_: &XmppComponent, _: &MessageEvent| Ok(()));
    component
        .register_message_handler("event", "urn:example:event", on_message.clone(), false)
        .unwrap();
    assert!(component.unregister_message_handler("event", "urn:example:event", &on_message));
}

#[tokio::test]
async fn test_message_routing() {
    let mut h = Harness::new(config());
    let (payload_tx, mut payload_rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |_: &XmppComponent, message: &MessageEvent| {
        let node = message
            .content
            .as_ref()
            .and_then(|event| event.first_element())
            .map(|items| items.attr_or_empty("node").to_string());
        let _ = payload_tx.send(node);
        Ok(())
    });
    h.component
        .register_message_handler("event", "http://jabber.org/protocol/pubsub#event", handler, false)
        .unwrap();
    let mut peer = h.connect().await;

    peer.send("<message from='pubsub.example.org' to='comp.example.org'><event xmlns='http://jabber.org/protocol/pubsub#event'><items node='news'/></event></message>")
        .await;
    peer.send("<message type='chat' from='user@example.org/desk' to='comp.example.org'><body>hello</body></message>")
        .await;

    let matched = timeout(STEP, payload_rx.recv()).await.unwrap().unwrap();
    assert_eq!(matched.as_deref(), Some("news"));
    assert_eq!(
        h.next_event().await,
        Seen::Chat {
            from: "user@example.org/desk".into(),
            body: "hello".into()
        }
    );
}

#[tokio::test]
async fn test_failing_message_handler_reports_error() {
    let mut h = Harness::new(config());
    let handler: MessageHandler = Arc::new(|_: &XmppComponent, _: &MessageEvent| {
        Err(HandlerError::Internal("storage unavailable".into()))
    });
    h.component
        .register_message_handler("x", "urn:example:x", handler, false)
        .unwrap();
    let mut peer = h.connect().await;

    peer.send("<message from='a@example.org' to='comp.example.org'><x xmlns='urn:example:x'/></message>")
        .await;
    match h.next_event().await {
        Seen::Error(msg) => assert!(msg.contains("storage unavailable"), "{msg}"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_presence_subscription_is_answered() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<presence type='subscribe' id='s1' from='user@example.org' to='comp.example.org'/>")
        .await;
    assert_eq!(
        peer.next_fragment().await,
        "<presence type='subscribed' id='s1' from='comp.example.org' to='user@example.org'/>"
    );

    peer.send("<presence from='user@example.org/desk' to='comp.example.org'><show>away</show></presence>")
        .await;
    assert_eq!(h.next_event().await, Seen::Presence("user@example.org/desk".into()));
}

#[tokio::test]
async fn test_output_keeps_submission_order() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    for body in ["A", "B", "C"] {
        h.component.send_chat_message(SUB, "user@example.org", body).unwrap();
    }
    for body in ["A", "B", "C"] {
        assert_eq!(
            peer.next_fragment().await,
            format!("<message type='chat' from='{SUB}' to='user@example.org'><body>{body}</body></message>")
        );
    }
}

#[tokio::test]
async fn test_assured_send_confirms_delivery() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    let (tx, rx) = oneshot::channel();
    h.component
        .send_message(
            QosLevel::Assured,
            &OutgoingMessage::chat(SUB, "user@example.org", "hi"),
            Some(Box::new(move |delivered| {
                let _ = tx.send(delivered);
            })),
        )
        .unwrap();

    let assured = peer.next_fragment().await;
    assert_eq!(attr(&assured, "type"), "set");
    assert!(assured.contains(&format!("<qos:assured xmlns:qos='{NS_QOS}' msgId='")), "{assured}");
    assert!(assured.contains("<message type='chat'><body>hi</body></message>"), "{assured}");
    let msg_id = attr(&assured, "msgId").to_string();
    peer.send(&format!(
        "<iq type='result' id='{}' from='user@example.org' to='comp.example.org'><received msgId='{msg_id}'/></iq>",
        attr(&assured, "id")
    ))
    .await;

    let deliver = peer.next_fragment().await;
    assert_eq!(attr(&deliver, "from"), SUB);
    assert_eq!(attr(&deliver, "to"), "user@example.org");
    assert_eq!(attr(&deliver, "msgId"), msg_id);
    assert!(deliver.contains("<qos:deliver"), "{deliver}");
    peer.send(&format!(
        "<iq type='result' id='{}' from='user@example.org' to='comp.example.org'/>",
        attr(&deliver, "id")
    ))
    .await;

    assert!(timeout(STEP, rx).await.unwrap().unwrap());
}

#[tokio::test]
async fn test_acknowledged_receive() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<iq type='set' id='k1' from='user@example.org/desk' to='comp.example.org'><qos:acknowledged xmlns:qos='urn:xmpp:qos'><message><body>ack me</body></message></qos:acknowledged></iq>")
        .await;
    assert_eq!(
        peer.next_fragment().await,
        "<iq type='result' id='k1' from='comp.example.org' to='user@example.org/desk'></iq>"
    );
    assert_eq!(
        h.next_event().await,
        Seen::Normal {
            from: "user@example.org/desk".into(),
            body: "ack me".into()
        }
    );
}

fn assured_iq(id: &str, from: &str, msg_id: &str, body: &str) -> String {
    format!(
        "<iq type='set' id='{id}' from='{from}' to='comp.example.org'><qos:assured xmlns:qos='urn:xmpp:qos' msgId='{msg_id}'><message type='chat'><body>{body}</body></message></qos:assured></iq>"
    )
}

fn deliver_iq(id: &str, from: &str, msg_id: &str) -> String {
    format!(
        "<iq type='set' id='{id}' from='{from}' to='comp.example.org'><qos:deliver xmlns:qos='urn:xmpp:qos' msgId='{msg_id}'/></iq>"
    )
}

#[tokio::test]
async fn test_assured_receive_buffers_until_deliver() {
    let mut h = Harness::with_roster(config(), StaticRoster::new(["user@example.org"]));
    let mut peer = h.connect().await;

    peer.send(&assured_iq("a1", "user@example.org/desk", "m1", "hi")).await;
    assert_eq!(
        peer.next_fragment().await,
        "<iq type='result' id='a1' from='comp.example.org' to='user@example.org/desk'><received msgId='m1'/></iq>"
    );

    // a resent envelope is acknowledged again
    peer.send(&assured_iq("a2", "user@example.org/desk", "m1", "hi")).await;
    assert_eq!(attr(&peer.next_fragment().await, "id"), "a2");
    assert!(h.seen.try_recv().is_err());

    peer.send(&deliver_iq("a3", "user@example.org/desk", "m1")).await;
    assert_eq!(
        peer.next_fragment().await,
        "<iq type='result' id='a3' from='comp.example.org' to='user@example.org/desk'></iq>"
    );
    assert_eq!(
        h.next_event().await,
        Seen::Chat {
            from: "user@example.org/desk".into(),
            body: "hi".into()
        }
    );

    // delivered once only
    peer.send(&deliver_iq("a4", "user@example.org/desk", "m1")).await;
    assert_eq!(attr(&peer.next_fragment().await, "type"), "result");
}

#[tokio::test]
async fn test_assured_admission_limits() {
    let mut config = config();
    config.max_assured_messages_pending_total = 2;
    let roster = StaticRoster::new(["a@example.org", "b@example.org", "c@example.org"]);
    let mut h = Harness::with_roster(config, roster);
    let mut peer = h.connect().await;

    peer.send(&assured_iq("x1", "stranger@example.org", "m0", "?")).await;
    let rejected = peer.next_fragment().await;
    assert_eq!(attr(&rejected, "type"), "error");
    assert!(rejected.contains("<not-allowed "), "{rejected}");

    peer.send(&assured_iq("x2", "a@example.org", "m1", "1")).await;
    assert!(peer.next_fragment().await.contains("<received msgId='m1'/>"));
    peer.send(&assured_iq("x3", "b@example.org", "m2", "2")).await;
    assert!(peer.next_fragment().await.contains("<received msgId='m2'/>"));

    peer.send(&assured_iq("x4", "c@example.org", "m3", "3")).await;
    let full = peer.next_fragment().await;
    assert_eq!(attr(&full, "id"), "x4");
    assert_eq!(attr(&full, "type"), "error");
    assert!(full.contains("<resource-constraint "), "{full}");

    peer.send(&deliver_iq("x5", "a@example.org", "m1")).await;
    assert_eq!(attr(&peer.next_fragment().await, "type"), "result");
    peer.send(&assured_iq("x6", "c@example.org", "m3", "3")).await;
    assert!(peer.next_fragment().await.contains("<received msgId='m3'/>"));
}

#[tokio::test]
async fn test_see_other_host_redirects_silently() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<stream:error><see-other-host xmlns='urn:ietf:params:xml:ns:xmpp-streams'>h2.example.org:5348</see-other-host></stream:error>")
        .await;
    let mut second = h.server.accept().await;
    assert_eq!(second.endpoint, Endpoint::new("h2.example.org", 5348));
    second.handshake("2").await;

    let before = h.wait_for(Seen::State(ConnectionState::Connected)).await;
    assert!(
        !before.iter().any(|e| matches!(e, Seen::ConnectionError(_))),
        "{before:?}"
    );
    assert_eq!(h.component.endpoint(), Endpoint::new("h2.example.org", 5348));
}

#[tokio::test]
async fn test_stream_error_is_fatal() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>")
        .await;
    let before = h.wait_for(Seen::State(ConnectionState::Error)).await;
    assert!(
        before
            .iter()
            .any(|e| matches!(e, Seen::ConnectionError(msg) if msg.contains("conflict"))),
        "{before:?}"
    );
}

#[tokio::test]
async fn test_stream_close_goes_offline() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    peer.send("</stream:stream>").await;
    let before = h.wait_for(Seen::State(ConnectionState::Offline)).await;
    assert!(before.is_empty(), "{before:?}");
    assert_eq!(h.component.state(), ConnectionState::Offline);
}

#[tokio::test]
async fn test_lost_transport_fails_pending_sends() {
    let mut h = Harness::new(config());
    let peer = h.connect().await;

    h.component
        .send_iq_get(SUB, "user@example.org", "<query xmlns='jabber:iq:version'/>", |_| {})
        .unwrap();
    drop(peer);

    let before = h.wait_for(Seen::State(ConnectionState::Error)).await;
    assert!(
        before.iter().any(|e| matches!(e, Seen::ConnectionError(_))),
        "{before:?}"
    );
    assert!(matches!(
        h.component.send_iq_get(SUB, "user@example.org", "<x/>", |_| {}),
        Err(ComponentError::NotConnected)
    ));
}

#[tokio::test]
async fn test_shutdown_closes_stream() {
    let mut h = Harness::new(config());
    let mut peer = h.connect().await;

    h.component.shutdown().await;
    assert_eq!(peer.next().await, Token::StreamClosed);
    assert_eq!(h.component.state(), ConnectionState::Offline);
}
