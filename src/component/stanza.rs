//! Stanza-level types: error conditions, iq/message/presence event payloads.

use super::xml::{encode, Element};
use thiserror::Error;

pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Defined stanza error conditions (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorKind {
    BadRequest,
    Conflict,
    FeatureNotImplemented,
    Forbidden,
    Gone,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAcceptable,
    NotAllowed,
    NotAuthorized,
    PolicyViolation,
    RecipientUnavailable,
    Redirect,
    RegistrationRequired,
    RemoteServerNotFound,
    RemoteServerTimeout,
    ResourceConstraint,
    ServiceUnavailable,
    SubscriptionRequired,
    UndefinedCondition,
    UnexpectedRequest,
}

impl StanzaErrorKind {
    pub fn condition(self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::Gone => "gone",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::Redirect => "redirect",
            Self::RegistrationRequired => "registration-required",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    pub fn from_condition(condition: &str) -> Option<Self> {
        Some(match condition {
            "bad-request" => Self::BadRequest,
            "conflict" => Self::Conflict,
            "feature-not-implemented" => Self::FeatureNotImplemented,
            "forbidden" => Self::Forbidden,
            "gone" => Self::Gone,
            "internal-server-error" => Self::InternalServerError,
            "item-not-found" => Self::ItemNotFound,
            "jid-malformed" => Self::JidMalformed,
            "not-acceptable" => Self::NotAcceptable,
            "not-allowed" => Self::NotAllowed,
            "not-authorized" => Self::NotAuthorized,
            "policy-violation" => Self::PolicyViolation,
            "recipient-unavailable" => Self::RecipientUnavailable,
            "redirect" => Self::Redirect,
            "registration-required" => Self::RegistrationRequired,
            "remote-server-not-found" => Self::RemoteServerNotFound,
            "remote-server-timeout" => Self::RemoteServerTimeout,
            "resource-constraint" => Self::ResourceConstraint,
            "service-unavailable" => Self::ServiceUnavailable,
            "subscription-required" => Self::SubscriptionRequired,
            "undefined-condition" => Self::UndefinedCondition,
            "unexpected-request" => Self::UnexpectedRequest,
            _ => return None,
        })
    }

    /// Error type used when the condition is raised without an explicit one.
    pub fn default_type(self) -> ErrorType {
        match self {
            Self::BadRequest
            | Self::JidMalformed
            | Self::NotAcceptable
            | Self::PolicyViolation
            | Self::Redirect => ErrorType::Modify,
            Self::Forbidden
            | Self::NotAuthorized
            | Self::RegistrationRequired
            | Self::SubscriptionRequired => ErrorType::Auth,
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => ErrorType::Wait,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::Gone
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable
            | Self::UndefinedCondition => ErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.condition())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(Self::Auth),
            "cancel" => Some(Self::Cancel),
            "continue" => Some(Self::Continue),
            "modify" => Some(Self::Modify),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stanza-level error, either received from a peer or about to be sent to one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} ({error_type}){}", text_suffix(.text))]
pub struct StanzaError {
    pub kind: StanzaErrorKind,
    pub error_type: ErrorType,
    pub text: Option<String>,
}

fn text_suffix(text: &Option<String>) -> String {
    text.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}

impl StanzaError {
    pub fn new(kind: StanzaErrorKind) -> Self {
        Self {
            kind,
            error_type: kind.default_type(),
            text: None,
        }
    }

    pub fn with_text(kind: StanzaErrorKind, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::new(kind)
        }
    }

    pub fn bad_request(text: impl Into<String>) -> Self {
        Self::with_text(StanzaErrorKind::BadRequest, text)
    }

    pub fn not_allowed(text: impl Into<String>) -> Self {
        Self::with_text(StanzaErrorKind::NotAllowed, text)
    }

    pub fn resource_constraint(text: impl Into<String>) -> Self {
        Self::with_text(StanzaErrorKind::ResourceConstraint, text)
    }

    pub fn item_not_found(text: impl Into<String>) -> Self {
        Self::with_text(StanzaErrorKind::ItemNotFound, text)
    }

    /// `<error>` element as sent inside an error stanza.
    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<error type='{}'><{} xmlns='{NS_STANZAS}'/>",
            self.error_type,
            self.kind.condition()
        );
        if let Some(text) = &self.text {
            xml.push_str(&format!("<text xmlns='{NS_STANZAS}'>{}</text>", encode(text)));
        }
        xml.push_str("</error>");
        xml
    }

    /// Decode the `<error>` child of an error stanza.
    ///
    /// A missing or unknown condition decodes as `undefined-condition`.
    pub fn from_stanza(stanza: &Element) -> Self {
        let Some(error) = stanza.elements().find(|e| e.local_name == "error") else {
            return Self::new(StanzaErrorKind::UndefinedCondition);
        };
        let mut kind = StanzaErrorKind::UndefinedCondition;
        let mut text = None;
        for child in error.elements().filter(|e| e.namespace == NS_STANZAS) {
            if child.local_name == "text" {
                text = Some(child.text());
            } else if let Some(k) = StanzaErrorKind::from_condition(&child.local_name) {
                kind = k;
            }
        }
        Self {
            kind,
            error_type: ErrorType::parse(error.attr_or_empty("type")).unwrap_or(kind.default_type()),
            text,
        }
    }
}

/// Failure returned by an application handler.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Stanza(#[from] StanzaError),
    #[error("handler failed: {0}")]
    Internal(String),
}

impl HandlerError {
    /// The stanza error sent back to the requester.
    pub fn to_stanza_error(&self) -> StanzaError {
        match self {
            Self::Stanza(e) => e.clone(),
            Self::Internal(msg) => StanzaError::with_text(StanzaErrorKind::InternalServerError, msg.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Result => "result",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(Self::Get),
            "set" => Some(Self::Set),
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// An incoming iq get/set routed to a registered handler.
#[derive(Debug, Clone)]
pub struct IqRequest {
    pub iq_type: IqType,
    pub id: String,
    pub from: String,
    pub to: String,
    /// The full `<iq>` element.
    pub stanza: Element,
    /// First child element of the iq; the one the handler was matched on.
    pub query: Element,
}

/// Outcome of an outgoing iq request, handed to its callback exactly once.
#[derive(Debug, Clone)]
pub struct IqResponse {
    pub ok: bool,
    pub id: u32,
    pub from: String,
    pub to: String,
    /// The full `<iq>` element of the result or error.
    pub stanza: Element,
    pub error: Option<StanzaError>,
}

impl IqResponse {
    pub fn first_element(&self) -> Option<&Element> {
        self.stanza.elements().find(|e| e.local_name != "error")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    Chat,
    Error,
    GroupChat,
    Headline,
    #[default]
    Normal,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Error => "error",
            Self::GroupChat => "groupchat",
            Self::Headline => "headline",
            Self::Normal => "normal",
        }
    }

    /// Missing or unknown types are `normal`.
    pub fn parse(s: &str) -> Self {
        match s {
            "chat" => Self::Chat,
            "error" => Self::Error,
            "groupchat" => Self::GroupChat,
            "headline" => Self::Headline,
            _ => Self::Normal,
        }
    }
}

/// An incoming message.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub message_type: MessageType,
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: Option<String>,
    pub subject: Option<String>,
    pub thread: Option<String>,
    pub stanza: Element,
    /// Child element a message handler was matched on, if any.
    pub content: Option<Element>,
    pub error: Option<StanzaError>,
}

impl MessageEvent {
    /// `from` and `to` override the stanza's own addresses when the message was
    /// unwrapped from a QoS envelope.
    pub(crate) fn new(stanza: Element, from: Option<&str>, to: Option<&str>) -> Self {
        let message_type = MessageType::parse(stanza.attr_or_empty("type"));
        let child_text = |name: &str| {
            stanza
                .elements()
                .find(|e| e.local_name == name)
                .map(Element::text)
        };
        Self {
            message_type,
            id: stanza.attr_or_empty("id").to_string(),
            from: from.unwrap_or(stanza.attr_or_empty("from")).to_string(),
            to: to.unwrap_or(stanza.attr_or_empty("to")).to_string(),
            body: child_text("body"),
            subject: child_text("subject"),
            thread: child_text("thread"),
            error: (message_type == MessageType::Error).then(|| StanzaError::from_stanza(&stanza)),
            content: None,
            stanza,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Error,
    Probe,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
}

impl PresenceType {
    pub fn parse(s: &str) -> Self {
        match s {
            "unavailable" => Self::Unavailable,
            "error" => Self::Error,
            "probe" => Self::Probe,
            "subscribe" => Self::Subscribe,
            "subscribed" => Self::Subscribed,
            "unsubscribe" => Self::Unsubscribe,
            "unsubscribed" => Self::Unsubscribed,
            _ => Self::Available,
        }
    }

    /// Value of the `type` attribute; `None` for plain availability.
    pub fn as_attr(self) -> Option<&'static str> {
        match self {
            Self::Available => None,
            Self::Unavailable => Some("unavailable"),
            Self::Error => Some("error"),
            Self::Probe => Some("probe"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
        }
    }
}

/// Availability announced in a presence (`<show/>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Online,
    Offline,
    Away,
    Chat,
    DoNotDisturb,
    ExtendedAway,
}

impl Availability {
    pub fn show(self) -> Option<&'static str> {
        match self {
            Self::Away => Some("away"),
            Self::Chat => Some("chat"),
            Self::DoNotDisturb => Some("dnd"),
            Self::ExtendedAway => Some("xa"),
            Self::Online | Self::Offline => None,
        }
    }

    fn from_show(show: &str) -> Self {
        match show {
            "away" => Self::Away,
            "chat" => Self::Chat,
            "dnd" => Self::DoNotDisturb,
            "xa" => Self::ExtendedAway,
            _ => Self::Online,
        }
    }
}

/// An incoming presence.
#[derive(Debug, Clone)]
pub struct PresenceEvent {
    pub presence_type: PresenceType,
    pub availability: Availability,
    pub id: String,
    pub from: String,
    pub to: String,
    pub status: Option<String>,
    pub stanza: Element,
    pub error: Option<StanzaError>,
}

impl PresenceEvent {
    pub(crate) fn new(stanza: Element) -> Self {
        let presence_type = PresenceType::parse(stanza.attr_or_empty("type"));
        let availability = match presence_type {
            PresenceType::Available => stanza
                .elements()
                .find(|e| e.local_name == "show")
                .map(|e| Availability::from_show(e.text().trim()))
                .unwrap_or_default(),
            _ => Availability::Offline,
        };
        let status = stanza
            .elements()
            .find(|e| e.local_name == "status")
            .map(Element::text);
        Self {
            presence_type,
            availability,
            id: stanza.attr_or_empty("id").to_string(),
            from: stanza.attr_or_empty("from").to_string(),
            to: stanza.attr_or_empty("to").to_string(),
            status,
            error: (presence_type == PresenceType::Error).then(|| StanzaError::from_stanza(&stanza)),
            stanza,
        }
    }
}

/// Strip the resource part of an address.
pub fn bare_jid(jid: &str) -> &str {
    jid.split_once('/').map_or(jid, |(bare, _)| bare)
}
