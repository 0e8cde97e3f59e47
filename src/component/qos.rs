//! Quality-of-service message delivery (`urn:xmpp:qos`).
//!
//! Sending side wraps message stanzas in iq-set envelopes for the acknowledged and
//! assured levels. Receiving side answers those envelopes, buffering assured messages
//! until the sender confirms delivery.

use super::error::ComponentError;
use super::requests::RetryPolicy;
use super::stanza::{bare_jid, HandlerError, IqRequest, IqResponse, MessageEvent, MessageType, StanzaError};
use super::xml::{encode, Element};
use super::XmppComponent;
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const NS_QOS: &str = "urn:xmpp:qos";

/// Receives whether a message was delivered at the requested level.
pub type DeliveryCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    /// Written to the transport; no delivery guarantee.
    #[default]
    Unacknowledged,
    /// Recipient acknowledges receipt.
    Acknowledged,
    /// Two-phase: recipient buffers, sender confirms, recipient delivers once.
    Assured,
}

/// An outgoing message.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub message_type: MessageType,
    pub from: String,
    pub to: String,
    pub body: String,
    pub subject: Option<String>,
    pub language: Option<String>,
    pub thread_id: Option<String>,
    pub parent_thread_id: Option<String>,
    /// Appended verbatim after the standard children.
    pub custom_xml: Option<String>,
}

impl OutgoingMessage {
    pub fn chat(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Chat,
            from: from.into(),
            to: to.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Message stanza. Wrapped messages leave addressing to the envelope.
    pub fn to_xml(&self, with_addresses: bool) -> String {
        let mut xml = String::from("<message");
        if self.message_type != MessageType::Normal {
            xml.push_str(&format!(" type='{}'", self.message_type.as_str()));
        }
        if with_addresses {
            xml.push_str(&format!(" from='{}' to='{}'", encode(&self.from), encode(&self.to)));
        }
        if let Some(lang) = non_empty(&self.language) {
            xml.push_str(&format!(" xml:lang='{}'", encode(lang)));
        }
        xml.push('>');
        if let Some(subject) = non_empty(&self.subject) {
            xml.push_str(&format!("<subject>{}</subject>", encode(subject)));
        }
        xml.push_str(&format!("<body>{}</body>", encode(&self.body)));
        if let Some(thread) = non_empty(&self.thread_id) {
            match non_empty(&self.parent_thread_id) {
                Some(parent) => xml.push_str(&format!(
                    "<thread parent='{}'>{}</thread>",
                    encode(parent),
                    encode(thread)
                )),
                None => xml.push_str(&format!("<thread>{}</thread>", encode(thread))),
            }
        }
        if let Some(custom) = non_empty(&self.custom_xml) {
            xml.push_str(custom);
        }
        xml.push_str("</message>");
        xml
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

pub(crate) fn send_message(
    component: &XmppComponent,
    qos: QosLevel,
    message: &OutgoingMessage,
    callback: Option<DeliveryCallback>,
) -> Result<(), ComponentError> {
    match qos {
        QosLevel::Unacknowledged => {
            let on_written = callback.map(|cb| -> Box<dyn FnOnce() + Send> { Box::new(move || cb(true)) });
            component.write(&message.to_xml(true), on_written)
        }
        QosLevel::Acknowledged => {
            let xml = format!(
                "<qos:acknowledged xmlns:qos='{NS_QOS}'>{}</qos:acknowledged>",
                message.to_xml(false)
            );
            component.send_iq_set_with(
                &message.from,
                &message.to,
                &xml,
                move |response: IqResponse| {
                    if let Some(cb) = callback {
                        cb(response.ok);
                    }
                },
                RetryPolicy::QOS,
            )?;
            Ok(())
        }
        QosLevel::Assured => {
            let msg_id = uuid::Uuid::new_v4().simple().to_string();
            let xml = format!(
                "<qos:assured xmlns:qos='{NS_QOS}' msgId='{msg_id}'>{}</qos:assured>",
                message.to_xml(false)
            );
            let sender = component.downgrade();
            component.send_iq_set_with(
                &message.from,
                &message.to,
                &xml,
                move |response: IqResponse| match sender.upgrade() {
                    Some(sender) => assured_delivery_step(&sender, response, msg_id, callback),
                    None => {
                        if let Some(cb) = callback {
                            cb(false);
                        }
                    }
                },
                RetryPolicy::QOS,
            )?;
            Ok(())
        }
    }
}

/// First round trip of assured delivery finished: confirm with `deliver` if the
/// recipient buffered our message.
fn assured_delivery_step(
    component: &XmppComponent,
    response: IqResponse,
    msg_id: String,
    callback: Option<DeliveryCallback>,
) {
    let received = response.ok
        && response
            .stanza
            .elements()
            .any(|e| e.local_name == "received" && e.attr("msgId") == Some(msg_id.as_str()));
    if !received {
        debug!(msg_id = %msg_id, ok = response.ok, "Assured message not received by recipient");
        if let Some(cb) = callback {
            cb(false);
        }
        return;
    }

    let xml = format!("<qos:deliver xmlns:qos='{NS_QOS}' msgId='{msg_id}'/>");
    // The callback moves into the second request; if sending fails we get it back.
    let callback = std::sync::Arc::new(std::sync::Mutex::new(callback));
    let pending = callback.clone();
    let sent = component.send_iq_set_with(
        &response.to,
        &response.from,
        &xml,
        move |second: IqResponse| {
            if let Some(cb) = super::lock(&pending).take() {
                cb(second.ok);
            }
        },
        RetryPolicy::QOS,
    );
    if let Err(e) = sent {
        warn!(msg_id = %msg_id, error = %e, "Unable to send delivery confirmation");
        if let Some(cb) = super::lock(&callback).take() {
            cb(false);
        }
    }
}

/// Receiver-side buffer of assured messages awaiting their `deliver`.
#[derive(Default)]
pub(crate) struct AssuredLedger {
    messages: HashMap<(String, String), MessageEvent>,
    per_sender: HashMap<String, usize>,
    total: usize,
}

/// Result of offering an assured message to the ledger.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    Buffered,
    Duplicate,
}

impl AssuredLedger {
    /// Admission control, in order: total ceiling, roster membership, per-sender
    /// ceiling. Nothing is buffered on rejection.
    pub fn admit(
        &mut self,
        sender: &str,
        msg_id: &str,
        message: MessageEvent,
        known_sender: bool,
        max_per_sender: usize,
        max_total: usize,
    ) -> Result<Admission, StanzaError> {
        let key = (sender.to_string(), msg_id.to_string());
        if self.messages.contains_key(&key) {
            return Ok(Admission::Duplicate);
        }
        if self.total >= max_total {
            warn!(sender, limit = max_total, "Rejected assured message, too many pending in total");
            return Err(StanzaError::resource_constraint(format!(
                "Unable to manage more than {max_total} pending assured messages."
            )));
        }
        if !known_sender {
            info!(sender, "Rejected assured message, sender not in roster");
            return Err(StanzaError::not_allowed("Sender not in roster."));
        }
        let count = self.per_sender.entry(sender.to_string()).or_insert(0);
        if *count >= max_per_sender {
            warn!(sender, limit = max_per_sender, "Rejected assured message, too many pending from sender");
            return Err(StanzaError::resource_constraint(format!(
                "Unable to manage more than {max_per_sender} pending assured messages from each sender."
            )));
        }
        *count += 1;
        self.total += 1;
        self.messages.insert(key, message);
        Ok(Admission::Buffered)
    }

    pub fn deliver(&mut self, sender: &str, msg_id: &str) -> Option<MessageEvent> {
        let message = self
            .messages
            .remove(&(sender.to_string(), msg_id.to_string()))?;
        self.total -= 1;
        if let Some(count) = self.per_sender.get_mut(sender) {
            *count -= 1;
            if *count == 0 {
                self.per_sender.remove(sender);
            }
        }
        Some(message)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn pending_from(&self, sender: &str) -> usize {
        self.per_sender.get(sender).copied().unwrap_or(0)
    }
}

fn wrapped_message(request: &IqRequest) -> Result<MessageEvent, HandlerError> {
    let message: &Element = request
        .query
        .elements()
        .find(|e| e.local_name == "message")
        .ok_or_else(|| StanzaError::bad_request("Missing message."))?;
    Ok(MessageEvent::new(
        message.clone(),
        Some(&request.from),
        Some(&request.to),
    ))
}

/// `<acknowledged/>`: answer, then process the message.
pub(crate) fn handle_acknowledged(component: &XmppComponent, request: &IqRequest) -> Result<(), HandlerError> {
    let message = wrapped_message(request)?;
    component
        .send_iq_result(request, "")
        .map_err(|e| HandlerError::Internal(e.to_string()))?;
    component.process_message(message);
    Ok(())
}

/// `<assured/>`: admission control, buffer, answer with `<received/>`.
pub(crate) fn handle_assured(component: &XmppComponent, request: &IqRequest) -> Result<(), HandlerError> {
    let message = wrapped_message(request)?;
    let sender = bare_jid(&request.from);
    let msg_id = request.query.attr_or_empty("msgId");
    let known = component.lookup_roster(sender).is_some();
    let config = component.config();

    let (admission, pending) = {
        let mut ledger = super::lock(&component.inner.ledger);
        let admission = ledger.admit(
            sender,
            msg_id,
            message,
            known,
            config.max_assured_messages_pending_from_source,
            config.max_assured_messages_pending_total,
        )?;
        (admission, ledger.pending_from(sender))
    };
    match admission {
        Admission::Buffered => debug!(sender, msg_id, pending, "Assured message buffered"),
        Admission::Duplicate => debug!(sender, msg_id, "Assured message already buffered"),
    }

    component
        .send_iq_result(request, &format!("<received msgId='{}'/>", encode(msg_id)))
        .map_err(|e| HandlerError::Internal(e.to_string()))
}

/// `<deliver/>`: release a buffered assured message.
pub(crate) fn handle_deliver(component: &XmppComponent, request: &IqRequest) -> Result<(), HandlerError> {
    let sender = bare_jid(&request.from);
    let msg_id = request.query.attr_or_empty("msgId");
    let message = super::lock(&component.inner.ledger).deliver(sender, msg_id);

    component
        .send_iq_result(request, "")
        .map_err(|e| HandlerError::Internal(e.to_string()))?;
    match message {
        Some(message) => component.process_message(message),
        None => debug!(sender, msg_id, "Deliver for unknown assured message"),
    }
    Ok(())
}
