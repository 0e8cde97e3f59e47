//! Routing of parsed top-level stanzas.

use super::endpoint::parse_endpoint;
use super::error::{ComponentError, StreamError};
use super::handlers::IqKind;
use super::stanza::{
    IqRequest, IqResponse, IqType, MessageEvent, MessageType, PresenceEvent, PresenceType, StanzaError,
    StanzaErrorKind,
};
use super::xml::Element;
use super::{guarded, lock, read, XmppComponent};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info, warn};

/// Whether the read loop keeps going after a stanza.
pub(crate) enum Flow {
    Continue,
    Stop,
}

impl XmppComponent {
    pub(crate) fn process_stanza(&self, generation: u64, stanza: Element) -> Flow {
        match stanza.local_name.as_str() {
            "iq" => self.process_iq(stanza),
            "message" => self.process_message(MessageEvent::new(stanza, None, None)),
            "presence" => self.process_presence(PresenceEvent::new(stanza)),
            "error" => return self.process_stream_error(generation, &stanza),
            "handshake" => self.handshake_accepted(),
            other => debug!(element = other, "Ignoring unknown stanza"),
        }
        Flow::Continue
    }

    fn process_iq(&self, stanza: Element) {
        let id = stanza.attr_or_empty("id").to_string();
        let from = stanza.attr_or_empty("from").to_string();
        let to = stanza.attr_or_empty("to").to_string();

        match IqType::parse(stanza.attr_or_empty("type")) {
            Some(iq_type @ (IqType::Get | IqType::Set)) => {
                let kind = if iq_type == IqType::Get { IqKind::Get } else { IqKind::Set };
                let query = stanza.first_element().cloned();
                let handler = query
                    .as_ref()
                    .and_then(|q| read(&self.inner.registry).find_iq(kind, &q.local_name, &q.namespace));

                let (Some(handler), Some(query)) = (handler, query) else {
                    debug!(id = %id, from = %from, "No handler for iq request");
                    let error = StanzaError::new(StanzaErrorKind::FeatureNotImplemented);
                    if let Err(e) = self.send_response(IqType::Error, &id, &to, &from, &error.to_xml()) {
                        debug!(error = %e, "Unable to send iq error");
                    }
                    return;
                };

                let request = IqRequest {
                    iq_type,
                    id,
                    from,
                    to,
                    query,
                    stanza,
                };
                let result = catch_unwind(AssertUnwindSafe(|| handler(self, &request)))
                    .unwrap_or_else(|_| Err(super::HandlerError::Internal("handler panicked".into())));
                if let Err(e) = result {
                    let error = e.to_stanza_error();
                    info!(
                        element = %request.query.local_name, namespace = %request.query.namespace,
                        from = %request.from, error = %error,
                        "Iq handler failed"
                    );
                    if let Err(e) = self.send_iq_error(&request, &error) {
                        debug!(error = %e, "Unable to send iq error");
                    }
                }
            }
            Some(iq_type @ (IqType::Result | IqType::Error)) => {
                let Ok(seq) = id.parse::<u32>() else {
                    debug!(id = %id, "Dropping response with foreign id");
                    return;
                };
                let pending = lock(&self.inner.requests).take(seq);
                let Some(pending) = pending else {
                    debug!(seq, "Dropping response to unknown request");
                    return;
                };
                let ok = iq_type == IqType::Result;
                let response = IqResponse {
                    ok,
                    id: seq,
                    error: (!ok).then(|| StanzaError::from_stanza(&stanza)),
                    from,
                    to,
                    stanza,
                };
                guarded("iq response", move || (pending.callback)(response));
            }
            None => debug!(id = %id, "Ignoring iq without valid type"),
        }
    }

    /// Route a message to the first matching payload handler, or broadcast it by type.
    pub(crate) fn process_message(&self, mut message: MessageEvent) {
        let matched = {
            let registry = read(&self.inner.registry);
            message.stanza.elements().find_map(|child| {
                registry
                    .find_message(&child.local_name, &child.namespace)
                    .map(|handler| (handler, child.clone()))
            })
        };

        if let Some((handler, content)) = matched {
            message.content = Some(content);
            let result = catch_unwind(AssertUnwindSafe(|| handler(self, &message)))
                .unwrap_or_else(|_| Err(super::HandlerError::Internal("handler panicked".into())));
            if let Err(e) = result {
                warn!(from = %message.from, error = %e, "Message handler failed");
                if let Some(events) = self.events() {
                    events.on_error(&ComponentError::Stanza(e.to_stanza_error()));
                }
            }
            return;
        }

        let Some(events) = self.events() else {
            return;
        };
        guarded("message event", || match message.message_type {
            MessageType::Chat => events.on_chat_message(self, &message),
            MessageType::Error => events.on_error_message(self, &message),
            MessageType::GroupChat => events.on_group_chat_message(self, &message),
            MessageType::Headline => events.on_headline_message(self, &message),
            MessageType::Normal => events.on_normal_message(self, &message),
        });
    }

    fn process_presence(&self, presence: PresenceEvent) {
        let Some(events) = self.events() else {
            return;
        };
        guarded("presence event", || match presence.presence_type {
            PresenceType::Available | PresenceType::Unavailable | PresenceType::Error | PresenceType::Probe => {
                events.on_presence(self, &presence)
            }
            PresenceType::Subscribe => events.on_presence_subscribe(self, &presence),
            PresenceType::Subscribed => events.on_presence_subscribed(self, &presence),
            PresenceType::Unsubscribe => events.on_presence_unsubscribe(self, &presence),
            PresenceType::Unsubscribed => events.on_presence_unsubscribed(self, &presence),
        });
    }

    /// `see-other-host` moves the connection; any other stream error is fatal.
    fn process_stream_error(&self, generation: u64, stanza: &Element) -> Flow {
        let error = StreamError::from_element(stanza);
        if let Some(target) = error.see_other_host() {
            match parse_endpoint(target, self.endpoint().port) {
                Some(endpoint) => {
                    self.redirect(generation, endpoint);
                    return Flow::Stop;
                }
                None => warn!(target, "Unusable see-other-host target"),
            }
        }
        self.connection_failed(generation, ComponentError::Stream(error));
        Flow::Stop
    }
}
