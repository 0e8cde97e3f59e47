//! One-second scheduler: keep-alive and request retries.

use super::events::ConnectionState;
use super::requests::Expired;
use super::stanza::{IqResponse, StanzaError, StanzaErrorKind, NS_STANZAS};
use super::xml::Element;
use super::{guarded, lock, WeakComponent, XmppComponent, NS_COMPONENT};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Runs until the component is dropped or the task is aborted.
pub(crate) fn spawn(component: WeakComponent) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(component) = component.upgrade() else {
                break;
            };
            component.tick(Instant::now());
        }
    })
}

impl XmppComponent {
    pub(crate) fn tick(&self, now: Instant) {
        let ping_due = {
            let mut keep_alive = lock(&self.inner.keep_alive);
            if now >= keep_alive.next_ping {
                keep_alive.next_ping = now + self.inner.config.keep_alive_interval();
                Some(keep_alive.supports_ping)
            } else {
                None
            }
        };
        if let Some(supports_ping) = ping_due {
            if self.state() == ConnectionState::Connected {
                self.send_keep_alive(supports_ping);
            }
        }

        let expired = lock(&self.inner.requests).expire(now);
        for entry in expired {
            match entry {
                Expired::Resend { seq, xml } => {
                    debug!(seq, "Retrying request");
                    if let Err(e) = self.write(&xml, None) {
                        debug!(seq, error = %e, "Retry not sent");
                    }
                }
                Expired::TimedOut(request) => {
                    info!(seq = request.seq, to = %request.to, "Request timed out");
                    let response = timeout_response(request.seq, &request.to);
                    let callback = request.callback;
                    guarded("iq timeout", move || callback(response));
                }
            }
        }
    }

    fn send_keep_alive(&self, supports_ping: bool) {
        let sent = if supports_ping {
            let component = self.downgrade();
            self.send_ping(&self.inner.config.component_sub_domain, "", move |response| {
                if let Some(component) = component.upgrade() {
                    component.ping_result(response);
                }
            })
            .map(|_| ())
        } else {
            self.write(" ", None)
        };
        if let Err(e) = sent {
            warn!(error = %e, "Keep-alive failed, reconnecting");
            self.reconnect();
        }
    }

    fn ping_result(&self, response: IqResponse) {
        if response.ok {
            return;
        }
        match response.error.map(|e| e.kind) {
            Some(StanzaErrorKind::RecipientUnavailable) => {
                warn!("Ping unanswered, reconnecting");
                self.reconnect();
            }
            kind => {
                info!(error = ?kind, "Server does not support ping, using whitespace keep-alive");
                lock(&self.inner.keep_alive).supports_ping = false;
            }
        }
    }
}

/// Error stanza handed to the callback of a request whose retries ran out.
fn timeout_response(seq: u32, to: &str) -> IqResponse {
    let error = StanzaError::with_text(StanzaErrorKind::RecipientUnavailable, "Timeout.");
    let stanza = Element::new("iq", NS_COMPONENT)
        .with_attr("type", "error")
        .with_attr("from", to)
        .with_attr("id", &seq.to_string())
        .with_child(
            Element::new("error", NS_COMPONENT)
                .with_attr("type", error.error_type.as_str())
                .with_child(Element::new("recipient-unavailable", NS_STANZAS).with_attr("xmlns", NS_STANZAS))
                .with_child(
                    Element::new("text", NS_STANZAS)
                        .with_attr("xmlns", NS_STANZAS)
                        .with_text("Timeout."),
                ),
        );
    IqResponse {
        ok: false,
        id: seq,
        from: to.to_string(),
        to: String::new(),
        stanza,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ErrorType;

    #[test]
    fn test_timeout_response() {
        let response = timeout_response(12, "a@example.org");
        assert!(!response.ok);
        assert_eq!(response.id, 12);
        let error = response.error.clone().unwrap();
        assert_eq!(error.kind, StanzaErrorKind::RecipientUnavailable);
        assert_eq!(error.error_type, ErrorType::Wait);
        assert_eq!(StanzaError::from_stanza(&response.stanza), error);
        assert_eq!(
            response.stanza.to_xml(),
            "<iq type='error' from='a@example.org' id='12'><error type='wait'><recipient-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>Timeout.</text></error></iq>"
        );
    }
}
