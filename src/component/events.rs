//! Notifications raised by the component.

use super::error::ComponentError;
use super::stanza::{MessageEvent, PresenceEvent};
use super::XmppComponent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    StreamNegotiation,
    Authenticating,
    Connected,
    FetchingRoster,
    SettingPresence,
    Offline,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::StreamNegotiation => "stream-negotiation",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::FetchingRoster => "fetching-roster",
            Self::SettingPresence => "setting-presence",
            Self::Offline => "offline",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Receives component notifications. Every method defaults to doing nothing.
///
/// Methods run on the read task (or the scheduler for timeouts) with no component
/// lock held, so they may call back into the component.
#[allow(unused_variables)]
pub trait ComponentEvents: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState) {}

    /// The connection was lost or failed for good.
    fn on_connection_error(&self, error: &ComponentError) {}

    /// A non-fatal failure, e.g. a message handler error.
    fn on_error(&self, error: &ComponentError) {}

    /// available, unavailable, error and probe presences.
    fn on_presence(&self, component: &XmppComponent, presence: &PresenceEvent) {}
    fn on_presence_subscribe(&self, component: &XmppComponent, presence: &PresenceEvent) {}
    fn on_presence_subscribed(&self, component: &XmppComponent, presence: &PresenceEvent) {}
    fn on_presence_unsubscribe(&self, component: &XmppComponent, presence: &PresenceEvent) {}
    fn on_presence_unsubscribed(&self, component: &XmppComponent, presence: &PresenceEvent) {}

    fn on_chat_message(&self, component: &XmppComponent, message: &MessageEvent) {}
    fn on_error_message(&self, component: &XmppComponent, message: &MessageEvent) {}
    fn on_group_chat_message(&self, component: &XmppComponent, message: &MessageEvent) {}
    fn on_headline_message(&self, component: &XmppComponent, message: &MessageEvent) {}
    fn on_normal_message(&self, component: &XmppComponent, message: &MessageEvent) {}
}
