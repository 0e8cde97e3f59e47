//! XMPP external component (XEP-0114) connection engine.
//!
//! See [`component::XmppComponent`] for the entry point.

pub mod component;

pub use component::{
    ComponentConfig, ComponentError, ComponentEvents, ConnectionState, Endpoint, OutgoingMessage, QosLevel,
    RetryPolicy, XmppComponent,
};
