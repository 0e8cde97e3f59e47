use super::framing::FramingError;
use super::stanza::StanzaError;
use super::xml::{Element, XmlError};
use thiserror::Error;

pub const NS_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    #[error("XML error: {0}")]
    Xml(#[from] XmlError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    #[error("stanza error: {0}")]
    Stanza(#[from] StanzaError),
    #[error("request timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("handler already registered for {local_name} in {namespace}")]
    AlreadyRegistered { local_name: String, namespace: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// A stream-level `<stream:error>` received from the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{condition}{}", text_suffix(.text))]
pub struct StreamError {
    pub condition: String,
    pub text: Option<String>,
    /// Content of a `see-other-host` condition.
    pub redirect: Option<String>,
}

fn text_suffix(text: &Option<String>) -> String {
    text.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
}

impl StreamError {
    pub fn from_element(element: &Element) -> Self {
        let mut error = Self {
            condition: String::from("undefined-condition"),
            text: None,
            redirect: None,
        };
        for child in element.elements().filter(|e| e.namespace == NS_STREAMS) {
            if child.local_name == "text" {
                error.text = Some(child.text());
                continue;
            }
            if child.local_name == "see-other-host" {
                error.redirect = Some(child.text().trim().to_string());
            }
            error.condition = child.local_name.clone();
        }
        error
    }

    /// Redirect target of a `see-other-host` error.
    pub fn see_other_host(&self) -> Option<&str> {
        self.redirect.as_deref().filter(|t| !t.is_empty())
    }
}
