//! Handler tables for iq get, iq set and message payloads, plus the advertised
//! feature set behind service discovery.

use super::error::ComponentError;
use super::stanza::{HandlerError, IqRequest, MessageEvent};
use super::xml::encode;
use super::XmppComponent;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_PING: &str = "urn:xmpp:ping";

/// Handles an incoming iq get or set. The handler answers through the component
/// (`send_iq_result`); an `Err` is turned into an error response by the dispatcher.
pub type IqHandler = Arc<dyn Fn(&XmppComponent, &IqRequest) -> Result<(), HandlerError> + Send + Sync>;

/// Handles an incoming message whose payload matched the handler's key.
pub type MessageHandler =
    Arc<dyn Fn(&XmppComponent, &MessageEvent) -> Result<(), HandlerError> + Send + Sync>;

struct Entry<H> {
    handler: H,
    advertise: bool,
}

/// Handlers keyed by (local name, namespace).
pub(crate) struct HandlerTable<H: ?Sized> {
    entries: HashMap<(String, String), Entry<Arc<H>>>,
}

impl<H: ?Sized> Default for HandlerTable<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H: ?Sized> HandlerTable<H> {
    fn register(
        &mut self,
        local_name: &str,
        namespace: &str,
        handler: Arc<H>,
        advertise: bool,
    ) -> Result<(), ComponentError> {
        let key = (local_name.to_string(), namespace.to_string());
        if self.entries.contains_key(&key) {
            return Err(ComponentError::AlreadyRegistered {
                local_name: key.0,
                namespace: key.1,
            });
        }
        self.entries.insert(key, Entry { handler, advertise });
        Ok(())
    }

    /// Removes the entry only if it holds this exact handler. Returns whether the
    /// removed entry was advertised.
    fn unregister(&mut self, local_name: &str, namespace: &str, handler: &Arc<H>) -> Option<bool> {
        let key = (local_name.to_string(), namespace.to_string());
        let entry = self.entries.get(&key)?;
        if !same_handler(&entry.handler, handler) {
            return None;
        }
        self.entries.remove(&key).map(|e| e.advertise)
    }

    pub fn find(&self, local_name: &str, namespace: &str) -> Option<Arc<H>> {
        self.entries
            .get(&(local_name.to_string(), namespace.to_string()))
            .map(|e| e.handler.clone())
    }
}

fn same_handler<H: ?Sized>(a: &Arc<H>, b: &Arc<H>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

type IqFn = dyn Fn(&XmppComponent, &IqRequest) -> Result<(), HandlerError> + Send + Sync;
type MessageFn = dyn Fn(&XmppComponent, &MessageEvent) -> Result<(), HandlerError> + Send + Sync;

/// Which iq table a handler goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Get,
    Set,
}

#[derive(Default)]
pub(crate) struct Registry {
    iq_get: HandlerTable<IqFn>,
    iq_set: HandlerTable<IqFn>,
    message: HandlerTable<MessageFn>,
    features: BTreeSet<String>,
}

impl Registry {
    pub fn register_iq(
        &mut self,
        kind: IqKind,
        local_name: &str,
        namespace: &str,
        handler: IqHandler,
        advertise: bool,
    ) -> Result<(), ComponentError> {
        self.iq_table_mut(kind)
            .register(local_name, namespace, handler, advertise)?;
        if advertise {
            self.features.insert(namespace.to_string());
        }
        Ok(())
    }

    pub fn unregister_iq(&mut self, kind: IqKind, local_name: &str, namespace: &str, handler: &IqHandler) -> bool {
        match self.iq_table_mut(kind).unregister(local_name, namespace, handler) {
            Some(advertised) => {
                if advertised {
                    self.features.remove(namespace);
                }
                true
            }
            None => false,
        }
    }

    pub fn register_message(
        &mut self,
        local_name: &str,
        namespace: &str,
        handler: MessageHandler,
        advertise: bool,
    ) -> Result<(), ComponentError> {
        self.message.register(local_name, namespace, handler, advertise)?;
        if advertise {
            self.features.insert(namespace.to_string());
        }
        Ok(())
    }

    pub fn unregister_message(&mut self, local_name: &str, namespace: &str, handler: &MessageHandler) -> bool {
        match self.message.unregister(local_name, namespace, handler) {
            Some(advertised) => {
                if advertised {
                    self.features.remove(namespace);
                }
                true
            }
            None => false,
        }
    }

    pub fn find_iq(&self, kind: IqKind, local_name: &str, namespace: &str) -> Option<IqHandler> {
        match kind {
            IqKind::Get => self.iq_get.find(local_name, namespace),
            IqKind::Set => self.iq_set.find(local_name, namespace),
        }
    }

    pub fn find_message(&self, local_name: &str, namespace: &str) -> Option<MessageHandler> {
        self.message.find(local_name, namespace)
    }

    /// Returns false if the feature was already registered.
    pub fn register_feature(&mut self, namespace: &str) -> bool {
        self.features.insert(namespace.to_string())
    }

    pub fn unregister_feature(&mut self, namespace: &str) -> bool {
        self.features.remove(namespace)
    }

    pub fn features(&self) -> Vec<String> {
        self.features.iter().cloned().collect()
    }

    fn iq_table_mut(&mut self, kind: IqKind) -> &mut HandlerTable<IqFn> {
        match kind {
            IqKind::Get => &mut self.iq_get,
            IqKind::Set => &mut self.iq_set,
        }
    }
}

/// disco#info responder: configured identity plus every advertised feature.
pub(crate) fn disco_info(component: &XmppComponent, request: &IqRequest) -> Result<(), HandlerError> {
    let identity = &component.config().identity;
    let mut xml = format!(
        "<query xmlns='{NS_DISCO_INFO}'><identity category='{}' type='{}' name='{}'/>",
        encode(&identity.category),
        encode(&identity.kind),
        encode(&identity.name),
    );
    for feature in component.features() {
        xml.push_str(&format!("<feature var='{}'/>", encode(&feature)));
    }
    xml.push_str("</query>");
    component
        .send_iq_result(request, &xml)
        .map_err(|e| HandlerError::Internal(e.to_string()))
}

/// XEP-0199 ping responder.
pub(crate) fn ping(component: &XmppComponent, request: &IqRequest) -> Result<(), HandlerError> {
    component
        .send_iq_result(request, "")
        .map_err(|e| HandlerError::Internal(e.to_string()))
}
