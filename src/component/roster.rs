//! Roster collaborator consulted during assured-message admission.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    None,
    To,
    From,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterItem {
    pub bare_jid: String,
    pub name: Option<String>,
    pub subscription: SubscriptionState,
}

impl RosterItem {
    pub fn new(bare_jid: impl Into<String>) -> Self {
        Self {
            bare_jid: bare_jid.into(),
            name: None,
            subscription: SubscriptionState::Both,
        }
    }
}

/// Looks up senders by bare address. Called synchronously from the read task, so
/// implementations must not block for long.
pub trait RosterLookup: Send + Sync {
    fn lookup(&self, bare_jid: &str) -> Option<RosterItem>;
}

/// In-memory roster.
#[derive(Debug, Default)]
pub struct StaticRoster {
    items: RwLock<HashMap<String, RosterItem>>,
}

impl StaticRoster {
    pub fn new<I, S>(bare_jids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roster = Self::default();
        for jid in bare_jids {
            roster.add(RosterItem::new(jid));
        }
        roster
    }

    pub fn add(&self, item: RosterItem) {
        super::write(&self.items).insert(item.bare_jid.clone(), item);
    }

    pub fn remove(&self, bare_jid: &str) -> Option<RosterItem> {
        super::write(&self.items).remove(bare_jid)
    }
}

impl RosterLookup for StaticRoster {
    fn lookup(&self, bare_jid: &str) -> Option<RosterItem> {
        super::read(&self.items).get(bare_jid).cloned()
    }
}
