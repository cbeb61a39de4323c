use crate::model::{ObjectId, OsAccount, OsAccountInstance, Realm, RealmId};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Change notifications published after a transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountEvent {
    AccountsAdded {
        accounts: Vec<OsAccount>,
    },
    AccountsUpdated {
        accounts: Vec<OsAccount>,
    },
    AccountsMerged {
        source_id: ObjectId,
        destination: OsAccount,
    },
    InstancesAdded {
        instances: Vec<OsAccountInstance>,
    },
    RealmsAdded {
        realms: Vec<Realm>,
    },
    RealmsUpdated {
        realms: Vec<Realm>,
    },
    RealmsMerged {
        source_id: RealmId,
        destination: Realm,
    },
}

impl AccountEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccountsAdded { .. } => "accounts_added",
            Self::AccountsUpdated { .. } => "accounts_updated",
            Self::AccountsMerged { .. } => "accounts_merged",
            Self::InstancesAdded { .. } => "instances_added",
            Self::RealmsAdded { .. } => "realms_added",
            Self::RealmsUpdated { .. } => "realms_updated",
            Self::RealmsMerged { .. } => "realms_merged",
        }
    }
}

/// Receiver for committed changes. Implementations must not block for long;
/// they run on the committing worker thread.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: AccountEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: AccountEvent) {}
}

/// Keeps every published event in memory. Mostly useful in tests.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<AccountEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AccountEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn drain(&self) -> Vec<AccountEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: AccountEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_counts_by_kind_and_drains() {
        let sink = RecordingEventSink::new();
        sink.publish(AccountEvent::InstancesAdded { instances: vec![] });
        sink.publish(AccountEvent::AccountsAdded { accounts: vec![] });
        sink.publish(AccountEvent::InstancesAdded { instances: vec![] });

        assert_eq!(sink.count("instances_added"), 2);
        assert_eq!(sink.drain().len(), 3);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(AccountEvent::RealmsAdded { realms: vec![] })
            .expect("serialize event");
        assert_eq!(json["kind"], "realms_added");
    }
}
