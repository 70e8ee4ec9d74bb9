//! Who caused a state transition.

use warden_eventlog::{ActorType, AuditRecord};

/// Actor stamped on audit entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub kind: ActorType,
    pub id: Option<String>,
}

impl Actor {
    /// The reconciler and other autonomous daemon work
    pub fn daemon() -> Self {
        Self { kind: ActorType::Daemon, id: None }
    }

    /// Kill switch and scheduled jobs
    pub fn system() -> Self {
        Self { kind: ActorType::System, id: None }
    }

    /// An operator acting through the API
    pub fn user(id: Option<String>) -> Self {
        Self { kind: ActorType::User, id }
    }

    pub(crate) fn stamp(&self, record: AuditRecord) -> AuditRecord {
        record.with_actor(self.kind, self.id.clone())
    }
}
