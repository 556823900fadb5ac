//! Registry of live relayed connections
//!
//! Each entry pairs the client's [`ConnectionRecord`] with its [`Session`], so
//! an id is present with both or not at all. The live-connection count is the
//! registry size; nothing is counted separately.

use crate::session::{SecurityViolation, Session};
use dashmap::DashMap;
use hyperion_connection::{ConnectionId, ConnectionRecord};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    #[error("Record and session belong to different connections ({record} != {session})")]
    MismatchedEntry {
        record: ConnectionId,
        session: ConnectionId,
    },
}

/// A registered connection
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub record: Arc<ConnectionRecord>,
    pub session: Arc<Session>,
}

/// Concurrent id → (record, session) map
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: DashMap<ConnectionId, ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a connection's record and session together
    pub fn insert(
        &self,
        record: Arc<ConnectionRecord>,
        session: Arc<Session>,
    ) -> Result<(), RegistryError> {
        let id = record.id();
        if session.id() != id {
            return Err(RegistryError::MismatchedEntry {
                record: id,
                session: session.id(),
            });
        }

        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry { record, session });
                trace!(connection_id = %id, "Registered connection");
                Ok(())
            }
        }
    }

    /// Remove a connection, returning its entry if it was registered
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let removed = self.entries.remove(id).map(|(_, entry)| entry);
        if removed.is_some() {
            trace!(connection_id = %id, "Deregistered connection");
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn record(&self, id: &ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.entries.get(id).map(|entry| entry.record.clone())
    }

    pub fn session(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.entries.get(id).map(|entry| entry.session.clone())
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every registered entry.
    ///
    /// Safe to call while other tasks insert and remove; entries registered
    /// after the snapshot is taken are not included.
    pub fn snapshot(&self) -> Vec<ConnectionEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of every registered record
    pub fn records(&self) -> Vec<Arc<ConnectionRecord>> {
        self.entries
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Disconnect every registered connection, returning how many were hit
    pub fn disconnect_all(&self) -> usize {
        let records = self.records();
        for record in &records {
            record.disconnect();
        }
        records.len()
    }

    /// Revoke the session of a registered connection
    pub fn revoke(&self, id: &ConnectionId, reason: &str) -> Option<SecurityViolation> {
        self.session(id).map(|session| session.revoke(reason))
    }
}
