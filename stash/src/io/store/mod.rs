//! Durable history: projects, conversations, messages, runs, steps, and events.
//!
//! One SQLite database holds every project. All access goes through a single
//! connection mutex, so each write is a serialized critical section; events
//! recorded by a write are published to the [`EventBus`] after commit but
//! before the lock is released, which keeps live delivery order identical to
//! the recorded `seq` order.

mod conversations;
mod events;
mod messages;
mod projects;
mod rows;
mod runs;
mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::core::types::Event;
use crate::error::StashResult;

pub use conversations::ConversationUpdate;
pub use events::MAX_EVENT_PAGE;

/// Upper bound for one page of messages.
pub const MAX_PAGE_LIMIT: usize = 500;

pub struct HistoryStore {
    conn: Mutex<Connection>,
    bus: EventBus,
}

impl HistoryStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> StashResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "opened history store");
        Self::with_connection(conn)
    }

    /// Private in-memory database; used by tests and dry runs.
    pub fn open_in_memory() -> StashResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StashResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::install(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            bus: EventBus::new(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> StashResult<T>) -> StashResult<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` in an immediate transaction, then publish whatever events it recorded.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut Vec<Event>) -> StashResult<T>,
    ) -> StashResult<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut recorded = Vec::new();
        let value = f(&tx, &mut recorded)?;
        tx.commit()?;
        for event in &recorded {
            debug!(seq = event.seq, event_type = %event.event_type, "publishing event");
            self.bus.publish(event);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/dir/stash.db");
        HistoryStore::open(&path).expect("open");
        assert!(path.exists());
        // Reopening an existing database keeps the schema idempotent.
        HistoryStore::open(&path).expect("reopen");
    }
}
