use rusqlite::{Connection, params};

use super::HistoryStore;
use super::projects::project_tx;
use super::rows::{self, EVENT_COLUMNS};
use crate::bus::{EventFilter, Subscription};
use crate::core::types::{Event, NewEvent};
use crate::error::StashResult;
use crate::io::ids::{new_id, now_timestamp};

/// Upper bound for one replay page.
pub const MAX_EVENT_PAGE: usize = 1_000;

impl HistoryStore {
    /// Append an event and publish it to live subscribers.
    pub fn record_event(&self, event: NewEvent) -> StashResult<Event> {
        self.write(|tx, recorded| {
            project_tx(tx, &event.project_id)?;
            emit(tx, recorded, event)
        })
    }

    /// Recorded events matching `filter` with `seq > after`, oldest first.
    pub fn list_events(
        &self,
        filter: &EventFilter,
        after: Option<i64>,
        limit: usize,
    ) -> StashResult<Vec<Event>> {
        let limit = limit.clamp(1, MAX_EVENT_PAGE);
        self.read(|conn| events_after(conn, filter, after.unwrap_or(0), Some(limit)))
    }

    /// Subscribe to events matching `filter`.
    ///
    /// With `after`, every recorded event past that cursor is delivered first,
    /// followed by live events, with nothing missed or repeated in between.
    pub fn subscribe(&self, filter: EventFilter, after: Option<i64>) -> StashResult<Subscription> {
        let conn = self.lock();
        let backlog = match after {
            Some(after) => events_after(&conn, &filter, after, None)?,
            None => Vec::new(),
        };
        Ok(self.bus.subscribe_with_backlog(filter, backlog))
    }
}

/// Insert `event` inside the caller's transaction and queue it for publishing.
pub(super) fn emit(
    conn: &Connection,
    recorded: &mut Vec<Event>,
    event: NewEvent,
) -> StashResult<Event> {
    let id = new_id("evt");
    let created_at = now_timestamp();
    conn.execute(
        "INSERT INTO events \
         (id, event_type, project_id, conversation_id, run_id, created_at, payload_json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            event.event_type.as_str(),
            event.project_id,
            event.conversation_id,
            event.run_id,
            created_at,
            serde_json::to_string(&event.payload)?,
        ],
    )?;
    let recorded_event = Event {
        id,
        seq: conn.last_insert_rowid(),
        event_type: event.event_type,
        project_id: event.project_id,
        conversation_id: event.conversation_id,
        run_id: event.run_id,
        created_at,
        payload: event.payload,
    };
    recorded.push(recorded_event.clone());
    Ok(recorded_event)
}

fn events_after(
    conn: &Connection,
    filter: &EventFilter,
    after: i64,
    limit: Option<usize>,
) -> StashResult<Vec<Event>> {
    // SQLite treats a negative LIMIT as unbounded.
    let limit = limit.map_or(-1, |l| l as i64);
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM events \
         WHERE project_id = ?1 AND (?2 IS NULL OR conversation_id = ?2) AND seq > ?3 \
         ORDER BY seq LIMIT ?4"
    ))?;
    let events = stmt
        .query_map(
            params![filter.project_id, filter.conversation_id, after, limit],
            rows::event,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EventType;
    use serde_json::json;

    #[test]
    fn recorded_events_replay_in_seq_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open_in_memory().expect("store");
        let project = store.open_project(None, temp.path()).expect("project");

        let a = store
            .record_event(NewEvent::new(EventType::RunStarted, &project.id).run("run_a"))
            .expect("a");
        let b = store
            .record_event(
                NewEvent::new(EventType::RunCompleted, &project.id)
                    .run("run_a")
                    .payload(json!({"steps": 0})),
            )
            .expect("b");
        assert!(b.seq > a.seq);

        let filter = EventFilter::project(&project.id);
        let all = store.list_events(&filter, None, 100).expect("list");
        assert_eq!(all, vec![a.clone(), b.clone()]);
        let tail = store.list_events(&filter, Some(a.seq), 100).expect("tail");
        assert_eq!(tail, vec![b]);
    }

    #[test]
    fn unknown_project_event_is_rejected() {
        let store = HistoryStore::open_in_memory().expect("store");
        let err = store
            .record_event(NewEvent::new(EventType::RunStarted, "proj_missing"))
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn subscribe_with_cursor_replays_then_streams() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open_in_memory().expect("store");
        let project = store.open_project(None, temp.path()).expect("project");
        let first = store
            .record_event(NewEvent::new(EventType::RunStarted, &project.id))
            .expect("first");

        let mut sub = store
            .subscribe(EventFilter::project(&project.id), Some(0))
            .expect("subscribe");
        let second = store
            .record_event(NewEvent::new(EventType::RunFailed, &project.id))
            .expect("second");

        assert_eq!(sub.drain(), vec![first, second]);
    }
}
