//! Event fan-out to live subscribers, plus a reducer for reconstructing state.
//!
//! The bus itself holds no history. The history store publishes every event
//! while it still holds its write lock, and registers subscribers under that
//! same lock after reading their backlog, so a subscriber sees one gap-free
//! sequence in recorded order.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::types::{Event, EventType, RunStatus};

/// Scope of a subscription or replay query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub project_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl EventFilter {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            conversation_id: None,
        }
    }

    pub fn conversation(project_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            conversation_id: Some(conversation_id.into()),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if event.project_id != self.project_id {
            return false;
        }
        match &self.conversation_id {
            Some(conversation_id) => event.conversation_id.as_deref() == Some(conversation_id),
            None => true,
        }
    }
}

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<Event>,
}

/// In-process fan-out of recorded events.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live-only subscriber.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_backlog(filter, Vec::new())
    }

    /// Register a subscriber whose channel is pre-filled with `backlog`.
    ///
    /// Callers must hold whatever lock serializes `publish`, otherwise events
    /// published between reading the backlog and registering are lost.
    pub(crate) fn subscribe_with_backlog(
        &self,
        filter: EventFilter,
        backlog: Vec<Event>,
    ) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in backlog {
            // The receiver is alive: we still own it.
            let _ = tx.send(event);
        }
        let mut subscribers = self.lock();
        subscribers.push(Subscriber { filter, tx });
        debug!(subscribers = subscribers.len(), "subscriber registered");
        Subscription { rx }
    }

    /// Deliver `event` to every matching subscriber, pruning closed ones.
    pub fn publish(&self, event: &Event) {
        let mut subscribers = self.lock();
        subscribers.retain(|sub| {
            if sub.tx.is_closed() {
                return false;
            }
            if !sub.filter.matches(event) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|sub| !sub.tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// All events delivered so far.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

/// Observable state of a run as reconstructed from events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunView {
    pub conversation_id: Option<String>,
    pub status: Option<RunStatus>,
    pub command_count: Option<u64>,
    /// step index -> last reported step status (`running`, `completed`, `failed`).
    pub steps: BTreeMap<i64, String>,
}

/// Observable state of a conversation as reconstructed from events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationView {
    pub title: Option<String>,
    pub status: Option<String>,
    /// Message ids in `sequence_no` order.
    pub messages: Vec<String>,
}

/// Deterministic fold over an event stream.
///
/// Folding a replayed history and folding the same events received live must
/// produce equal views; tests rely on this to check delivery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimelineView {
    pub conversations: BTreeMap<String, ConversationView>,
    pub runs: BTreeMap<String, RunView>,
    pub last_seq: i64,
    pub event_count: usize,
}

impl TimelineView {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut view = Self::default();
        for event in events {
            view.apply(event);
        }
        view
    }

    pub fn apply(&mut self, event: &Event) {
        self.last_seq = self.last_seq.max(event.seq);
        self.event_count += 1;
        let payload = &event.payload;

        match event.event_type {
            EventType::ConversationCreated | EventType::ConversationUpdated => {
                let Some(conversation) = payload.get("conversation") else {
                    return;
                };
                if let Some(id) = str_field(conversation, "id") {
                    let view = self.conversations.entry(id.to_string()).or_default();
                    view.title = str_field(conversation, "title").map(str::to_string);
                    view.status = str_field(conversation, "status").map(str::to_string);
                }
            }
            EventType::MessageCreated => {
                if let (Some(conversation_id), Some(message_id)) = (
                    event.conversation_id.as_deref(),
                    payload.get("message").and_then(|m| str_field(m, "id")),
                ) {
                    self.conversations
                        .entry(conversation_id.to_string())
                        .or_default()
                        .messages
                        .push(message_id.to_string());
                }
            }
            EventType::RunStarted => self.run_status(event, RunStatus::Running),
            EventType::RunPlanned => {
                if let Some(view) = self.run_view(event) {
                    view.command_count = payload.get("command_count").and_then(Value::as_u64);
                }
            }
            EventType::RunStepStarted | EventType::RunStepCompleted => {
                let index = payload.get("step_index").and_then(Value::as_i64);
                let status = str_field(payload, "status")
                    .unwrap_or("running")
                    .to_string();
                if let (Some(index), Some(view)) = (index, self.run_view(event)) {
                    view.steps.insert(index, status);
                }
            }
            EventType::RunCompleted => self.run_status(event, RunStatus::Done),
            EventType::RunFailed => self.run_status(event, RunStatus::Failed),
            EventType::RunCancelled => self.run_status(event, RunStatus::Cancelled),
        }
    }

    fn run_view(&mut self, event: &Event) -> Option<&mut RunView> {
        let run_id = event.run_id.as_deref()?;
        let view = self.runs.entry(run_id.to_string()).or_default();
        if view.conversation_id.is_none() {
            view.conversation_id = event.conversation_id.clone();
        }
        Some(view)
    }

    fn run_status(&mut self, event: &Event, status: RunStatus) {
        if let Some(view) = self.run_view(event) {
            view.status = Some(status);
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: i64, event_type: EventType, conversation: &str, payload: Value) -> Event {
        Event {
            id: format!("evt_{seq}"),
            seq,
            event_type,
            project_id: "proj_a".to_string(),
            conversation_id: Some(conversation.to_string()),
            run_id: Some("run_1".to_string()),
            created_at: format!("2026-01-01T00:00:{seq:02}.000000Z"),
            payload,
        }
    }

    #[test]
    fn filter_scopes_by_project_and_conversation() {
        let e = event(1, EventType::RunStarted, "conv_1", json!({}));
        assert!(EventFilter::project("proj_a").matches(&e));
        assert!(!EventFilter::project("proj_b").matches(&e));
        assert!(EventFilter::conversation("proj_a", "conv_1").matches(&e));
        assert!(!EventFilter::conversation("proj_a", "conv_2").matches(&e));
    }

    #[test]
    fn publish_delivers_in_order_and_prunes_closed() {
        let bus = EventBus::new();
        let mut kept = bus.subscribe(EventFilter::project("proj_a"));
        let dropped = bus.subscribe(EventFilter::project("proj_a"));
        let mut other = bus.subscribe(EventFilter::conversation("proj_a", "conv_2"));
        drop(dropped);

        for seq in 1..=3 {
            bus.publish(&event(seq, EventType::RunStarted, "conv_1", json!({})));
        }

        let seqs: Vec<i64> = kept.drain().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(other.try_next().is_none());
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn backlog_precedes_live_events() {
        let bus = EventBus::new();
        let backlog = vec![event(1, EventType::RunStarted, "conv_1", json!({}))];
        let mut sub = bus.subscribe_with_backlog(EventFilter::project("proj_a"), backlog);
        bus.publish(&event(2, EventType::RunCompleted, "conv_1", json!({})));
        let seqs: Vec<i64> = sub.drain().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn timeline_folds_run_lifecycle() {
        let events = vec![
            event(1, EventType::RunStarted, "conv_1", json!({})),
            event(2, EventType::RunPlanned, "conv_1", json!({"command_count": 1})),
            event(3, EventType::RunStepStarted, "conv_1", json!({"step_index": 1})),
            event(
                4,
                EventType::RunStepCompleted,
                "conv_1",
                json!({"step_index": 1, "status": "completed"}),
            ),
            event(
                5,
                EventType::MessageCreated,
                "conv_1",
                json!({"message": {"id": "msg_9"}}),
            ),
            event(6, EventType::RunCompleted, "conv_1", json!({})),
        ];
        let view = TimelineView::from_events(&events);
        let run = &view.runs["run_1"];
        assert_eq!(run.status, Some(RunStatus::Done));
        assert_eq!(run.command_count, Some(1));
        assert_eq!(run.steps.get(&1).map(String::as_str), Some("completed"));
        assert_eq!(view.conversations["conv_1"].messages, vec!["msg_9"]);
        assert_eq!(view.last_seq, 6);
    }
}
