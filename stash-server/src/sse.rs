//! Server-Sent Events stream of recorded history events.
//!
//! Each SSE event is named after the event type, carries the event `seq` as
//! its id, and has the JSON event as data. Clients resume with `after` or the
//! standard `Last-Event-ID` header.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use stash::bus::EventFilter;
use stash::core::types::Event;
use tracing::{debug, warn};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    project_id: String,
    conversation_id: Option<String>,
    after: Option<i64>,
}

/// SSE endpoint handler.
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    state.store.get_project(&query.project_id)?;
    let after = query.after.or_else(|| last_event_id(&headers));
    let filter = EventFilter {
        project_id: query.project_id,
        conversation_id: query.conversation_id,
    };
    debug!(project_id = %filter.project_id, ?after, "sse client subscribed");
    let mut subscription = state.store.subscribe(filter, after)?;

    let stream = async_stream::stream! {
        yield Ok(SseEvent::default().event("connected").data("{}"));

        while let Some(event) = subscription.next().await {
            match to_sse(&event) {
                Ok(sse) => yield Ok(sse),
                Err(err) => warn!(seq = event.seq, err = %err, "could not encode event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn to_sse(event: &Event) -> Result<SseEvent, axum::Error> {
    SseEvent::default()
        .event(event.event_type.as_str())
        .id(event.seq.to_string())
        .json_data(event)
}

fn last_event_id(headers: &HeaderMap) -> Option<i64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use stash::engine::{Engine, EngineSettings};
    use stash::io::adapter::ExecutionAdapter;
    use stash::test_support::{ScriptedAdapter, TestProject};
    use tower::ServiceExt;

    use super::*;
    use crate::routes::app;

    #[test]
    fn last_event_id_parses_sequence() {
        let mut headers = HeaderMap::new();
        assert_eq!(last_event_id(&headers), None);
        headers.insert("last-event-id", "42".parse().expect("header"));
        assert_eq!(last_event_id(&headers), Some(42));
        headers.insert("last-event-id", "abc".parse().expect("header"));
        assert_eq!(last_event_id(&headers), None);
    }

    /// Verifies the stream replays the backlog with type names and seq ids, then goes live.
    #[tokio::test]
    async fn stream_replays_backlog_then_live_events() {
        let project = TestProject::new();
        let adapter: Arc<dyn ExecutionAdapter> = Arc::new(ScriptedAdapter::new());
        let engine = Arc::new(
            Engine::start(Arc::clone(&project.store), adapter, EngineSettings::default())
                .expect("engine"),
        );
        let app = app(AppState::new(engine));

        let uri = format!(
            "/events/stream?project_id={}&conversation_id={}&after=0",
            project.project.id, project.conversation.id
        );
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );

        let mut body = response.into_body().into_data_stream();
        let mut text = String::new();
        let mut said = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !text.contains("event: message_created") {
            if text.contains("event: conversation_created") && !said {
                project.say("live message");
                said = true;
            }
            let chunk = tokio::time::timeout_at(deadline, body.next())
                .await
                .expect("stream produced events in time")
                .expect("stream open")
                .expect("chunk");
            text.push_str(&String::from_utf8_lossy(&chunk));
        }

        assert!(text.contains("event: connected"));
        assert!(text.contains("id: 1\n"));
        assert!(text.contains("\"type\":\"conversation_created\""));
    }

    #[tokio::test]
    async fn stream_for_unknown_project_is_not_found() {
        let project = TestProject::new();
        let adapter: Arc<dyn ExecutionAdapter> = Arc::new(ScriptedAdapter::new());
        let engine = Arc::new(
            Engine::start(Arc::clone(&project.store), adapter, EngineSettings::default())
                .expect("engine"),
        );
        let request = Request::builder()
            .uri("/events/stream?project_id=proj_missing")
            .body(Body::empty())
            .expect("request");
        let response = app(AppState::new(engine))
            .oneshot(request)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
