use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use super::HistoryStore;
use super::conversations::conversation_tx;
use super::messages::message_tx;
use super::rows::{self, RUN_COLUMNS, STEP_COLUMNS};
use crate::core::types::{ConversationStatus, Run, RunMode, RunStatus, RunStep, StepKind, StepStatus};
use crate::error::{StashError, StashResult};
use crate::io::ids::{new_id, now_timestamp};

impl HistoryStore {
    /// Create a pending run for `trigger_message_id`.
    ///
    /// Fails with a conflict while the conversation is archived or already has
    /// a pending or running run.
    pub fn create_run(
        &self,
        conversation_id: &str,
        trigger_message_id: &str,
        mode: RunMode,
    ) -> StashResult<Run> {
        self.write(|tx, _| {
            let conversation = conversation_tx(tx, conversation_id)?;
            let trigger = message_tx(tx, trigger_message_id)?;
            if trigger.conversation_id != conversation.id {
                return Err(StashError::not_found("message", trigger_message_id));
            }
            if conversation.status == ConversationStatus::Archived {
                return Err(StashError::conflict(format!(
                    "conversation {conversation_id} is archived"
                )));
            }
            if let Some(active) = active_run_tx(tx, conversation_id)? {
                return Err(StashError::conflict(format!(
                    "conversation {conversation_id} already has {} run {}",
                    active.status, active.id
                )));
            }

            let id = new_id("run");
            tx.execute(
                "INSERT INTO runs \
                 (id, project_id, conversation_id, trigger_message_id, status, mode, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)",
                params![
                    id,
                    conversation.project_id,
                    conversation_id,
                    trigger_message_id,
                    mode.as_str(),
                    now_timestamp()
                ],
            )?;
            info!(run_id = %id, conversation_id, %mode, "created run");
            run_tx(tx, &id)
        })
    }

    pub fn get_run(&self, run_id: &str) -> StashResult<Run> {
        self.read(|conn| run_tx(conn, run_id))
    }

    /// Oldest first.
    pub fn list_runs(&self, conversation_id: &str) -> StashResult<Vec<Run>> {
        self.read(|conn| {
            conversation_tx(conn, conversation_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE conversation_id = ?1 \
                 ORDER BY created_at, rowid"
            ))?;
            let runs = stmt
                .query_map(params![conversation_id], rows::run)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    /// Pending or running run of a conversation, if any.
    pub fn active_run(&self, conversation_id: &str) -> StashResult<Option<Run>> {
        self.read(|conn| active_run_tx(conn, conversation_id))
    }

    /// Every pending or running run across all projects, oldest first.
    pub fn list_active_runs(&self) -> StashResult<Vec<Run>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ('pending', 'running') \
                 ORDER BY created_at, rowid"
            ))?;
            let runs = stmt
                .query_map([], rows::run)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    /// Most recent run triggered by `message_id`.
    pub fn latest_run_for_message(&self, message_id: &str) -> StashResult<Option<Run>> {
        self.read(|conn| {
            let run = conn
                .query_row(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM runs WHERE trigger_message_id = ?1 \
                         ORDER BY created_at DESC, rowid DESC LIMIT 1"
                    ),
                    params![message_id],
                    rows::run,
                )
                .optional()?;
            Ok(run)
        })
    }

    /// Move a run along the lifecycle.
    ///
    /// Illegal transitions (including any move out of a terminal state) are
    /// conflicts. `started_at` is stamped on `running`, `finished_at` on
    /// terminal states.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        output_summary: Option<&str>,
        error: Option<&str>,
    ) -> StashResult<Run> {
        self.write(|tx, _| {
            let run = run_tx(tx, run_id)?;
            if !run.status.can_transition_to(status) {
                return Err(StashError::conflict(format!(
                    "run {run_id} cannot move from {} to {status}",
                    run.status
                )));
            }
            let now = now_timestamp();
            let started_at = (status == RunStatus::Running).then_some(now.as_str());
            let finished_at = status.is_terminal().then_some(now.as_str());
            tx.execute(
                "UPDATE runs SET status = ?2, \
                   output_summary = COALESCE(?3, output_summary), \
                   error = COALESCE(?4, error), \
                   started_at = COALESCE(?5, started_at), \
                   finished_at = COALESCE(?6, finished_at) \
                 WHERE id = ?1",
                params![
                    run_id,
                    status.as_str(),
                    output_summary,
                    error,
                    started_at,
                    finished_at
                ],
            )?;
            debug!(run_id, from = %run.status, to = %status, "run status updated");
            run_tx(tx, run_id)
        })
    }

    /// Append the next step (contiguous from 0) in `running` state.
    pub fn append_run_step(
        &self,
        run_id: &str,
        kind: StepKind,
        input: Value,
    ) -> StashResult<RunStep> {
        self.write(|tx, _| {
            let run = run_tx(tx, run_id)?;
            if run.status != RunStatus::Running {
                return Err(StashError::conflict(format!(
                    "run {run_id} is {}, steps can only be added while running",
                    run.status
                )));
            }
            let step_index: i64 = tx.query_row(
                "SELECT COUNT(*) FROM run_steps WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO run_steps (run_id, step_index, kind, input_json, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![
                    run_id,
                    step_index,
                    kind.as_str(),
                    serde_json::to_string(&input)?,
                    now_timestamp()
                ],
            )?;
            step_tx(tx, run_id, step_index)
        })
    }

    /// Record the terminal outcome of a running step.
    pub fn finish_run_step(
        &self,
        run_id: &str,
        step_index: i64,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> StashResult<RunStep> {
        if status == StepStatus::Running {
            return Err(StashError::invalid("a step cannot be finished as running"));
        }
        self.write(|tx, _| {
            let step = step_tx(tx, run_id, step_index)?;
            if step.status != StepStatus::Running {
                return Err(StashError::conflict(format!(
                    "step {step_index} of run {run_id} is already {}",
                    step.status
                )));
            }
            let output = output.map(serde_json::to_string).transpose()?;
            tx.execute(
                "UPDATE run_steps SET status = ?3, output_json = ?4, error = ?5, finished_at = ?6 \
                 WHERE run_id = ?1 AND step_index = ?2",
                params![
                    run_id,
                    step_index,
                    status.as_str(),
                    output,
                    error,
                    now_timestamp()
                ],
            )?;
            step_tx(tx, run_id, step_index)
        })
    }

    /// Steps in index order.
    pub fn run_steps(&self, run_id: &str) -> StashResult<Vec<RunStep>> {
        self.read(|conn| {
            run_tx(conn, run_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 ORDER BY step_index"
            ))?;
            let steps = stmt
                .query_map(params![run_id], rows::step)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(steps)
        })
    }
}

fn run_tx(conn: &Connection, run_id: &str) -> StashResult<Run> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
        params![run_id],
        rows::run,
    )
    .optional()?
    .ok_or_else(|| StashError::not_found("run", run_id))
}

pub(super) fn active_run_tx(conn: &Connection, conversation_id: &str) -> StashResult<Option<Run>> {
    let run = conn
        .query_row(
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs \
                 WHERE conversation_id = ?1 AND status IN ('pending', 'running') LIMIT 1"
            ),
            params![conversation_id],
            rows::run,
        )
        .optional()?;
    Ok(run)
}

fn step_tx(conn: &Connection, run_id: &str, step_index: i64) -> StashResult<RunStep> {
    conn.query_row(
        &format!("SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 AND step_index = ?2"),
        params![run_id, step_index],
        rows::step,
    )
    .optional()?
    .ok_or_else(|| StashError::not_found("run step", format!("{run_id}#{step_index}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{NewMessage, Role};
    use crate::io::store::ConversationUpdate;
    use serde_json::json;

    struct Fixture {
        _temp: tempfile::TempDir,
        store: HistoryStore,
        conversation_id: String,
        trigger_id: String,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = HistoryStore::open_in_memory().expect("store");
        let project = store.open_project(None, temp.path()).expect("project");
        let conversation = store
            .create_conversation(&project.id, "chat")
            .expect("conversation");
        let (trigger, _) = store
            .append_message(&conversation.id, NewMessage::new(Role::User, "go"))
            .expect("trigger");
        Fixture {
            _temp: temp,
            store,
            conversation_id: conversation.id,
            trigger_id: trigger.id,
        }
    }

    fn archive(store: &HistoryStore, conversation_id: &str) -> StashResult<()> {
        store
            .update_conversation(
                conversation_id,
                &ConversationUpdate {
                    status: Some(ConversationStatus::Archived),
                    ..ConversationUpdate::default()
                },
            )
            .map(|_| ())
    }

    #[test]
    fn archiving_waits_for_active_run_and_blocks_new_ones() {
        let f = fixture();
        let run = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .expect("run");
        let err = archive(&f.store, &f.conversation_id).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        let conversation = f.store.get_conversation(&f.conversation_id).expect("get");
        assert_eq!(conversation.status, ConversationStatus::Active);

        f.store
            .update_run_status(&run.id, RunStatus::Failed, None, Some("stopped"))
            .expect("fail");
        archive(&f.store, &f.conversation_id).expect("archive after run ends");
        let err = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn second_active_run_is_conflict() {
        let f = fixture();
        let run = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .expect("run");
        assert_eq!(run.status, RunStatus::Pending);
        let err = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        f.store
            .update_run_status(&run.id, RunStatus::Cancelled, None, None)
            .expect("cancel");
        let next = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .expect("after cancel");
        assert_eq!(
            f.store.latest_run_for_message(&f.trigger_id).expect("latest"),
            Some(next)
        );
    }

    #[test]
    fn trigger_must_belong_to_conversation() {
        let f = fixture();
        let project_id = f
            .store
            .get_conversation(&f.conversation_id)
            .expect("conversation")
            .project_id;
        let other = f.store.create_conversation(&project_id, "other").expect("other");
        let err = f
            .store
            .create_run(&other.id, &f.trigger_id, RunMode::Manual)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn status_transitions_are_monotonic() {
        let f = fixture();
        let run = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .expect("run");
        let running = f
            .store
            .update_run_status(&run.id, RunStatus::Running, None, None)
            .expect("running");
        assert!(running.started_at.is_some());
        let done = f
            .store
            .update_run_status(&run.id, RunStatus::Done, Some("1 step(s) executed"), None)
            .expect("done");
        assert!(done.finished_at.is_some());
        assert_eq!(done.output_summary.as_deref(), Some("1 step(s) executed"));

        let err = f
            .store
            .update_run_status(&run.id, RunStatus::Running, None, None)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn steps_are_contiguous_and_finish_once() {
        let f = fixture();
        let run = f
            .store
            .create_run(&f.conversation_id, &f.trigger_id, RunMode::Manual)
            .expect("run");
        let err = f
            .store
            .append_run_step(&run.id, StepKind::Plan, json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        f.store
            .update_run_status(&run.id, RunStatus::Running, None, None)
            .expect("running");
        let plan = f
            .store
            .append_run_step(&run.id, StepKind::Plan, json!({"prompt_bytes": 10}))
            .expect("plan");
        let exec = f
            .store
            .append_run_step(&run.id, StepKind::Execute, json!({"cmd": "ls"}))
            .expect("exec");
        assert_eq!((plan.step_index, exec.step_index), (0, 1));

        let finished = f
            .store
            .finish_run_step(&run.id, 1, StepStatus::Completed, Some(&json!({"exit_code": 0})), None)
            .expect("finish");
        assert_eq!(finished.status, StepStatus::Completed);
        assert!(finished.finished_at.is_some());
        let err = f
            .store
            .finish_run_step(&run.id, 1, StepStatus::Failed, None, Some("late"))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        let steps = f.store.run_steps(&run.id).expect("steps");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Running);
    }
}
