//! Run engine: turns a triggering message into planned, validated, executed steps.
//!
//! Runs are executed by a fixed pool of worker threads. Each run stays on one
//! worker from start to finish. The engine's own state is transient: which
//! conversation has an active run, whether cancellation was requested, and a
//! per-project lock serializing `execute` calls. Everything durable goes
//! through the [`HistoryStore`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{error, info, instrument, warn};

use crate::core::policy::{CommandPlan, CommandPolicy, ValidatedCommand, plan_commands};
use crate::core::summary::{
    StepReport, assistant_message, failure_detail, output_summary, tool_message, truncate_chars,
};
use crate::core::types::{
    EventType, Message, NewEvent, NewMessage, Project, Role, Run, RunMode, RunStatus, StepKind,
    StepStatus,
};
use crate::error::{StashError, StashResult};
use crate::io::adapter::{AdapterError, ExecuteRequest, ExecutionAdapter, PlanRequest};
use crate::io::config::StashConfig;
use crate::io::paths::FsResolver;
use crate::io::prompt::{PlannerInputs, render_planner_prompt};
use crate::io::store::HistoryStore;

const PLANNER_PREVIEW_CHARS: usize = 1_200;
const PLANNED_COMMANDS_LISTED: usize = 12;

/// Tunables for the engine, usually derived from [`StashConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workers: usize,
    pub planner_timeout: Duration,
    pub executor_timeout: Duration,
    pub transcript_limit: usize,
    pub policy: CommandPolicy,
}

impl EngineSettings {
    pub fn from_config(cfg: &StashConfig) -> Self {
        Self {
            workers: cfg.engine.workers,
            planner_timeout: cfg.planner.timeout(),
            executor_timeout: cfg.executor.timeout(),
            transcript_limit: cfg.engine.transcript_limit,
            policy: cfg.command_policy(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&StashConfig::default())
    }
}

/// Serializes `execute` calls per project so two runs never mutate one tree at once.
#[derive(Default)]
pub struct ProjectLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    /// Run `f` while holding the lock for `project_id`.
    pub fn with_lock<T>(&self, project_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(project_id.to_string()).or_default())
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }
}

#[derive(Debug, Default)]
struct ControlState {
    cancelled: bool,
    /// A worker has taken ownership of the run; only it may finalize.
    claimed: bool,
    finalized: bool,
}

#[derive(Debug)]
struct RunControl {
    run_id: String,
    state: Mutex<ControlState>,
}

impl RunControl {
    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_requested(&self) -> bool {
        self.state().cancelled
    }

    /// Take ownership of a queued run unless it was already cancelled or closed.
    fn claim(&self) -> bool {
        let mut state = self.state();
        if state.cancelled || state.finalized {
            return false;
        }
        state.claimed = true;
        true
    }
}

struct Job {
    run_id: String,
    conversation_id: String,
    control: Arc<RunControl>,
}

/// How a run ended, plus what the closing assistant message says.
enum Outcome {
    Done { summary: String },
    Failed { summary: Option<String>, error: String },
    Cancelled,
}

struct Shared {
    store: Arc<HistoryStore>,
    adapter: Arc<dyn ExecutionAdapter>,
    settings: EngineSettings,
    /// conversation id -> control of its active run
    active: Mutex<HashMap<String, Arc<RunControl>>>,
    released: Condvar,
    locks: ProjectLocks,
}

/// Handle to the worker pool. Cheap to share behind an `Arc`.
pub struct Engine {
    shared: Arc<Shared>,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Start the worker pool.
    ///
    /// Runs left pending or running by a previous process can never finish,
    /// so they are failed before any new work is accepted.
    pub fn start(
        store: Arc<HistoryStore>,
        adapter: Arc<dyn ExecutionAdapter>,
        settings: EngineSettings,
    ) -> StashResult<Self> {
        let workers = settings.workers.max(1);
        let shared = Arc::new(Shared {
            store,
            adapter,
            settings,
            active: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            locks: ProjectLocks::default(),
        });
        shared.fail_interrupted_runs()?;

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers)
            .map(|index| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("stash-worker-{index}"))
                    .spawn(move || worker_loop(&shared, &rx))
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(workers, "run engine started");

        Ok(Self {
            shared,
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.shared.store
    }

    /// Create a pending run for `trigger_message_id` and queue it.
    #[instrument(skip_all, fields(conversation_id = %conversation_id, trigger_message_id = %trigger_message_id))]
    pub fn start_run(
        &self,
        conversation_id: &str,
        trigger_message_id: &str,
        mode: RunMode,
    ) -> StashResult<Run> {
        let shared = &self.shared;
        let (run, control) = {
            let mut active = shared.active();
            if let Some(control) = active.get(conversation_id) {
                return Err(StashError::conflict(format!(
                    "conversation {conversation_id} already has active run {}",
                    control.run_id
                )));
            }
            let run = shared
                .store
                .create_run(conversation_id, trigger_message_id, mode)?;
            let control = Arc::new(RunControl {
                run_id: run.id.clone(),
                state: Mutex::new(ControlState::default()),
            });
            active.insert(conversation_id.to_string(), Arc::clone(&control));
            (run, control)
        };

        let job = Job {
            run_id: run.id.clone(),
            conversation_id: conversation_id.to_string(),
            control,
        };
        let sent = match self.jobs.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(job).map_err(|err| err.0),
            None => Err(job),
        };
        if let Err(job) = sent {
            warn!(run_id = %job.run_id, "engine is shut down; failing run");
            let recorded = shared.finalize(&job, "", &Outcome::Failed {
                summary: None,
                error: "engine is shut down".to_string(),
            });
            shared.release(&job);
            recorded?;
            return Err(StashError::conflict("engine is shut down"));
        }
        info!(run_id = %run.id, %mode, "run queued");
        Ok(run)
    }

    /// Start a new run for the message that triggered `message_id`'s run.
    ///
    /// A user message is its own trigger. A message produced by a run (it
    /// carries `run_id` metadata) retries that run's trigger.
    pub fn retry_from_message(&self, message_id: &str, mode: RunMode) -> StashResult<Run> {
        let message = self.shared.store.get_message(message_id)?;
        let trigger_id = match message.metadata.get("run_id").and_then(Value::as_str) {
            Some(run_id) if message.role != Role::User => {
                self.shared.store.get_run(run_id)?.trigger_message_id
            }
            _ => message.id.clone(),
        };
        self.start_run(&message.conversation_id, &trigger_id, mode)
    }

    /// Request cancellation.
    ///
    /// A run no worker has claimed yet is cancelled on the spot. A claimed
    /// run is cancelled by its worker once the current adapter call returns,
    /// so the returned record may still read `running`. Terminal runs are
    /// returned unchanged.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn cancel_run(&self, run_id: &str) -> StashResult<Run> {
        let shared = &self.shared;
        let run = shared.store.get_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let control = shared
            .active()
            .get(&run.conversation_id)
            .filter(|c| c.run_id == run_id)
            .cloned();
        let Some(control) = control else {
            // Not tracked by this engine; nothing can be executing it.
            let job = Job {
                run_id: run.id.clone(),
                conversation_id: run.conversation_id.clone(),
                control: Arc::new(RunControl {
                    run_id: run.id.clone(),
                    state: Mutex::new(ControlState::default()),
                }),
            };
            shared.finalize(&job, "", &Outcome::Cancelled)?;
            return shared.store.get_run(run_id);
        };

        let job = Job {
            run_id: run.id.clone(),
            conversation_id: run.conversation_id.clone(),
            control: Arc::clone(&control),
        };
        {
            let mut state = control.state();
            state.cancelled = true;
            if state.claimed || state.finalized {
                info!("cancellation requested for in-flight run");
                drop(state);
                return shared.store.get_run(run_id);
            }
            // A worker that picks the job up now sees `cancelled` and skips it.
            state.finalized = true;
        }
        shared.finalize(&job, "", &Outcome::Cancelled)?;
        shared.release(&job);
        info!("pending run cancelled");
        shared.store.get_run(run_id)
    }

    /// Block until `run_id` is no longer active or `timeout` elapses, then
    /// return its current record.
    pub fn wait_for_run(&self, run_id: &str, timeout: Duration) -> StashResult<Run> {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        let mut active = shared.active();
        while active.values().any(|c| c.run_id == run_id) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            active = shared
                .released
                .wait_timeout(active, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(active);
        shared.store.get_run(run_id)
    }

    /// Whether `conversation_id` currently has a run owned by this engine.
    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.shared.active().contains_key(conversation_id)
    }

    /// Stop accepting runs and wait for queued and in-flight runs to finish.
    pub fn shutdown(&self) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Closing the queue lets idle workers exit; busy ones finish their run.
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn worker_loop(shared: &Shared, rx: &Mutex<mpsc::Receiver<Job>>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        let Ok(job) = job else {
            return;
        };
        let result = catch_unwind(AssertUnwindSafe(|| shared.process(&job)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => shared.crash(&job, &err.to_string()),
            Err(_) => shared.crash(&job, "worker panicked"),
        }
        shared.release(&job);
    }
}

/// Everything a worker needs to know about the run it is driving.
struct RunContext {
    project_id: String,
    root: PathBuf,
    trigger: Message,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<RunControl>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the active slot for `job` (if still ours) and wake waiters.
    fn release(&self, job: &Job) {
        let mut active = self.active();
        if active
            .get(&job.conversation_id)
            .is_some_and(|c| Arc::ptr_eq(c, &job.control))
        {
            active.remove(&job.conversation_id);
        }
        self.released.notify_all();
    }

    fn fail_interrupted_runs(&self) -> StashResult<()> {
        for run in self.store.list_active_runs()? {
            warn!(run_id = %run.id, status = %run.status, "failing run interrupted by restart");
            let job = Job {
                run_id: run.id.clone(),
                conversation_id: run.conversation_id.clone(),
                control: Arc::new(RunControl {
                    run_id: run.id.clone(),
                    state: Mutex::new(ControlState::default()),
                }),
            };
            self.finalize(&job, "", &Outcome::Failed {
                summary: None,
                error: "interrupted: the engine restarted before the run finished".to_string(),
            })?;
        }
        Ok(())
    }

    /// Last-resort failure for a run whose pipeline returned an error.
    fn crash(&self, job: &Job, error: &str) {
        error!(run_id = %job.run_id, error, "run crashed");
        let outcome = Outcome::Failed {
            summary: Some("Run crashed".to_string()),
            error: error.to_string(),
        };
        if let Err(err) = self.finalize(job, "", &outcome) {
            error!(run_id = %job.run_id, err = %err, "could not record crashed run");
        }
    }

    fn record(&self, ctx: &RunContext, job: &Job, event_type: EventType, payload: Value) -> StashResult<()> {
        self.store.record_event(
            NewEvent::new(event_type, &ctx.project_id)
                .conversation(&job.conversation_id)
                .run(&job.run_id)
                .payload(payload),
        )?;
        Ok(())
    }

    /// Drive one run to a terminal state.
    #[instrument(skip_all, fields(run_id = %job.run_id, conversation_id = %job.conversation_id))]
    fn process(&self, job: &Job) -> StashResult<()> {
        if !job.control.claim() {
            return Ok(());
        }
        self.drive(job)
    }

    fn drive(&self, job: &Job) -> StashResult<()> {
        let run = self.store.get_run(&job.run_id)?;
        let trigger = self.store.get_message(&run.trigger_message_id)?;
        let project = self.store.get_project(&run.project_id)?;
        let ctx = RunContext {
            project_id: project.id.clone(),
            root: PathBuf::from(&project.root_path),
            trigger,
        };

        self.store
            .update_run_status(&job.run_id, RunStatus::Running, None, None)?;
        self.record(
            &ctx,
            job,
            EventType::RunStarted,
            json!({ "trigger_message_id": ctx.trigger.id, "mode": run.mode }),
        )?;
        info!("run started");
        if job.control.cancel_requested() {
            return self.finalize(job, "", &Outcome::Cancelled);
        }

        let planner_text = match self.plan(&ctx, job, &project)? {
            Ok(text) => text,
            Err(err) => {
                let outcome = if job.control.cancel_requested() {
                    Outcome::Cancelled
                } else {
                    Outcome::Failed {
                        summary: Some("Planner failed".to_string()),
                        error: err.to_string(),
                    }
                };
                return self.finalize(job, "", &outcome);
            }
        };
        if job.control.cancel_requested() {
            return self.finalize(job, &planner_text, &Outcome::Cancelled);
        }

        let plan = plan_commands(&planner_text, &ctx.root, &self.settings.policy, &FsResolver);
        self.record_planned(&ctx, job, &planner_text, &plan)?;
        if !plan.is_clean() {
            let detail = plan.rejection_detail();
            warn!(rejections = plan.rejections.len(), "planner output rejected");
            return self.finalize(job, &planner_text, &Outcome::Failed {
                summary: Some(format!(
                    "0 step(s) executed, {} block(s) rejected",
                    plan.rejections.len()
                )),
                error: detail,
            });
        }

        let mut reports = Vec::with_capacity(plan.commands.len());
        let mut failures = 0;
        let mut stopped_by = None;
        for command in &plan.commands {
            if job.control.cancel_requested() {
                break;
            }
            let (step_index, report) = self.execute(&ctx, job, command)?;
            if !report.succeeded() {
                failures += 1;
            }
            if let StepReport::Errored { error } = &report {
                stopped_by = Some(error.clone());
            }
            reports.push((step_index, report));
            if stopped_by.is_some() {
                break;
            }
        }

        let content = assistant_message(&planner_text, &reports);
        let outcome = if job.control.cancel_requested() {
            Outcome::Cancelled
        } else if failures == 0 {
            Outcome::Done {
                summary: output_summary(plan.commands.len(), 0),
            }
        } else {
            Outcome::Failed {
                summary: Some(output_summary(plan.commands.len(), failures)),
                error: stopped_by.unwrap_or_else(|| "One or more run steps failed".to_string()),
            }
        };
        self.finalize_with_content(job, content, &outcome)
    }

    /// Record the plan step and call the planner.
    ///
    /// The outer error is an infrastructure failure; the inner one is the
    /// adapter's, which ends the run normally as failed.
    fn plan(
        &self,
        ctx: &RunContext,
        job: &Job,
        project: &Project,
    ) -> StashResult<Result<String, AdapterError>> {
        let conversation = self.store.get_conversation(&job.conversation_id)?;
        let transcript = self.store.transcript(
            &job.conversation_id,
            Some(ctx.trigger.sequence_no),
            self.settings.transcript_limit,
        )?;
        let prompt = render_planner_prompt(&PlannerInputs {
            project,
            summary: conversation.summary.as_deref(),
            transcript: &transcript,
            trigger: &ctx.trigger,
        });
        let prompt = match prompt {
            Ok(prompt) => prompt,
            Err(err) => {
                return Ok(Err(AdapterError::Decode {
                    message: format!("could not render planner prompt: {err:#}"),
                }));
            }
        };

        let step = self.store.append_run_step(
            &job.run_id,
            StepKind::Plan,
            json!({
                "trigger_message_id": ctx.trigger.id,
                "transcript_messages": transcript.len(),
                "prompt_bytes": prompt.len(),
            }),
        )?;
        self.record(
            ctx,
            job,
            EventType::RunStepStarted,
            json!({ "step_index": step.step_index, "kind": StepKind::Plan }),
        )?;

        let result = self.adapter.plan(&PlanRequest {
            prompt,
            project_root: ctx.root.clone(),
            timeout: self.settings.planner_timeout,
        });

        match &result {
            Ok(text) => {
                self.store.finish_run_step(
                    &job.run_id,
                    step.step_index,
                    StepStatus::Completed,
                    Some(&json!({ "planner_text": text })),
                    None,
                )?;
                self.record(
                    ctx,
                    job,
                    EventType::RunStepCompleted,
                    json!({ "step_index": step.step_index, "status": StepStatus::Completed }),
                )?;
            }
            Err(err) => {
                warn!(err = %err, "planner call failed");
                let output = err.diagnostics().map(|d| json!({ "diagnostics": d }));
                let message = err.to_string();
                self.store.finish_run_step(
                    &job.run_id,
                    step.step_index,
                    StepStatus::Failed,
                    output.as_ref(),
                    Some(&message),
                )?;
                self.record(
                    ctx,
                    job,
                    EventType::RunStepCompleted,
                    json!({
                        "step_index": step.step_index,
                        "status": StepStatus::Failed,
                        "error": message,
                    }),
                )?;
            }
        }
        Ok(result)
    }

    fn record_planned(
        &self,
        ctx: &RunContext,
        job: &Job,
        planner_text: &str,
        plan: &CommandPlan,
    ) -> StashResult<()> {
        info!(
            commands = plan.commands.len(),
            rejections = plan.rejections.len(),
            "planner produced commands"
        );
        let commands: Vec<&str> = plan
            .commands
            .iter()
            .take(PLANNED_COMMANDS_LISTED)
            .map(|c| c.cmd.as_str())
            .collect();
        self.record(
            ctx,
            job,
            EventType::RunPlanned,
            json!({
                "command_count": plan.commands.len(),
                "commands": commands,
                "rejections": plan.rejections,
                "planner_preview": truncate_chars(planner_text, PLANNER_PREVIEW_CHARS),
            }),
        )
    }

    /// Run one validated command as an execute step.
    fn execute(
        &self,
        ctx: &RunContext,
        job: &Job,
        command: &ValidatedCommand,
    ) -> StashResult<(i64, StepReport)> {
        let step = self.store.append_run_step(
            &job.run_id,
            StepKind::Execute,
            json!({
                "block_index": command.block_index,
                "worktree": command.worktree,
                "cwd": command.cwd,
                "cmd": command.cmd,
            }),
        )?;
        let step_index = step.step_index;
        self.record(
            ctx,
            job,
            EventType::RunStepStarted,
            json!({
                "step_index": step_index,
                "kind": StepKind::Execute,
                "block_index": command.block_index,
            }),
        )?;

        let request = ExecuteRequest {
            command: command.cmd.clone(),
            cwd: command.cwd.clone(),
            worktree: command.worktree.clone(),
            timeout: self.settings.executor_timeout,
        };
        let result = self
            .locks
            .with_lock(&ctx.project_id, || self.adapter.execute(&request));

        let report = match result {
            Ok(outcome) => {
                let status = if outcome.succeeded() {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                };
                let detail = (!outcome.succeeded())
                    .then(|| failure_detail(&outcome.stdout, &outcome.stderr))
                    .flatten();
                self.store.finish_run_step(
                    &job.run_id,
                    step_index,
                    status,
                    Some(&json!({
                        "exit_code": outcome.exit_code,
                        "stdout": outcome.stdout,
                        "stderr": outcome.stderr,
                        "truncated": outcome.truncated,
                        "cwd": command.cwd,
                        "worktree": command.worktree,
                    })),
                    None,
                )?;
                let mut payload = json!({
                    "step_index": step_index,
                    "status": status,
                    "exit_code": outcome.exit_code,
                });
                if let Some(detail) = &detail {
                    payload["detail"] = json!(detail);
                }
                self.record(ctx, job, EventType::RunStepCompleted, payload)?;
                self.store.append_message(
                    &job.conversation_id,
                    NewMessage::new(
                        Role::Tool,
                        tool_message(&command.cmd, outcome.exit_code, &outcome.stdout, &outcome.stderr),
                    )
                    .with_parent(&ctx.trigger.id)
                    .with_parts(vec![json!({
                        "type": "command_execution",
                        "cmd": command.cmd,
                        "cwd": command.cwd,
                        "worktree": command.worktree,
                        "exit_code": outcome.exit_code,
                    })])
                    .with_metadata(json!({ "run_id": job.run_id, "step_index": step_index })),
                )?;
                StepReport::Exited {
                    exit_code: outcome.exit_code,
                    detail,
                }
            }
            Err(err) => {
                warn!(step_index, err = %err, "execute call failed");
                let message = err.to_string();
                let output = err.diagnostics().map(|d| json!({ "diagnostics": d }));
                self.store.finish_run_step(
                    &job.run_id,
                    step_index,
                    StepStatus::Failed,
                    output.as_ref(),
                    Some(&message),
                )?;
                self.record(
                    ctx,
                    job,
                    EventType::RunStepCompleted,
                    json!({
                        "step_index": step_index,
                        "status": StepStatus::Failed,
                        "error": message,
                    }),
                )?;
                StepReport::Errored { error: message }
            }
        };
        Ok((step_index, report))
    }

    /// Close a run: assistant message, terminal status, terminal event.
    fn finalize(&self, job: &Job, planner_text: &str, outcome: &Outcome) -> StashResult<()> {
        let text = planner_text.trim();
        let explanation = match outcome {
            Outcome::Done { .. } => String::new(),
            Outcome::Failed { error, .. } => format!("Run failed:\n{error}"),
            Outcome::Cancelled => "Run cancelled.".to_string(),
        };
        let content = match (text.is_empty(), explanation.is_empty()) {
            (true, _) => explanation,
            (false, true) => text.to_string(),
            (false, false) => format!("{text}\n\n{explanation}"),
        };
        self.finalize_with_content(job, content, outcome)
    }

    fn finalize_with_content(&self, job: &Job, content: String, outcome: &Outcome) -> StashResult<()> {
        let run = self.store.get_run(&job.run_id)?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let content = match outcome {
            Outcome::Cancelled if !content.contains("Run cancelled.") => {
                format!("{content}\n\nRun cancelled.").trim().to_string()
            }
            _ if content.trim().is_empty() => "(no reply)".to_string(),
            _ => content,
        };
        // The terminal status is recorded even when the closing message is refused.
        if let Err(err) = self.store.append_message(
            &job.conversation_id,
            NewMessage::new(Role::Assistant, content)
                .with_parent(&run.trigger_message_id)
                .with_metadata(json!({ "run_id": job.run_id })),
        ) {
            warn!(run_id = %job.run_id, err = %err, "could not record closing assistant message");
        }

        let (status, summary, error, event_type, payload) = match outcome {
            Outcome::Done { summary } => (
                RunStatus::Done,
                Some(summary.as_str()),
                None,
                EventType::RunCompleted,
                json!({ "output_summary": summary }),
            ),
            Outcome::Failed { summary, error } => (
                RunStatus::Failed,
                summary.as_deref(),
                Some(error.as_str()),
                EventType::RunFailed,
                json!({ "output_summary": summary, "error": error }),
            ),
            Outcome::Cancelled => (
                RunStatus::Cancelled,
                Some("Cancelled by user"),
                None,
                EventType::RunCancelled,
                json!({ "reason": "user_request" }),
            ),
        };
        self.store
            .update_run_status(&job.run_id, status, summary, error)?;
        self.store.record_event(
            NewEvent::new(event_type, &run.project_id)
                .conversation(&job.conversation_id)
                .run(&job.run_id)
                .payload(payload),
        )?;
        job.control.state().finalized = true;
        info!(run_id = %job.run_id, %status, "run finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedAdapter, TestProject};

    fn shared(project: &TestProject, adapter: &Arc<ScriptedAdapter>) -> Shared {
        Shared {
            store: Arc::clone(&project.store),
            adapter: Arc::clone(adapter) as Arc<dyn ExecutionAdapter>,
            settings: EngineSettings::default(),
            active: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            locks: ProjectLocks::default(),
        }
    }

    fn queued_job(project: &TestProject) -> Job {
        let trigger = project.say("tidy the readme");
        let run = project
            .store
            .create_run(&project.conversation.id, &trigger, RunMode::Manual)
            .expect("run");
        Job {
            run_id: run.id.clone(),
            conversation_id: project.conversation.id.clone(),
            control: Arc::new(RunControl {
                run_id: run.id,
                state: Mutex::new(ControlState::default()),
            }),
        }
    }

    #[test]
    fn cancelled_job_cannot_be_claimed() {
        let project = TestProject::new();
        let job = queued_job(&project);
        job.control.state().cancelled = true;
        assert!(!job.control.claim());
        assert!(!job.control.state().claimed);
    }

    #[test]
    fn cancel_after_claim_skips_the_planner() {
        let project = TestProject::new();
        let adapter = Arc::new(ScriptedAdapter::new());
        let shared = shared(&project, &adapter);
        let job = queued_job(&project);

        assert!(job.control.claim());
        job.control.state().cancelled = true;
        shared.drive(&job).expect("drive");

        assert!(adapter.calls().is_empty());
        let run = project.store.get_run(&job.run_id).expect("run");
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.started_at.is_some());
        assert!(project.store.run_steps(&job.run_id).expect("steps").is_empty());
    }
}
