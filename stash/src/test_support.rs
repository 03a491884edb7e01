//! Test-only helpers: a scripted execution adapter and a throwaway project.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::core::types::{Conversation, NewMessage, Project, Role};
use crate::io::adapter::{AdapterError, ExecOutcome, ExecuteRequest, ExecutionAdapter, PlanRequest};
use crate::io::store::HistoryStore;

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    Plan { prompt: String },
    Execute { command: String, cwd: PathBuf, worktree: String },
}

/// Holds `execute` calls until opened, so tests can act while a step is in flight.
#[derive(Debug, Default)]
pub struct ExecuteGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    entered: usize,
    open: bool,
}

impl ExecuteGate {
    /// Wait until at least one `execute` call is blocked on the gate.
    pub fn wait_until_entered(&self, timeout: Duration) -> bool {
        self.wait_for_entries(1, timeout)
    }

    /// Wait until `count` `execute` calls have reached the gate.
    pub fn wait_for_entries(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.entered < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn entered(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).entered
    }

    /// Let every current and future `execute` call through.
    pub fn open(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).open = true;
        self.changed.notify_all();
    }

    fn pass(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entered += 1;
        self.changed.notify_all();
        while !state.open {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Default)]
struct Script {
    plans: VecDeque<Result<String, AdapterError>>,
    executions: VecDeque<Result<ExecOutcome, AdapterError>>,
    calls: Vec<AdapterCall>,
    /// cwd -> (executes in flight, most ever in flight at once)
    overlap: HashMap<PathBuf, (usize, usize)>,
}

/// Adapter that replays queued responses and never spawns a process.
///
/// An exhausted plan queue answers with prose only; an exhausted execute
/// queue answers with a successful empty outcome.
#[derive(Default)]
pub struct ScriptedAdapter {
    script: Mutex<Script>,
    gate: Option<Arc<ExecuteGate>>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapter whose `execute` calls block on the returned gate.
    pub fn gated() -> (Self, Arc<ExecuteGate>) {
        let gate = Arc::new(ExecuteGate::default());
        let adapter = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (adapter, gate)
    }

    pub fn push_plan(&self, text: impl Into<String>) -> &Self {
        self.lock().plans.push_back(Ok(text.into()));
        self
    }

    pub fn push_plan_error(&self, err: AdapterError) -> &Self {
        self.lock().plans.push_back(Err(err));
        self
    }

    pub fn push_exit(&self, exit_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.lock().executions.push_back(Ok(ExecOutcome {
            exit_code,
            output: format!("{stdout}{stderr}"),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            truncated: false,
        }));
        self
    }

    pub fn push_execute_error(&self, err: AdapterError) -> &Self {
        self.lock().executions.push_back(Err(err));
        self
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.lock().calls.clone()
    }

    /// Most `execute` calls that were ever in flight together for `cwd`.
    pub fn peak_concurrent_executes(&self, cwd: &Path) -> usize {
        self.lock().overlap.get(cwd).map_or(0, |&(_, peak)| peak)
    }

    pub fn execute_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, AdapterCall::Execute { .. }))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExecutionAdapter for ScriptedAdapter {
    fn plan(&self, request: &PlanRequest) -> Result<String, AdapterError> {
        let mut script = self.lock();
        script.calls.push(AdapterCall::Plan {
            prompt: request.prompt.clone(),
        });
        script
            .plans
            .pop_front()
            .unwrap_or_else(|| Ok("Nothing to do.".to_string()))
    }

    fn execute(&self, request: &ExecuteRequest) -> Result<ExecOutcome, AdapterError> {
        let response = {
            let mut script = self.lock();
            script.calls.push(AdapterCall::Execute {
                command: request.command.clone(),
                cwd: request.cwd.clone(),
                worktree: request.worktree.clone(),
            });
            let (in_flight, peak) = script.overlap.entry(request.cwd.clone()).or_default();
            *in_flight += 1;
            *peak = (*peak).max(*in_flight);
            script.executions.pop_front()
        };
        if let Some(gate) = &self.gate {
            gate.pass();
        }
        if let Some((in_flight, _)) = self.lock().overlap.get_mut(&request.cwd) {
            *in_flight -= 1;
        }
        response.unwrap_or_else(|| {
            Ok(ExecOutcome {
                exit_code: 0,
                output: String::new(),
                stdout: String::new(),
                stderr: String::new(),
                truncated: false,
            })
        })
    }
}

/// A temp project root with an open in-memory store, one project, and one conversation.
pub struct TestProject {
    pub temp: tempfile::TempDir,
    pub store: Arc<HistoryStore>,
    pub project: Project,
    pub conversation: Conversation,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(HistoryStore::open_in_memory().expect("open store"));
        let project = store
            .open_project(Some("test"), temp.path())
            .expect("open project");
        let conversation = store
            .create_conversation(&project.id, "main")
            .expect("create conversation");
        Self {
            temp,
            store,
            project,
            conversation,
        }
    }

    /// Canonical project root.
    pub fn root(&self) -> &Path {
        Path::new(&self.project.root_path)
    }

    /// Append a user message to the default conversation and return its id.
    pub fn say(&self, content: &str) -> String {
        self.store
            .append_message(&self.conversation.id, NewMessage::new(Role::User, content))
            .expect("append user message")
            .0
            .id
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

/// Planner reply containing one command block rooted at `cwd`.
pub fn command_block(cwd: &Path, cmd: &str) -> String {
    format!(
        "<codex_cmd>\nworktree: main\ncwd: {}\ncmd: {cmd}\n</codex_cmd>",
        cwd.display()
    )
}
