//! Supervised child processes for the agent command lines.
//!
//! The child receives its input on stdin. Both output streams are drained on
//! background threads into bounded [`Capture`]s, so a chatty child can never
//! block on a full pipe. On unix the child leads its own process group, and
//! the whole group is killed when the deadline passes so that helpers it
//! started cannot keep the pipes open.

use std::fmt;
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8 * 1024;

/// Bytes kept from one output stream, plus how many were discarded past the limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Capture {
    /// Read `reader` to EOF, keeping at most `limit` bytes.
    fn drain(mut reader: impl Read, limit: usize) -> io::Result<Self> {
        let mut capture = Self::default();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => return Ok(capture),
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            let room = limit.saturating_sub(capture.bytes.len()).min(n);
            capture.bytes.extend_from_slice(&chunk[..room]);
            capture.dropped += n - room;
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// How a supervised child ended.
#[derive(Debug)]
pub struct ChildRun {
    pub status: ExitStatus,
    pub stdout: Capture,
    pub stderr: Capture,
    /// The deadline passed and the child was killed.
    pub timed_out: bool,
}

impl ChildRun {
    pub fn truncated(&self) -> bool {
        self.stdout.dropped > 0 || self.stderr.dropped > 0
    }

    /// Both streams with truncation and timeout notes, for failure reports.
    pub fn diagnostics(&self, label: &str) -> String {
        let mut out = String::new();
        for (stream, capture) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            out.push_str(&format!("[{label} {stream}]\n{}\n", capture.text().trim_end()));
            if capture.dropped > 0 {
                out.push_str(&format!("({label} {stream}: {} bytes dropped)\n", capture.dropped));
            }
        }
        if self.timed_out {
            out.push_str(&format!("({label} timed out)\n"));
        }
        out
    }
}

#[derive(Debug)]
pub enum ProcessError {
    /// The program could not be started (missing binary, permissions, bad cwd).
    Launch { program: String, source: io::Error },
    /// Starting succeeded but supervising the child failed.
    Supervise { action: &'static str, source: io::Error },
    /// A pipe thread panicked.
    Pipe(&'static str),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Launch { program, source } => write!(f, "failed to launch `{program}`: {source}"),
            Self::Supervise { action, source } => write!(f, "{action}: {source}"),
            Self::Pipe(stream) => write!(f, "{stream} pipe thread panicked"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Launch { source, .. } | Self::Supervise { source, .. } => Some(source),
            Self::Pipe(_) => None,
        }
    }
}

/// Limits applied to one child.
#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    pub deadline: Duration,
    /// Per-stream cap on retained output.
    pub output_limit: usize,
}

impl Supervisor {
    /// Spawn `cmd`, feed it `input`, and wait for exit or the deadline.
    ///
    /// A timed-out child is killed and its partial output is still returned.
    #[instrument(skip_all, fields(deadline_secs = self.deadline.as_secs(), output_limit = self.output_limit))]
    pub fn run(&self, mut cmd: Command, input: &[u8]) -> Result<ChildRun, ProcessError> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd.spawn().map_err(|source| {
            error!(program = %program, err = %source, "could not spawn child");
            ProcessError::Launch {
                program: program.clone(),
                source,
            }
        })?;
        debug!(program = %program, pid = child.id(), "child spawned");

        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_vec();
            thread::spawn(move || match stdin.write_all(&input) {
                // A child may exit without consuming its input.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            })
        });
        let limit = self.output_limit;
        let stdout = child
            .stdout
            .take()
            .map(|pipe| thread::spawn(move || Capture::drain(pipe, limit)));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| thread::spawn(move || Capture::drain(pipe, limit)));

        let (status, timed_out) = match child
            .wait_timeout(self.deadline)
            .map_err(supervise("wait for child"))?
        {
            Some(status) => (status, false),
            None => {
                warn!(program = %program, "deadline passed, killing child");
                terminate(&mut child).map_err(supervise("kill child"))?;
                (child.wait().map_err(supervise("reap child"))?, true)
            }
        };

        if let Some(writer) = writer {
            join(writer, "stdin")?.map_err(supervise("write stdin"))?;
        }
        let stdout = collect(stdout, "stdout")?;
        let stderr = collect(stderr, "stderr")?;

        let run = ChildRun {
            status,
            stdout,
            stderr,
            timed_out,
        };
        if run.truncated() {
            warn!(
                stdout_dropped = run.stdout.dropped,
                stderr_dropped = run.stderr.dropped,
                "child output truncated"
            );
        }
        debug!(exit_code = ?run.status.code(), timed_out, "child finished");
        Ok(run)
    }
}

/// Kill the child along with everything left in its process group.
#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pid = i32::try_from(child.id()).map_err(|_| io::Error::other("pid out of range"))?;
    killpg(Pid::from_raw(pid), Signal::SIGKILL).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn supervise(action: &'static str) -> impl FnOnce(io::Error) -> ProcessError {
    move |source| ProcessError::Supervise { action, source }
}

fn join<T>(handle: JoinHandle<T>, stream: &'static str) -> Result<T, ProcessError> {
    handle.join().map_err(|_| ProcessError::Pipe(stream))
}

fn collect(
    reader: Option<JoinHandle<io::Result<Capture>>>,
    stream: &'static str,
) -> Result<Capture, ProcessError> {
    match reader {
        Some(handle) => join(handle, stream)?.map_err(supervise("read child output")),
        None => Ok(Capture::default()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    fn supervisor(deadline: Duration, output_limit: usize) -> Supervisor {
        Supervisor {
            deadline,
            output_limit,
        }
    }

    #[test]
    fn separates_streams_and_reports_exit_code() {
        let run = supervisor(Duration::from_secs(10), 1_000)
            .run(shell("cat; echo oops >&2; exit 3"), b"from stdin")
            .expect("run");
        assert_eq!(run.status.code(), Some(3));
        assert_eq!(run.stdout.text(), "from stdin");
        assert_eq!(run.stderr.text(), "oops\n");
        assert!(!run.timed_out);
        assert!(!run.truncated());
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let big = vec![b'x'; 1 << 20];
        let run = supervisor(Duration::from_secs(10), 100)
            .run(shell("exit 0"), &big)
            .expect("run");
        assert!(run.status.success());
    }

    #[test]
    fn deadline_kills_child_and_keeps_partial_output() {
        let run = supervisor(Duration::from_millis(300), 1_000)
            .run(shell("echo started; exec sleep 5"), b"")
            .expect("run");
        assert!(run.timed_out);
        assert!(!run.status.success());
        assert_eq!(run.stdout.text(), "started\n");
        assert!(run.diagnostics("planner").contains("(planner timed out)"));
    }

    #[test]
    fn deadline_kills_helpers_holding_the_pipes() {
        let started = std::time::Instant::now();
        let run = supervisor(Duration::from_millis(300), 1_000)
            .run(shell("echo started; sleep 5; echo done"), b"")
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(run.timed_out);
        assert_eq!(run.stdout.text(), "started\n");
    }

    #[test]
    fn output_past_limit_is_counted_not_kept() {
        let run = supervisor(Duration::from_secs(10), 4)
            .run(shell("printf 'abcdefghij'"), b"")
            .expect("run");
        assert_eq!(run.stdout.bytes, b"abcd");
        assert_eq!(run.stdout.dropped, 6);
        assert!(run.diagnostics("executor").contains("stdout: 6 bytes dropped"));
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let err = supervisor(Duration::from_secs(1), 100)
            .run(Command::new("definitely-not-a-real-binary-xyz"), b"")
            .unwrap_err();
        assert!(matches!(err, ProcessError::Launch { .. }));
        assert!(err.to_string().starts_with("failed to launch"));
    }
}
