/// Single session lifecycle: spawn the child, feed it frames on a ticker,
/// observe its exit, report the results.
use crate::frame::FrameError;
use crate::signals;
use crate::ticker::{TickStats, Ticker, STOP_GRACE};
use chrono::{DateTime, Local};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Process creation requested.
    Spawning,
    /// The child started; ticks may run.
    Running,
    /// The child reported a launch error. Ticks and the exit wait still run.
    Errored,
    /// Exit observed. Terminal.
    Exited,
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code (None if killed by signal). Negative errno when the child never started.
    pub code: Option<i32>,
    /// Terminating signal number.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Outcome reported for a child that could not be started or waited on.
    fn from_launch_error(err: &io::Error) -> Self {
        Self {
            code: Some(-err.raw_os_error().unwrap_or(1)),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (_, Some(signal)) => write!(f, "killed by {}", signals::signal_name(signal)),
            (Some(code), None) => write!(f, "exit code {}", code),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Errors that can occur while supervising the child.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the child process.
    Launch { command: String, source: io::Error },
    /// Failed to wait on the running child.
    Wait { pid: Option<u32>, source: io::Error },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Launch { command, source } => {
                write!(f, "failed to spawn child process {}: {}", command, source)
            }
            SessionError::Wait { pid, source } => match pid {
                Some(pid) => write!(f, "failed to wait on child process {}: {}", pid, source),
                None => write!(f, "failed to wait on child process: {}", source),
            },
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Launch { source, .. } => Some(source),
            SessionError::Wait { source, .. } => Some(source),
        }
    }
}

/// Notable transitions, published for callers that want to follow a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The child could not be started or waited on. Not fatal to the session.
    LaunchFailed(SessionError),
    /// All three fields of a frame were accepted by the child's stdin.
    FrameWritten { sequence: u8 },
    /// A frame write failed; the ticker keeps going.
    FrameFailed { sequence: u8, error: FrameError },
    /// The child's exit was observed. Always the last event.
    Exited(ExitOutcome),
}

/// Optional destination for [`SessionEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<SessionEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.0 {
            // A dropped receiver just means nobody is listening.
            let _ = tx.send(event);
        }
    }
}

/// Result of a completed session.
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: ExitOutcome,
    /// Child PID, if the child started.
    pub pid: Option<u32>,
    pub ticks: TickStats,
    pub started_at: DateTime<Local>,
    /// Wall-clock duration from spawn to observed exit.
    pub duration: Duration,
}

/// Write side handed to the ticker: the child's stdin, or a closed stand-in
/// when the child never started so that every tick fails like a broken pipe.
enum ChildInput {
    Pipe(ChildStdin),
    Closed,
}

fn closed_input() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "child stdin is not open")
}

impl AsyncWrite for ChildInput {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ChildInput::Pipe(stdin) => Pin::new(stdin).poll_write(cx, buf),
            ChildInput::Closed => Poll::Ready(Err(closed_input())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChildInput::Pipe(stdin) => Pin::new(stdin).poll_flush(cx),
            ChildInput::Closed => Poll::Ready(Err(closed_input())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ChildInput::Pipe(stdin) => Pin::new(stdin).poll_shutdown(cx),
            ChildInput::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// One supervised child process.
pub struct Session {
    command: String,
    state: SessionState,
    child: Option<Child>,
    input: Option<ChildInput>,
    launch_outcome: Option<ExitOutcome>,
    ticker: Option<Ticker>,
    events: EventSink,
    pid: Option<u32>,
    started_at: DateTime<Local>,
    start: Instant,
}

impl Session {
    /// Spawn `command` with no arguments, stdin piped and stdout/stderr inherited.
    ///
    /// A launch failure does not make this fail: it is logged, published to
    /// `events`, and the session moves to [`SessionState::Errored`].
    pub fn spawn(command: &str, events: EventSink) -> Self {
        let mut session = Self {
            command: command.to_string(),
            state: SessionState::Spawning,
            child: None,
            input: None,
            launch_outcome: None,
            ticker: None,
            events,
            pid: None,
            started_at: Local::now(),
            start: Instant::now(),
        };

        tracing::info!(command, "spawning child");

        let spawned = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn();

        match spawned {
            Ok(mut child) => {
                session.pid = child.id();
                let stdin = child.stdin.take();
                session.input = Some(stdin.map_or(ChildInput::Closed, ChildInput::Pipe));
                session.child = Some(child);
                session.state = SessionState::Running;
                tracing::info!(pid = ?session.pid, "child started");
            }
            Err(source) => {
                session.launch_outcome = Some(ExitOutcome::from_launch_error(&source));
                session.input = Some(ChildInput::Closed);
                session.state = SessionState::Errored;
                let err = SessionError::Launch {
                    command: command.to_string(),
                    source,
                };
                tracing::error!(error = %err, "child process errored");
                session.events.emit(SessionEvent::LaunchFailed(err));
            }
        }

        session
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Start feeding frames to the child every tick. Calling it again is a no-op.
    pub fn run_tick_loop(&mut self) {
        if self.ticker.is_some() {
            tracing::warn!("tick loop already running");
            return;
        }
        let Some(input) = self.input.take() else {
            return;
        };
        self.ticker = Some(Ticker::start(input, self.events.clone()));
    }

    /// Wait for the child to terminate, then stop the tick loop.
    ///
    /// Consumes the session, so the exit is observed exactly once. A tick in
    /// flight at exit time gets [`STOP_GRACE`] to finish; no tick starts after it.
    pub async fn await_exit(mut self) -> SessionReport {
        let outcome = match self.child.as_mut() {
            Some(child) => match child.wait().await {
                Ok(status) => ExitOutcome::from_status(status),
                Err(source) => {
                    let outcome = ExitOutcome::from_launch_error(&source);
                    let err = SessionError::Wait {
                        pid: self.pid,
                        source,
                    };
                    tracing::error!(error = %err, "child process errored");
                    self.events.emit(SessionEvent::LaunchFailed(err));
                    outcome
                }
            },
            None => self.launch_outcome.unwrap_or(ExitOutcome {
                code: Some(-1),
                signal: None,
            }),
        };
        self.state = SessionState::Exited;
        let duration = self.start.elapsed();

        let ticks = match self.ticker.take() {
            Some(ticker) => ticker.stop().await,
            None => TickStats::default(),
        };

        tracing::info!(
            pid = ?self.pid,
            code = ?outcome.code,
            signal = ?outcome.signal.map(signals::signal_name),
            frames_written = ticks.frames_written,
            frames_failed = ticks.frames_failed,
            last_sequence = ?ticks.last_sequence,
            duration_ms = duration.as_millis() as u64,
            "child exited"
        );
        self.events.emit(SessionEvent::Exited(outcome));

        SessionReport {
            outcome,
            pid: self.pid,
            ticks,
            started_at: self.started_at,
            duration,
        }
    }
}

/// Spawn `command`, feed it frames until it exits, and return the result.
pub async fn run_session(command: &str, events: EventSink) -> SessionReport {
    let mut session = Session::spawn(command, events);
    match session.state() {
        SessionState::Errored => tracing::warn!(
            command = session.command(),
            "feeding frames anyway until the exit is reported"
        ),
        _ => tracing::info!(pid = ?session.pid(), "feeding frames"),
    }
    session.run_tick_loop();
    session.await_exit().await
}

/// Totals gathered from a session's event stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSummary {
    pub launch_failures: u64,
    pub frames_written: u64,
    pub frames_failed: u64,
    /// Failed frames whose leading fields already reached the child.
    pub partial_frames: u64,
    pub exit: Option<ExitOutcome>,
}

impl EventSummary {
    pub fn record(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::LaunchFailed(_) => self.launch_failures += 1,
            SessionEvent::FrameWritten { .. } => self.frames_written += 1,
            SessionEvent::FrameFailed { error, .. } => {
                self.frames_failed += 1;
                if error.is_partial() {
                    self.partial_frames += 1;
                }
            }
            SessionEvent::Exited(outcome) => self.exit = Some(*outcome),
        }
    }
}

/// Log every event until all senders are gone, then return the totals.
///
/// Launch errors are already logged where they happen and are only counted.
pub async fn log_events(mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> EventSummary {
    let mut summary = EventSummary::default();
    while let Some(event) = rx.recv().await {
        summary.record(&event);
        match &event {
            SessionEvent::LaunchFailed(_) => {}
            SessionEvent::FrameWritten { sequence } => {
                tracing::debug!(sequence, "frame written");
            }
            SessionEvent::FrameFailed { sequence, error } => {
                tracing::error!(
                    sequence,
                    partial = error.is_partial(),
                    error = %error,
                    "frame write failed"
                );
            }
            SessionEvent::Exited(outcome) => {
                if summary.partial_frames > 0 {
                    tracing::warn!(
                        partial_frames = summary.partial_frames,
                        %outcome,
                        "child saw partial frames before it exited"
                    );
                }
            }
        }
    }
    summary
}
