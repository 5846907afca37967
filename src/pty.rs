use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::runspace::Runspace;

/// Variables inherited from the server's own environment. Everything else is
/// cleared before the shell starts.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "LOGNAME", "LANG", "LC_ALL", "TZ"];

/// Chunks queued for the writer thread before `write` starts waiting.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// How long `write` waits for room in the input queue.
const INPUT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGHUP and SIGKILL in `terminate`.
const KILL_ESCALATION: Duration = Duration::from_secs(3);

/// How long the exit monitor waits for the reader to drain the final output.
const READER_DRAIN_WAIT: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("runspace directory is not usable: {0}")]
    InvalidDirectory(String),

    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn shell: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to start {0} thread: {1}")]
    SpawnThread(&'static str, #[source] std::io::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("an output consumer is already registered")]
    ConsumerRegistered,

    #[error("shell input is stalled")]
    InputStalled,

    #[error("shell has exited")]
    Exited,
}

/// Lifecycle of the subprocess behind a [`PtyHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    /// Process started, output pumps not running yet.
    Spawning,
    Running,
    Exited,
}

/// Delivered to the single registered consumer, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Bytes),
    /// The shell is gone. `code` is `None` when it could not be collected.
    Exited { code: Option<u32> },
}

/// How to start the shell.
#[derive(Debug, Clone)]
pub struct PtyOptions {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub term: String,
    /// Extra variables applied after the runspace environment.
    pub extra_env: Vec<(String, String)>,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            cols: 80,
            rows: 24,
            term: "xterm-256color".to_string(),
            extra_env: Vec::new(),
        }
    }
}

type Sink = Arc<dyn Fn(PtyEvent) + Send + Sync>;

/// Parts that only exist until the pumps are started by `on_output`.
struct Pending {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    input_rx: mpsc::Receiver<Bytes>,
    child: Box<dyn Child + Send + Sync>,
}

/// One shell running on a pseudo-terminal.
///
/// Output goes to exactly one consumer registered with [`PtyHandle::on_output`];
/// fanning it out to clients is the owning session's job.
pub struct PtyHandle {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Bytes>,
    pending: Mutex<Option<Pending>>,
    state: Arc<Mutex<PtyState>>,
    exited: CancellationToken,
    exit_reported: Arc<AtomicBool>,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Start a shell in `runspace`'s directory with a constrained environment.
    ///
    /// Blocks for the duration of fork/exec; async callers should run it on
    /// the blocking pool.
    pub fn spawn(runspace: &Runspace, options: &PtyOptions) -> Result<Self, PtyError> {
        if !runspace.dir.is_dir() {
            return Err(PtyError::InvalidDirectory(runspace.dir.display().to_string()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::OpenPty)?;

        let cmd = build_command(runspace, options);
        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        // Our copy of the slave must go, otherwise the reader never sees EOF.
        drop(pair.slave);

        let master = pair.master;
        let reader = master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = master.take_writer().map_err(PtyError::TakeWriter)?;
        let pid = child.process_id();
        let killer = child.clone_killer();
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);

        tracing::debug!(?pid, shell = %options.shell, dir = %runspace.dir.display(), "spawned shell");

        Ok(Self {
            pid,
            master: Mutex::new(master),
            killer: Mutex::new(killer),
            input_tx,
            pending: Mutex::new(Some(Pending {
                reader,
                writer,
                input_rx,
                child,
            })),
            state: Arc::new(Mutex::new(PtyState::Spawning)),
            exited: CancellationToken::new(),
            exit_reported: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> PtyState {
        *self.state.lock()
    }

    /// Resolves once the shell process has exited.
    pub async fn wait_exited(&self) {
        self.exited.cancelled().await
    }

    /// Register the consumer and start the reader, writer and exit monitor.
    ///
    /// Each runs on its own named OS thread for the life of the shell, so a
    /// busy server never starves tokio's blocking pool. `sink` is called from
    /// those threads. Output arrives in the order the shell produced it,
    /// followed by exactly one [`PtyEvent::Exited`].
    pub fn on_output<F>(&self, sink: F) -> Result<(), PtyError>
    where
        F: Fn(PtyEvent) + Send + Sync + 'static,
    {
        let Pending {
            reader,
            writer,
            input_rx,
            child,
        } = self.pending.lock().take().ok_or(PtyError::ConsumerRegistered)?;
        let sink: Sink = Arc::new(sink);
        let reader_done = Arc::new(AtomicBool::new(false));
        {
            let mut state = self.state.lock();
            if *state == PtyState::Spawning {
                *state = PtyState::Running;
            }
        }

        // The monitor owns the child, so it starts first: once it runs, a
        // failure below can still kill the shell and have it reaped.
        let monitor = ExitMonitor {
            child,
            sink: sink.clone(),
            reader_done: reader_done.clone(),
            state: self.state.clone(),
            exited: self.exited.clone(),
            exit_reported: self.exit_reported.clone(),
        };
        let started = spawn_pump(self.pid, "exit", move || monitor.run())
            .and_then(|()| spawn_pump(self.pid, "reader", move || read_output(reader, sink, reader_done)))
            .and_then(|()| spawn_pump(self.pid, "writer", move || write_input(writer, input_rx)));
        if let Err(e) = started {
            tracing::error!(pid = ?self.pid, error = %e, "failed to start pty threads");
            if let Err(e) = self.killer.lock().kill() {
                tracing::debug!(?e, pid = ?self.pid, "kill via child handle failed");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Queue bytes for the shell's stdin.
    ///
    /// Waits for room in the bounded input queue, but never longer than
    /// [`INPUT_STALL_TIMEOUT`].
    pub async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        if self.state() == PtyState::Exited {
            return Err(PtyError::Exited);
        }
        match tokio::time::timeout(INPUT_STALL_TIMEOUT, self.input_tx.send(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PtyError::Exited),
            Err(_) => Err(PtyError::InputStalled),
        }
    }

    /// Propagate new dimensions to the shell's controlling terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Resize)
    }

    /// Current dimensions as `(cols, rows)`, if the pty can report them.
    pub fn size(&self) -> Option<(u16, u16)> {
        self.master.lock().get_size().ok().map(|s| (s.cols, s.rows))
    }

    /// Ask the shell to go away and release the process.
    ///
    /// Sends SIGHUP to the shell's process group, then SIGKILL if it is still
    /// around after [`KILL_ESCALATION`]. A no-op once the shell has exited.
    pub fn terminate(&self) {
        if self.state() == PtyState::Exited {
            return;
        }
        self.signal_group(SignalKind::Hangup);
        if let Err(e) = self.killer.lock().kill() {
            tracing::debug!(?e, pid = ?self.pid, "kill via child handle failed");
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let exited = self.exited.clone();
        let pid = self.pid;
        runtime.spawn(async move {
            if tokio::time::timeout(KILL_ESCALATION, exited.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(?pid, "shell ignored SIGHUP, sending SIGKILL");
                signal_pid(pid, SignalKind::Kill);
            }
        });
    }

    fn signal_group(&self, kind: SignalKind) {
        if self.state() == PtyState::Exited {
            tracing::debug!(pid = ?self.pid, "shell already exited, skipping signal");
            return;
        }
        signal_pid(self.pid, kind);
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        // Pumps never started: nobody will reap the child, so kill it here.
        if let Some(mut pending) = self.pending.lock().take() {
            let _ = pending.child.kill();
            let _ = pending.child.try_wait();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SignalKind {
    Hangup,
    Kill,
}

/// Signal the whole process group led by `pid`.
///
/// portable_pty calls setsid() for the child, so its pid is also its group id
/// and jobs started from the shell receive the signal too.
fn signal_pid(pid: Option<u32>, kind: SignalKind) {
    let Some(pid) = pid else { return };
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    #[cfg(unix)]
    {
        let sig = match kind {
            SignalKind::Hangup => libc::SIGHUP,
            SignalKind::Kill => libc::SIGKILL,
        };
        unsafe {
            libc::kill(-(pid as i32), sig);
        }
    }
    #[cfg(not(unix))]
    let _ = kind;
}

fn build_command(runspace: &Runspace, options: &PtyOptions) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&options.shell);
    cmd.env_clear();
    for key in INHERITED_ENV {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("TERM", &options.term);
    for (key, value) in &runspace.env {
        cmd.env(key, value);
    }
    for (key, value) in &options.extra_env {
        cmd.env(key, value);
    }
    cmd.cwd(&runspace.dir);
    cmd
}

/// Waits for the shell, then reports its exit after the reader has drained.
struct ExitMonitor {
    child: Box<dyn Child + Send + Sync>,
    sink: Sink,
    reader_done: Arc<AtomicBool>,
    state: Arc<Mutex<PtyState>>,
    exited: CancellationToken,
    exit_reported: Arc<AtomicBool>,
}

impl ExitMonitor {
    fn run(mut self) {
        let code = match self.child.wait() {
            Ok(status) => {
                tracing::debug!(?status, "shell exited");
                Some(status.exit_code())
            }
            Err(e) => {
                tracing::error!(?e, "error waiting for shell");
                None
            }
        };

        *self.state.lock() = PtyState::Exited;
        self.exited.cancel();

        // Let the reader hand over whatever the shell printed last.
        let mut waited = Duration::ZERO;
        while !self.reader_done.load(Ordering::Acquire) && waited < READER_DRAIN_WAIT {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }

        if !self.exit_reported.swap(true, Ordering::AcqRel) {
            (self.sink)(PtyEvent::Exited { code });
        }
    }
}

/// Run `body` on a dedicated thread named after the shell's pid.
fn spawn_pump<F>(pid: Option<u32>, role: &'static str, body: F) -> Result<(), PtyError>
where
    F: FnOnce() + Send + 'static,
{
    let name = match pid {
        Some(pid) => format!("pty-{role}-{pid}"),
        None => format!("pty-{role}"),
    };
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
                tracing::error!("pty {} thread panicked: {:?}", role, e);
            }
        })
        .map(|_| ())
        .map_err(|e| PtyError::SpawnThread(role, e))
}

fn read_output(mut reader: Box<dyn Read + Send>, sink: Sink, done: Arc<AtomicBool>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink(PtyEvent::Output(Bytes::copy_from_slice(&buf[..n]))),
            // EIO is how Linux reports that the slave side closed.
            Err(_) => break,
        }
    }
    done.store(true, Ordering::Release);
}

fn write_input(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.blocking_recv() {
        if writer.write_all(&data).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}
