//! Timeout-supervised subprocess execution.
//!
//! Children run in their own process group on unix. When the leader times
//! out, or exits while helpers it started are still alive, the whole group
//! is killed so nothing keeps writing into the workspace afterwards.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Exited on its own with this code.
    Exited(i32),
    /// Terminated by a signal it did not receive from us.
    Signaled,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// Could not be started.
    SpawnFailed(String),
}

/// Captured result of a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit status.
    pub status: ProcessStatus,
    /// Standard output captured up to exit, or up to the end of the salvage window.
    pub stdout: String,
    /// Standard error, captured the same way.
    pub stderr: String,
    /// Wall-clock time from spawn to exit or kill.
    pub elapsed: Duration,
}

impl ProcessOutput {
    fn spawn_failed(reason: String, elapsed: Duration) -> Self {
        Self {
            status: ProcessStatus::SpawnFailed(reason),
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
        }
    }

    /// Exited with status 0.
    pub fn success(&self) -> bool {
        self.status == ProcessStatus::Exited(0)
    }

    /// Killed by the supervisor.
    pub fn timed_out(&self) -> bool {
        self.status == ProcessStatus::TimedOut
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamType {
    Stdout,
    Stderr,
}

/// Runs subprocesses under a timeout on a small tokio runtime.
///
/// [`run`](Self::run) blocks the calling thread and may be called from many
/// threads at once.
pub struct ProcessRunner {
    runtime: tokio::runtime::Runtime,
}

impl ProcessRunner {
    /// Start the runtime.
    pub fn new() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sandbox-io")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    /// Run `argv` in `cwd`, killing its process group if it outlives `timeout`.
    ///
    /// Output is streamed line by line while the process runs, so whatever a
    /// killed process printed is still returned. After the process ends the
    /// readers get up to `grace` to deliver what remains in the pipes.
    pub fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        timeout: Duration,
        grace: Duration,
    ) -> ProcessOutput {
        self.runtime.block_on(supervise(argv, cwd, timeout, grace))
    }
}

async fn supervise(argv: &[String], cwd: &Path, timeout: Duration, grace: Duration) -> ProcessOutput {
    let start = Instant::now();
    let Some((program, args)) = argv.split_first() else {
        return ProcessOutput::spawn_failed("empty command".into(), Duration::ZERO);
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ProcessOutput::spawn_failed(format!("{program}: {e}"), start.elapsed()),
    };
    // `id()` is gone once the child has been reaped.
    let pid = child.id();

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(stream_lines(stdout, StreamType::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(stream_lines(stderr, StreamType::Stderr, tx.clone()));
    }
    drop(tx);

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    let status = match waited {
        Ok(Ok(status)) => {
            // The leader is done; anything it left behind in the group goes too.
            kill_group(pid);
            exit_status(status)
        }
        Ok(Err(e)) => {
            log::warn!("Lost track of {program}: {e}");
            kill_group(pid);
            let _ = child.kill().await;
            ProcessStatus::Signaled
        }
        Err(_) => {
            kill_group(pid);
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill {program}: {e}");
            }
            ProcessStatus::TimedOut
        }
    };
    let elapsed = start.elapsed();

    let mut stdout = String::new();
    let mut stderr = String::new();
    let drained = tokio::time::timeout(grace, async {
        while let Some((stream, line)) = rx.recv().await {
            append(&mut stdout, &mut stderr, stream, &line);
        }
    })
    .await;
    if drained.is_err() {
        log::debug!("Output of {program} still open after {grace:?}, using what was read");
        while let Ok((stream, line)) = rx.try_recv() {
            append(&mut stdout, &mut stderr, stream, &line);
        }
    }

    ProcessOutput {
        status,
        stdout,
        stderr,
        elapsed,
    }
}

async fn stream_lines<R>(pipe: R, stream: StreamType, tx: mpsc::UnboundedSender<(StreamType, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = String::new();
    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 || tx.send((stream, line.clone())).is_err() {
            break;
        }
        line.clear();
    }
}

fn append(stdout: &mut String, stderr: &mut String, stream: StreamType, line: &str) {
    match stream {
        StreamType::Stdout => stdout.push_str(line),
        StreamType::Stderr => stderr.push_str(line),
    }
}

fn exit_status(status: ExitStatus) -> ProcessStatus {
    match status.code() {
        Some(code) => ProcessStatus::Exited(code),
        None => ProcessStatus::Signaled,
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to kill process group {pid}: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
