use std::io::ErrorKind;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// One fully-built command line with its hard wall-clock deadline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub deadline: Duration,
}

impl Invocation {
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug)]
pub enum ProcessExit {
    Finished {
        stdout: String,
        stderr: String,
        code: Option<i32>,
    },
    /// Deadline expired; carries whatever the tool printed before it was killed.
    TimedOut {
        stdout: String,
        stderr: String,
    },
    NotFound,
    SpawnFailed(String),
}

/// How long to keep reading pipes after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

type Captured = Arc<Mutex<Vec<u8>>>;

/// Reads `pipe` to EOF in its own task, so a deadline never discards output.
fn drain<R>(pipe: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let captured = Captured::default();
    let sink = captured.clone();
    let task = tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]),
            }
        }
    });
    (captured, task)
}

fn text(captured: &Captured) -> String {
    let bytes = captured.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Kills the child and everything it forked.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    kill_group(child);
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already exited");
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own process group, so its pid is the group id.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

/// Runs the invocation to completion or until its deadline expires.
///
/// On unix the child gets its own process group and expiry kills the whole
/// group, so helpers the tool forked (a `docker run` client, wrapper
/// scripts) stop with it. Output read before expiry is kept.
pub async fn execute(invocation: &Invocation) -> ProcessExit {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == ErrorKind::NotFound => return ProcessExit::NotFound,
        Err(e) => return ProcessExit::SpawnFailed(e.to_string()),
    };

    let (stdout, mut stdout_task) = drain(child.stdout.take());
    let (stderr, mut stderr_task) = drain(child.stderr.take());

    let waited = timeout(invocation.deadline, child.wait()).await;
    if waited.is_err() {
        terminate(&mut child).await;
    }

    // Pipes close once every writer is gone; a process that escaped the
    // group could hold them open, so the wait is bounded.
    let drained = timeout(DRAIN_GRACE, async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(program = %invocation.program, "Output pipes still open after exit");
        stdout_task.abort();
        stderr_task.abort();
    }

    match waited {
        Ok(Ok(status)) => ProcessExit::Finished {
            stdout: text(&stdout),
            stderr: text(&stderr),
            code: status.code(),
        },
        Ok(Err(e)) => ProcessExit::SpawnFailed(e.to_string()),
        Err(_) => ProcessExit::TimedOut {
            stdout: text(&stdout),
            stderr: text(&stderr),
        },
    }
}
