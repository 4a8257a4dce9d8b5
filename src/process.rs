//! Child server process with configurable stdio wiring.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// How long `shutdown_with_deadline` waits for a voluntary exit.
pub const SUBPROCESS_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period after the kill escalation.
pub const SUBPROCESS_KILL_GRACE: Duration = Duration::from_secs(5);

/// Wiring for one of the child's standard streams.
#[derive(Debug, Clone, Default)]
pub enum StdStream {
    /// A pipe owned by the parent.
    Piped,
    /// Discard.
    #[default]
    Null,
    /// Share the parent's stream.
    Inherit,
    /// Redirect to the file at this path.
    File(PathBuf),
    /// Fuse into stdout. Valid for stderr when stdout writes to a file.
    MergeWithStdout,
}

impl StdStream {
    fn to_stdio(&self) -> Result<Stdio> {
        match self {
            StdStream::Piped => Ok(Stdio::piped()),
            StdStream::Null => Ok(Stdio::null()),
            StdStream::Inherit => Ok(Stdio::inherit()),
            StdStream::File(path) => {
                let file = std::fs::File::create(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                Ok(file.into())
            }
            StdStream::MergeWithStdout => {
                bail!("stream merging is only valid for stderr")
            }
        }
    }
}

/// Stdio wiring for a spawn.
#[derive(Debug, Clone, Default)]
pub struct StdioWiring {
    pub stdin: StdStream,
    pub stdout: StdStream,
    pub stderr: StdStream,
}

impl StdioWiring {
    /// stdin/stdout piped for the protocol, stderr appended to `log_path`.
    pub fn piped_with_stderr_log(log_path: PathBuf) -> Self {
        Self {
            stdin: StdStream::Piped,
            stdout: StdStream::Piped,
            stderr: StdStream::File(log_path),
        }
    }
}

/// A running server child process.
pub struct ServerProcess {
    child: Child,
}

impl ServerProcess {
    /// Spawn `binary` with `args`.
    ///
    /// The binary is executed directly (never through a shell), so `argv[0]`
    /// is the binary path itself. Parent-side pipe halves are owned by the
    /// returned handle until taken.
    pub fn spawn(binary: &Path, args: &[String], wiring: &StdioWiring) -> Result<Self> {
        let stderr = match &wiring.stderr {
            StdStream::MergeWithStdout => {
                // Both streams append to the same file; a piped or inherited
                // stdout has no handle to share at spawn time.
                let StdStream::File(path) = &wiring.stdout else {
                    bail!("stderr can only merge into a file-backed stdout");
                };
                let file = std::fs::File::options()
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("opening {}", path.display()))?;
                Stdio::from(file)
            }
            other => other.to_stdio()?,
        };

        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(wiring.stdin.to_stdio()?)
            .stdout(wiring.stdout.to_stdio()?)
            .stderr(stderr)
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("spawning {}", binary.display()))?;
        tracing::debug!(binary = %binary.display(), pid = child.id(), "spawned server process");

        Ok(Self { child })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking reap. `Some` once the child has exited.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_running(&mut self) -> bool {
        self.poll().is_none()
    }

    /// Block until the child exits.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Run `body` with a freshly spawned process, then shut it down and reap
    /// it whatever the body did with it.
    pub async fn scoped<T, F, Fut>(
        binary: &Path,
        args: &[String],
        wiring: &StdioWiring,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(ServerProcess) -> Fut,
        Fut: Future<Output = (ServerProcess, T)>,
    {
        let process = Self::spawn(binary, args, wiring)?;
        let (mut process, value) = body(process).await;
        process
            .shutdown_with_deadline(SUBPROCESS_JOIN_TIMEOUT, SUBPROCESS_KILL_GRACE)
            .await;
        Ok(value)
    }

    /// Wait up to `join_timeout` for a voluntary exit, then kill and wait up
    /// to `kill_grace` more. Returns false if the process was still not
    /// reaped at the end.
    pub async fn shutdown_with_deadline(
        &mut self,
        join_timeout: Duration,
        kill_grace: Duration,
    ) -> bool {
        if tokio::time::timeout(join_timeout, self.child.wait())
            .await
            .is_ok()
        {
            return true;
        }
        tracing::warn!(
            pid = self.child.id(),
            "server did not exit within {}s, killing",
            join_timeout.as_secs()
        );
        if let Err(err) = self.child.start_kill() {
            tracing::warn!("failed to kill server process: {err}");
        }
        tokio::time::timeout(kill_grace, self.child.wait())
            .await
            .is_ok()
    }
}

/// `<name lowercased, non-alphanumerics replaced>_stderr_` — the prefix for
/// a server's stderr log files.
fn stderr_log_prefix(server_name: &str) -> String {
    let sanitized: String = server_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{sanitized}_stderr_")
}

/// Create an empty stderr log file with a random suffix and return its path.
///
/// The file outlives this call; the lifecycle controller deletes it on
/// shutdown unless configured to keep log files.
pub fn create_stderr_logfile(server_name: &str) -> Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix(&stderr_log_prefix(server_name))
        .suffix(".log")
        .tempfile()
        .context("creating stderr log file")?;
    let (_, path) = file.keep().context("persisting stderr log file")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_log_prefix_sanitizes() {
        assert_eq!(stderr_log_prefix("Clangd"), "clangd_stderr_");
        assert_eq!(stderr_log_prefix("my server++"), "my_server___stderr_");
        assert_eq!(stderr_log_prefix("rust-analyzer"), "rust_analyzer_stderr_");
    }

    #[test]
    fn test_create_stderr_logfile() {
        let path = create_stderr_logfile("Test Server").unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("test_server_stderr_"));
        assert!(name.ends_with(".log"));
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_logfile_names_are_unique() {
        let first = create_stderr_logfile("srv").unwrap();
        let second = create_stderr_logfile("srv").unwrap();
        assert_ne!(first, second);
        std::fs::remove_file(&first).unwrap();
        std::fs::remove_file(&second).unwrap();
    }

    #[test]
    fn test_merge_requires_file_stdout() {
        let wiring = StdioWiring {
            stdin: StdStream::Piped,
            stdout: StdStream::Piped,
            stderr: StdStream::MergeWithStdout,
        };
        assert!(ServerProcess::spawn(Path::new("true"), &[], &wiring).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_poll_and_wait() {
        let Ok(binary) = which::which("true") else {
            return;
        };
        let mut process = ServerProcess::spawn(&binary, &[], &StdioWiring::default()).unwrap();
        let status = process.wait().await.unwrap();
        assert!(status.success());
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_piped_stdio_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let Ok(binary) = which::which("cat") else {
            return;
        };
        let wiring = StdioWiring {
            stdin: StdStream::Piped,
            stdout: StdStream::Piped,
            stderr: StdStream::Null,
        };
        let mut process = ServerProcess::spawn(&binary, &[], &wiring).unwrap();
        let mut stdin = process.take_stdin().unwrap();
        let mut stdout = process.take_stdout().unwrap();

        stdin.write_all(b"ping").await.unwrap();
        drop(stdin);

        let mut echoed = String::new();
        stdout.read_to_string(&mut echoed).await.unwrap();
        assert_eq!(echoed, "ping");
        assert!(process.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scoped_reaps_after_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let Ok(binary) = which::which("cat") else {
            return;
        };
        let wiring = StdioWiring {
            stdin: StdStream::Piped,
            stdout: StdStream::Piped,
            stderr: StdStream::Null,
        };
        let echoed = ServerProcess::scoped(&binary, &[], &wiring, |mut process| async move {
            let mut stdin = process.take_stdin().unwrap();
            let mut stdout = process.take_stdout().unwrap();
            stdin.write_all(b"scoped").await.unwrap();
            drop(stdin);
            let mut echoed = String::new();
            stdout.read_to_string(&mut echoed).await.unwrap();
            (process, echoed)
        })
        .await
        .unwrap();
        assert_eq!(echoed, "scoped");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_deadline_kills_stubborn_child() {
        let Ok(binary) = which::which("sleep") else {
            return;
        };
        let mut process =
            ServerProcess::spawn(&binary, &["600".to_string()], &StdioWiring::default()).unwrap();
        let reaped = process
            .shutdown_with_deadline(Duration::from_millis(50), Duration::from_secs(5))
            .await;
        assert!(reaped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_to_file() {
        let Ok(binary) = which::which("sh") else {
            return;
        };
        // Not the library spawn path (the library never uses a shell); the
        // shell here is just a convenient stderr producer for the test.
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("stderr.log");
        let wiring = StdioWiring {
            stdin: StdStream::Null,
            stdout: StdStream::Null,
            stderr: StdStream::File(log_path.clone()),
        };
        let mut process = ServerProcess::spawn(
            &binary,
            &["-c".to_string(), "echo oops >&2".to_string()],
            &wiring,
        )
        .unwrap();
        process.wait().await.unwrap();
        let logged = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(logged.trim(), "oops");
    }
}
