//! Child-process daemons speaking line-delimited JSON over stdin and stdout.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::config::DaemonConfig;
use crate::protocol::{DaemonMessage, PROTOCOL_VERSION, Request, ResultEvent};
use crate::worker::launcher::{self, LaunchError};
use crate::worker::{CompilerDaemon, DaemonError, DaemonLauncher, WorkerId};

pub struct StdioLauncher {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl StdioLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        StdioLauncher {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
        }
    }

    /// Resolves the daemon command line up front, so a missing bootstrap
    /// classpath fails the build before any process is started.
    pub fn from_config(config: &DaemonConfig, cell_root: &Path) -> Result<Self, LaunchError> {
        let mut argv = launcher::launch_command(config, cell_root)?.into_iter();
        let program = argv.next().unwrap_or_else(|| launcher::java_binary().to_string_lossy().to_string());
        Ok(StdioLauncher::new(program, argv.collect(), cell_root))
    }

    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

impl DaemonLauncher for StdioLauncher {
    type Daemon = StdioDaemon;

    async fn launch(&self, id: WorkerId) -> Result<StdioDaemon, DaemonError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(DaemonError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DaemonError::Spawn(io::Error::other("daemon stdin was not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::Spawn(io::Error::other("daemon stdout was not captured")))?;

        log::debug!("Spawned {} as pid {:?}", id, child.id());
        Ok(StdioDaemon {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

pub struct StdioDaemon {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl StdioDaemon {
    async fn send(&mut self, request: &Request) -> Result<(), DaemonError> {
        let mut line = serde_json::to_string(request).map_err(DaemonError::Encode)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<DaemonMessage, DaemonError> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                let status = self.child.try_wait().ok().flatten().and_then(|status| status.code());
                return Err(DaemonError::Exited { status });
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line).map_err(|source| DaemonError::Malformed { line, source });
        }
    }
}

impl CompilerDaemon for StdioDaemon {
    async fn handshake(&mut self) -> Result<(), DaemonError> {
        self.send(&Request::Handshake {
            protocol_version: PROTOCOL_VERSION,
        })
        .await?;
        match self.receive().await? {
            DaemonMessage::Ready => Ok(()),
            other => Err(DaemonError::Unexpected {
                expected: "a ready message",
                got: format!("{other:?}"),
            }),
        }
    }

    async fn round_trip(&mut self, request: &Request) -> Result<ResultEvent, DaemonError> {
        self.send(request).await?;
        match self.receive().await? {
            DaemonMessage::Result(result) => Ok(result),
            other => Err(DaemonError::Unexpected {
                expected: "a result",
                got: format!("{other:?}"),
            }),
        }
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            log::debug!("Could not kill daemon: {err}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::build::step_factory::StepFlavor;
    use crate::error::ErrorKind;
    use crate::protocol::ExecuteRequest;
    use crate::worker::{BuildCancellation, PoolConfig, PoolError, WorkerPool};
    use std::time::Duration;

    fn sh(script: &str) -> StdioLauncher {
        StdioLauncher::new("/bin/sh", vec!["-c".to_string(), script.to_string()], std::env::temp_dir())
    }

    fn request() -> Request {
        Request::Execute(ExecuteRequest {
            action_id: "//app:main[library]".to_string(),
            pipeline_id: None,
            first_stage: true,
            step: StepFlavor::Library,
            command: None,
        })
    }

    const COMPILER: &str = r#"read line
echo '{"type":"ready"}'
while read line; do
  echo '{"type":"result","exit_code":1,"message":"compile error: foo.src:3"}'
done"#;

    #[tokio::test]
    async fn talks_line_delimited_json() {
        let launcher = sh(COMPILER);
        let mut daemon = launcher.launch(WorkerId(1)).await.unwrap();
        daemon.handshake().await.unwrap();

        for _ in 0..2 {
            let result = daemon.round_trip(&request()).await.unwrap();
            assert_eq!(result.exit_code, 1);
            assert_eq!(result.message.as_deref(), Some("compile error: foo.src:3"));
        }
        assert!(!daemon.has_exited());
        daemon.kill();
    }

    #[tokio::test]
    async fn garbage_handshake_is_a_protocol_error() {
        let mut daemon = sh("read line; echo hello").launch(WorkerId(1)).await.unwrap();
        let err = daemon.handshake().await.unwrap_err();
        assert!(matches!(err, DaemonError::Malformed { .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn exiting_daemon_is_a_process_failure() {
        let mut daemon = sh(r#"read line; echo '{"type":"ready"}'"#)
            .launch(WorkerId(1))
            .await
            .unwrap();
        daemon.handshake().await.unwrap();
        let err = daemon.round_trip(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let launcher = StdioLauncher::new("/nonexistent/jvmcd-daemon", vec![], std::env::temp_dir());
        let err = match launcher.launch(WorkerId(1)).await {
            Err(err) => err,
            Ok(_) => panic!("spawn must fail"),
        };
        assert!(matches!(err, DaemonError::Spawn(_)));
    }

    #[tokio::test]
    async fn pool_drives_child_daemons() {
        let pool = WorkerPool::new(
            sh(COMPILER),
            PoolConfig {
                max_pool_size: 1,
                max_instances: 2,
                borrow_timeout: Duration::from_secs(5),
                result_timeout: Duration::from_secs(5),
                handshake_timeout: Duration::from_secs(5),
            },
        );
        let cancel = BuildCancellation::new();
        let mut lease = pool.borrow(&cancel).await.unwrap();
        let result = lease.execute(&request(), &cancel).await.unwrap();
        assert_eq!(result.exit_code, 1);
        drop(lease);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.shutdown(), 1);
        assert!(matches!(pool.borrow(&cancel).await, Err(PoolError::Closed)));
    }
}
