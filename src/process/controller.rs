//! Lifecycle of one external worker process.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::fleet::WorkerId;
use crate::process::protocol::{self, Command, Framing, HealthMetrics};
use crate::process::{ExitReport, WorkerControl};

/// How to start a worker process.
#[derive(Debug, Clone)]
pub struct ProcessLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub framing: Framing,
    /// Deadline for one command round-trip.
    pub command_timeout: Duration,
}

struct ControlChannel {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Owns a spawned worker and its stdin/stdout control channel.
///
/// Commands are serialized: one request line, one reply line. A reply that
/// misses its deadline leaves the stream out of step, so the channel is
/// closed and every later command fails with `ChannelClosed`. A worker
/// whose channel is closed no longer reports as alive, even if the process
/// is still running.
pub struct WorkerProcessController {
    id: WorkerId,
    framing: Framing,
    command_timeout: Duration,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    channel: Mutex<Option<ControlChannel>>,
    channel_closed: AtomicBool,
    exited: AtomicBool,
}

impl WorkerProcessController {
    /// Spawn the process and wire its control channel.
    pub fn start(id: WorkerId, launch: &ProcessLaunch) -> Result<Self, WorkerError> {
        let spawn_err = |reason: String| WorkerError::Spawn {
            program: launch.program.clone(),
            reason,
        };

        let mut child = ProcessCommand::new(&launch.program)
            .args(&launch.args)
            .env("CONVERT_WORKER_ID", id.to_string())
            .env("CONVERT_WORKER_FRAMING", launch.framing.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("stdout not captured".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(worker_id = %id, "{line}");
                }
            });
        }

        let pid = child.id();
        info!(worker_id = %id, program = %launch.program, pid = ?pid, "Worker process started");

        Ok(Self {
            id,
            framing: launch.framing,
            command_timeout: launch.command_timeout,
            pid,
            child: Mutex::new(Some(child)),
            channel: Mutex::new(Some(ControlChannel {
                stdin,
                stdout: BufReader::new(stdout),
            })),
            channel_closed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Reference recorded in the worker descriptor.
    pub fn channel_ref(&self) -> String {
        match self.pid {
            Some(pid) => format!("stdio:pid/{pid}"),
            None => "stdio".to_string(),
        }
    }

    /// Send one command and wait for its reply line.
    pub async fn send_command(&self, command: Command) -> Result<String, WorkerError> {
        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or(WorkerError::ChannelClosed { id: self.id })?;

        let line = protocol::encode(self.framing, command);
        let exchange = async {
            channel.stdin.write_all(line.as_bytes()).await?;
            channel.stdin.write_all(b"\n").await?;
            channel.stdin.flush().await?;
            let mut reply = String::new();
            let n = channel.stdout.read_line(&mut reply).await?;
            Ok::<_, std::io::Error>((n, reply))
        };

        match tokio::time::timeout(self.command_timeout, exchange).await {
            Ok(Ok((0, _))) => {
                self.close_channel(&mut guard);
                Err(WorkerError::ChannelClosed { id: self.id })
            }
            Ok(Ok((_, reply))) => Ok(reply),
            Ok(Err(e)) => {
                self.close_channel(&mut guard);
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    Err(WorkerError::ChannelClosed { id: self.id })
                } else {
                    Err(WorkerError::Io(e))
                }
            }
            Err(_) => {
                self.close_channel(&mut guard);
                warn!(worker_id = %self.id, command = command.as_str(), "Worker reply timed out, closing channel");
                Err(WorkerError::ProbeTimeout {
                    id: self.id,
                    command: command.as_str().to_string(),
                    timeout: self.command_timeout,
                })
            }
        }
    }

    fn close_channel(&self, channel: &mut Option<ControlChannel>) {
        *channel = None;
        self.channel_closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerControl for WorkerProcessController {
    fn id(&self) -> WorkerId {
        self.id
    }

    async fn check_health(&self) -> Result<bool, WorkerError> {
        let reply = self.send_command(Command::CheckHealth).await?;
        protocol::decode_health(self.framing, self.id, &reply)
    }

    async fn get_metrics(&self) -> Result<HealthMetrics, WorkerError> {
        let reply = self.send_command(Command::GetMetrics).await?;
        protocol::decode_metrics(self.framing, self.id, &reply)
    }

    async fn is_alive(&self) -> bool {
        if self.exited.load(Ordering::SeqCst) {
            return false;
        }
        if self.channel_closed.load(Ordering::SeqCst) {
            debug!(worker_id = %self.id, "Worker control channel closed");
            return false;
        }
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(worker_id = %self.id, ?status, "Worker process exited");
                self.exited.store(true, Ordering::SeqCst);
                *guard = None;
                false
            }
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to poll worker process");
                false
            }
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Result<ExitReport, WorkerError> {
        // Ask politely, then close stdin.
        {
            let mut guard = self.channel.lock().await;
            if let Some(channel) = guard.as_mut() {
                let line = protocol::encode(self.framing, Command::Shutdown);
                let request = async {
                    channel.stdin.write_all(line.as_bytes()).await?;
                    channel.stdin.write_all(b"\n").await?;
                    channel.stdin.flush().await
                };
                if let Ok(Err(e)) = tokio::time::timeout(timeout, request).await {
                    debug!(worker_id = %self.id, error = %e, "Shutdown command not delivered");
                }
            }
            *guard = None;
        }

        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            self.exited.store(true, Ordering::SeqCst);
            return Ok(ExitReport {
                code: None,
                forced: false,
            });
        };

        let report = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => ExitReport {
                code: status.code(),
                forced: false,
            },
            Ok(Err(e)) => {
                let _ = child.kill().await;
                self.exited.store(true, Ordering::SeqCst);
                return Err(WorkerError::Io(e));
            }
            Err(_) => {
                warn!(worker_id = %self.id, ?timeout, "Worker ignored shutdown, killing");
                child.kill().await?;
                ExitReport {
                    code: None,
                    forced: true,
                }
            }
        };
        self.exited.store(true, Ordering::SeqCst);
        info!(worker_id = %self.id, code = ?report.code, forced = report.forced, "Worker process stopped");
        Ok(report)
    }
}
