//! Child process helpers
//!
//! The VPN daemon, the gossip agent and the torrent client are all driven
//! through their own binaries. Output is inherited so their logs interleave
//! with ours.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::debug;

/// Process execution errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },

    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Children are killed when their handle or the future waiting on them is dropped
fn command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    cmd
}

/// Spawn a long running process with inherited output
pub fn spawn_daemon<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Child, ProcessError> {
    debug!(program, "Spawning daemon");
    command(program, args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })
}

/// Run a command to completion, failing on a non-zero exit
pub async fn run<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<(), ProcessError> {
    let status = command(program, args)
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(ProcessError::Failed {
            program: program.to_string(),
            status,
        });
    }
    Ok(())
}

/// Run a command to completion and capture its stdout
pub async fn capture<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<Vec<u8>, ProcessError> {
    let output = command(program, args)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ProcessError::Failed {
            program: program.to_string(),
            status: output.status,
        });
    }
    Ok(output.stdout)
}

/// Ask a daemon to shut down gracefully and wait for it to exit
pub async fn interrupt_and_wait(child: &mut Child, program: &str) -> Result<ExitStatus, ProcessError> {
    #[cfg(target_os = "linux")]
    {
        if let Some(pid) = child.id() {
            // SAFETY: `pid` belongs to a child we spawned and have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGINT);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = child.start_kill();
    }

    child.wait().await.map_err(|source| ProcessError::Wait {
        program: program.to_string(),
        source,
    })
}
