//! Shell execution with chunked stdout streaming.
//!
//! Commands run under `/bin/sh -c` with stdout piped and stderr inherited.
//! Stdout is drained in 4 KiB chunks through the caller's callback whether or
//! not anyone is watching, so the child can never block on a full pipe.
//!
//! Exit code mapping: the child's own code when it exited normally, 128 when
//! it was killed by a signal, 127 when the shell could not be spawned at all.

use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

/// Stdout read chunk size.
pub const READ_CHUNK: usize = 4096;

/// Exit code reported when the shell cannot be spawned (or the command is
/// empty).
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Exit code reported when the child was terminated by a signal.
pub const EXIT_SIGNALED: i32 = 128;

/// Run `cmd` under the shell, feeding each stdout chunk to `on_chunk`, and
/// return the mapped exit code.
pub async fn stream_command<F, Fut>(cmd: &str, mut on_chunk: F) -> i32
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "failed to spawn shell");
            return EXIT_SPAWN_FAILED;
        }
    };

    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => on_chunk(buf[..n].to_vec()).await,
            }
        }
    }

    match child.wait().await {
        Ok(status) => status.code().unwrap_or(EXIT_SIGNALED),
        Err(e) => {
            warn!(error = %e, "failed to reap child");
            EXIT_SPAWN_FAILED
        }
    }
}
