//! Subprocess execution and transient-error retry.

use std::ffi::OsStr;
use std::future::Future;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::PoolError;

/// Timeout applied to stat calls against a FUSE mount.
pub const ENOTCONN_TIMEOUT: Duration = Duration::from_secs(130);
/// Pause between two attempts of a retried stat.
pub const ENOTCONN_INTERVAL: Duration = Duration::from_secs(2);

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

fn render<I, S>(program: &str, args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = program.to_owned();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(&arg.as_ref().to_string_lossy());
    }
    cmd
}

/// Run `program args…` to completion.
///
/// A non-zero exit status becomes [`PoolError::CommandFailed`] carrying the
/// exit code and both output streams.
pub async fn execute<I, S>(program: &str, args: I) -> Result<CommandOutput, PoolError>
where
    I: IntoIterator<Item = S> + Clone,
    S: AsRef<OsStr>,
{
    let cmd = render(program, args.clone());
    debug!(%cmd, "executing");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| PoolError::io(format!("spawn `{cmd}`"), e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let rc = output.status.code().unwrap_or(-1);
        return Err(PoolError::CommandFailed {
            cmd,
            rc,
            stdout,
            stderr: stderr.trim().to_owned(),
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

/// Call `op` until it succeeds, returns an errno outside `retry_on`, or
/// `timeout` elapses.
pub async fn retry_errors<T, F>(
    context: &str,
    mut op: F,
    retry_on: &[Errno],
    timeout: Duration,
    interval: Duration,
) -> Result<T, PoolError>
where
    F: FnMut() -> nix::Result<T>,
{
    retry_errors_async(context, || std::future::ready(op()), retry_on, timeout, interval).await
}

/// [`retry_errors`] for operations that have to be awaited, such as
/// filesystem walks moved off the runtime with `spawn_blocking`.
pub async fn retry_errors_async<T, F, Fut>(
    context: &str,
    mut op: F,
    retry_on: &[Errno],
    timeout: Duration,
    interval: Duration,
) -> Result<T, PoolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = nix::Result<T>>,
{
    let start = Instant::now();
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(errno) if retry_on.contains(&errno) => {
                if start.elapsed() >= timeout {
                    return Err(PoolError::Timeout {
                        context: format!("{context}: {errno}"),
                        seconds: timeout.as_secs(),
                    });
                }
                warn!(context, %errno, "transient error, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(errno) => return Err(PoolError::sys(context, errno)),
        }
    }
}

/// Errno carried by an I/O error, `EIO` when there is none.
pub fn errno_of(e: &std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_captures_output() {
        let out = execute("sh", ["-c", "echo hello; echo oops >&2"]).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn execute_reports_failure() {
        let err = execute("sh", ["-c", "echo 'already mounted' >&2; exit 32"])
            .await
            .unwrap_err();
        match &err {
            PoolError::CommandFailed { rc, stderr, .. } => {
                assert_eq!(*rc, 32);
                assert_eq!(stderr, "already mounted");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.stderr_contains("already mounted"));
    }

    #[tokio::test]
    async fn retry_recovers_from_enotconn() {
        let mut calls = 0;
        let v = retry_errors(
            "statvfs /mnt/x",
            || {
                calls += 1;
                if calls < 3 { Err(Errno::ENOTCONN) } else { Ok(calls) }
            },
            &[Errno::ENOTCONN],
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(v, 3);
    }

    #[tokio::test]
    async fn retry_times_out() {
        let err = retry_errors::<(), _>(
            "statvfs /mnt/x",
            || Err(Errno::ENOTCONN),
            &[Errno::ENOTCONN],
            Duration::from_millis(20),
            Duration::from_millis(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn retry_passes_through_other_errors() {
        let err = retry_errors::<(), _>(
            "statvfs /mnt/x",
            || Err(Errno::ENOENT),
            &[Errno::ENOTCONN],
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PoolError::Sys { errno: Errno::ENOENT, .. }));
    }

    #[tokio::test]
    async fn async_retry_awaits_each_attempt() {
        let counter = std::sync::atomic::AtomicUsize::new(0);
        let attempts = &counter;
        let v = retry_errors_async(
            "walk /mnt/x/info",
            || async move {
                let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::task::yield_now().await;
                if n == 0 { Err(Errno::ENOTCONN) } else { Ok(n) }
            },
            &[Errno::ENOTCONN],
            Duration::from_secs(5),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(v, 1);
        assert_eq!(errno_of(&std::io::Error::from_raw_os_error(107)), Errno::ENOTCONN);
        assert_eq!(errno_of(&std::io::Error::other("no errno")), Errno::EIO);
    }
}
