// Bash stages
//
// The script body is written to a temporary file with executable permission
// and run through bash (sh as a fallback) in its own process group. The
// temp file is owned by this stage and cleaned on every exit path; on
// cancellation the group gets SIGTERM, then SIGKILL after the grace period.

use std::process::Stdio;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use cadence_core::{CoreError, ErrorRecord, Result};

use crate::outcome::StageOutcome;

/// Captured result of a finished shell script.
struct ShellCapture {
    return_code: i32,
    stdout: String,
    stderr: String,
}

fn outputs_of(capture: &ShellCapture) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert("return_code".to_string(), json!(capture.return_code));
    outputs.insert("stdout".to_string(), json!(capture.stdout));
    outputs.insert("stderr".to_string(), json!(capture.stderr));
    outputs
}

fn write_script(bash: &str) -> Result<tempfile::NamedTempFile> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix("cadence-")
        .suffix(".sh")
        .tempfile()
        .map_err(|e| CoreError::stage(format!("create script file: {e}")))?;
    file.write_all(bash.as_bytes())
        .map_err(|e| CoreError::stage(format!("write script file: {e}")))?;
    file.flush()
        .map_err(|e| CoreError::stage(format!("flush script file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(file.path(), perms)
            .map_err(|e| CoreError::stage(format!("chmod script file: {e}")))?;
    }
    Ok(file)
}

fn spawn_shell(script: &std::path::Path, env: &IndexMap<String, String>) -> Result<Child> {
    for shell in ["bash", "sh"] {
        let mut cmd = Command::new(shell);
        cmd.arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(CoreError::stage(format!("spawn {shell}: {err}"))),
        }
    }
    Err(CoreError::stage("neither bash nor sh is available"))
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Some(pid) = child.id() {
        // Negative pid addresses the whole process group
        unsafe {
            libc::kill(-(pid as libc::pid_t), signal);
        }
    }
}

/// SIGTERM the group, give it the grace period, then SIGKILL.
async fn terminate(mut child: Child, grace: Duration) {
    #[cfg(unix)]
    {
        signal_group(&child, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        signal_group(&child, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

async fn wait_with_capture(
    mut child: Child,
    token: &CancellationToken,
    grace: Duration,
) -> Result<Option<ShellCapture>> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::stage("child stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| CoreError::stage("child stderr not captured"))?;

    let out_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let err_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = token.cancelled() => None,
    };
    // The wait future is dropped here, releasing the child for termination
    let Some(status) = waited else {
        terminate(child, grace).await;
        out_task.abort();
        err_task.abort();
        return Ok(None);
    };
    let status = status.map_err(|e| CoreError::stage(format!("wait on shell: {e}")))?;

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();
    Ok(Some(ShellCapture {
        return_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
    }))
}

/// Run a rendered bash stage to completion or cancellation.
pub async fn run_bash(
    iden: &str,
    bash: &str,
    env: &IndexMap<String, String>,
    token: &CancellationToken,
    grace: Duration,
) -> StageOutcome {
    let script = match write_script(bash) {
        Ok(file) => file,
        Err(err) => return StageOutcome::fail(err.into_record(iden)),
    };
    let child = match spawn_shell(script.path(), env) {
        Ok(child) => child,
        Err(err) => return StageOutcome::fail(err.into_record(iden)),
    };

    match wait_with_capture(child, token, grace).await {
        Ok(Some(capture)) if capture.return_code == 0 => {
            StageOutcome::Success(outputs_of(&capture))
        }
        Ok(Some(capture)) => {
            let error = ErrorRecord::stage(
                iden,
                format!(
                    "shell exited with code {}: {}",
                    capture.return_code, capture.stderr
                ),
            );
            StageOutcome::Fail { error, outputs: outputs_of(&capture) }
        }
        Ok(None) => StageOutcome::Cancel,
        Err(err) => StageOutcome::fail(err.into_record(iden)),
    }
    // `script` drops here, removing the temp file on every path
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::Status;

    fn no_env() -> IndexMap<String, String> {
        IndexMap::new()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let token = CancellationToken::new();
        let out = run_bash(
            "s",
            "echo hello-out\necho hello-err >&2",
            &no_env(),
            &token,
            Duration::from_secs(1),
        )
        .await;
        match out {
            StageOutcome::Success(outputs) => {
                assert_eq!(outputs["return_code"], json!(0));
                assert_eq!(outputs["stdout"], json!("hello-out"));
                assert_eq!(outputs["stderr"], json!("hello-err"));
            }
            other => panic!("expected success, got {:?}", other.status()),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_outputs() {
        let token = CancellationToken::new();
        let out = run_bash(
            "s",
            "echo oops >&2\nexit 3",
            &no_env(),
            &token,
            Duration::from_secs(1),
        )
        .await;
        match out {
            StageOutcome::Fail { error, outputs } => {
                assert_eq!(outputs["return_code"], json!(3));
                assert!(error.message.contains("oops"));
            }
            other => panic!("expected fail, got {:?}", other.status()),
        }
    }

    #[tokio::test]
    async fn merged_env_reaches_the_child() {
        let token = CancellationToken::new();
        let mut env = IndexMap::new();
        env.insert("GREETING".to_string(), "from-env".to_string());
        let out = run_bash("s", "echo $GREETING", &env, &token, Duration::from_secs(1)).await;
        match out {
            StageOutcome::Success(outputs) => assert_eq!(outputs["stdout"], json!("from-env")),
            other => panic!("expected success, got {:?}", other.status()),
        }
    }

    #[tokio::test]
    async fn cancellation_terminates_the_group() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let started = std::time::Instant::now();
        let out = run_bash("s", "sleep 30", &no_env(), &token, Duration::from_secs(1)).await;
        assert_eq!(out.status(), Status::Cancel);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
