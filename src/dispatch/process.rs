//! Running one source call in a child process.
//!
//! The child gets a scrubbed environment, its stdout carries protocol lines
//! only and its stderr is forwarded to the log. The process is killed on
//! cancellation, on timeout, and when the call future is dropped.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::Instant;

use super::capability;
use super::protocol::{Envelope, Message};
use super::{AdapterContext, AdapterError, SourceRequest};

const CALL_ID: u64 = 1;
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Variables passed through to source processes.
const INHERITED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "TMPDIR",
    "TEMP",
    "SYSTEMROOT",
    "JAVA_HOME",
];

/// `program` with an environment reduced to [`INHERITED_ENV`].
pub fn isolated_command(program: impl AsRef<OsStr>) -> Command {
    let mut command = Command::new(program);
    command.env_clear();
    for name in INHERITED_ENV {
        if let Some(value) = std::env::var_os(name) {
            command.env(name, value);
        }
    }
    command
}

/// Spawn `command`, send `request` and serve capability requests until the
/// child answers, exits, or `timeout` elapses.
pub async fn call(
    mut command: Command,
    source_id: &str,
    request: &SourceRequest,
    ctx: &AdapterContext,
    timeout: Duration,
) -> Result<serde_json::Value, AdapterError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|err| AdapterError::Crashed(format!("failed to start runtime: {err}")))?;
    let deadline = Instant::now() + timeout;

    let outcome = converse(&mut child, source_id, request, ctx, deadline, timeout).await;
    match &outcome {
        Ok(_) => finish(&mut child, source_id).await,
        Err(_) => {
            let _ = child.kill().await;
        }
    }
    outcome
}

async fn converse(
    child: &mut Child,
    source_id: &str,
    request: &SourceRequest,
    ctx: &AdapterContext,
    deadline: Instant,
    timeout: Duration,
) -> Result<serde_json::Value, AdapterError> {
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AdapterError::Protocol("child stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AdapterError::Protocol("child stdout unavailable".into()))?;
    if let Some(stderr) = child.stderr.take() {
        let source_id = source_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[{}] {}", source_id, line);
            }
        });
    }

    let call = Envelope::new(Message::Call {
        id: CALL_ID,
        request: request.clone(),
    });
    send(&mut stdin, &call).await?;

    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(AdapterError::Timeout(timeout)),
            line = lines.next_line() => line
                .map_err(|err| AdapterError::Crashed(format!("reading child output: {err}")))?,
        };

        let Some(line) = line else {
            let status = child
                .try_wait()
                .ok()
                .flatten()
                .map(|status| status.to_string())
                .unwrap_or_else(|| "output closed".to_string());
            return Err(AdapterError::Crashed(format!(
                "runtime ended before answering ({status})"
            )));
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('{') {
            log::debug!("[{}] stdout: {}", source_id, line);
            continue;
        }

        let envelope = Envelope::parse(line).map_err(AdapterError::Protocol)?;
        match envelope.message {
            Message::Result { id, ok, error } => {
                if id != CALL_ID {
                    return Err(AdapterError::Protocol(format!("result for unknown call {id}")));
                }
                return match error {
                    Some(message) => Err(AdapterError::Source(message)),
                    None => Ok(ok.unwrap_or(serde_json::Value::Null)),
                };
            }
            Message::Capability { id, op, params } => {
                log::debug!("[{}] capability {} #{}", source_id, op, id);
                let answer = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => return Err(AdapterError::Timeout(timeout)),
                    answer = capability::serve(&op, params, source_id, ctx) => answer,
                };
                send(&mut stdin, &Envelope::new(Message::capability_answer(id, answer))).await?;
            }
            other => {
                return Err(AdapterError::Protocol(format!(
                    "unexpected message from child: {other:?}"
                )));
            }
        }
    }
}

async fn send(stdin: &mut ChildStdin, envelope: &Envelope) -> Result<(), AdapterError> {
    let line = envelope
        .to_line()
        .map_err(|err| AdapterError::Protocol(err.to_string()))?;
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|err| AdapterError::Crashed(format!("writing to child: {err}")))?;
    stdin
        .flush()
        .await
        .map_err(|err| AdapterError::Crashed(format!("writing to child: {err}")))
}

/// Give a child that answered a moment to exit on its own.
async fn finish(child: &mut Child, source_id: &str) {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) if !status.success() => {
            log::debug!("[{}] exited with {} after answering", source_id, status);
        }
        Ok(_) => {}
        Err(_) => {
            let _ = child.kill().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::dispatch::test_support;
    use crate::errors::ErrorKind;
    use crate::modules::cancel::CancellationToken;

    fn sh(script: &str) -> Command {
        let mut command = isolated_command("sh");
        command.arg("-c").arg(script);
        command
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            services: test_support::services(),
            cancel: CancellationToken::new(),
        }
    }

    async fn run(script: &str, ctx: &AdapterContext, timeout: Duration) -> Result<serde_json::Value, AdapterError> {
        call(sh(script), "alpha", &SourceRequest::GetPlatforms, ctx, timeout).await
    }

    #[tokio::test]
    async fn returns_child_result() {
        let value = run(
            r#"read call; echo "log line"; echo '{"v":1,"type":"result","id":1,"ok":["snes","n64"]}'"#,
            &ctx(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(value, json!(["snes", "n64"]));
    }

    #[tokio::test]
    async fn request_is_sent_as_first_line() {
        let value = run(
            r#"read call; echo "{\"v\":1,\"type\":\"result\",\"id\":1,\"ok\":$call}""#,
            &ctx(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(value["type"], "call");
        assert_eq!(value["request"]["method"], "getPlatforms");
    }

    #[tokio::test]
    async fn exit_before_result_is_a_crash() {
        let err = run("read call; exit 3", &ctx(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterCrashed);
    }

    #[tokio::test]
    async fn error_result_and_bad_version() {
        let err = run(
            r#"read call; echo '{"v":1,"type":"result","id":1,"error":"layout changed"}'"#,
            &ctx(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdapterError::Source(ref message) if message == "layout changed"));

        let err = run(
            r#"read call; echo '{"v":9,"type":"result","id":1,"ok":1}'"#,
            &ctx(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn slow_child_times_out() {
        let started = std::time::Instant::now();
        let err = run("read call; sleep 10", &ctx(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = run("read call; sleep 10", &ctx, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn serves_http_capability_through_services() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/platforms"))
            .respond_with(ResponseTemplate::new(200).set_body_string("snes"))
            .mount(&server)
            .await;

        let script = format!(
            r#"read call
echo '{{"v":1,"type":"capability","id":7,"op":"http","params":{{"url":"{}/platforms"}}}}'
read answer
echo "{{\"v\":1,\"type\":\"result\",\"id\":1,\"ok\":$answer}}""#,
            server.uri()
        );
        let value = run(&script, &ctx(), Duration::from_secs(10)).await.unwrap();

        assert_eq!(value["type"], "capability_result");
        assert_eq!(value["id"], 7);
        assert_eq!(value["ok"]["status"], 200);
        assert_eq!(value["ok"]["body"], "snes");
    }
}
