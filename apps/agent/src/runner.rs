//! Runs allowlisted host commands and streams their output upstream.

use std::process::Stdio;
use std::time::Duration;

use canbridge_control::CommandAllowlist;
use canbridge_protocol::messages::{
    CommandChunk, CommandExecRequest, CommandOutcome, CommandResponse, OutputStream,
};
use canbridge_protocol::{ControlMessage, MessageType};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::Uplink;
use crate::handler::HandlerError;

const READ_CHUNK: usize = 4096;

pub struct CommandRunner {
    allowlist: CommandAllowlist,
}

impl CommandRunner {
    pub fn new(allowlist: CommandAllowlist) -> Self {
        Self { allowlist }
    }

    /// Validates and spawns the command. Output and the final status are
    /// sent on `uplink` from a background task.
    pub fn start(&self, req: &CommandExecRequest, uplink: Uplink) -> Result<(), HandlerError> {
        let policy = self
            .allowlist
            .check(&req.command, &req.args)
            .map_err(|e| HandlerError::Command(e.to_string()))?;
        let timeout = match req.timeout_secs {
            0 => policy.timeout,
            secs => policy.timeout.min(Duration::from_secs(secs)),
        };

        let mut child = Command::new(&req.command)
            .args(&req.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::Command(format!("spawn {}: {e}", req.command)))?;
        info!(command_id = %req.command_id, command = %req.command, "command started");

        let readers = [
            child
                .stdout
                .take()
                .map(|r| pump(r, OutputStream::Stdout, req.command_id.clone(), uplink.clone())),
            child
                .stderr
                .take()
                .map(|r| pump(r, OutputStream::Stderr, req.command_id.clone(), uplink.clone())),
        ];
        tokio::spawn(supervise(
            child,
            readers,
            timeout,
            req.command_id.clone(),
            uplink,
        ));
        Ok(())
    }
}

fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    command_id: String,
    uplink: Uplink,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(command_id = %command_id, "output read error: {e}");
                    break;
                }
            };
            let chunk = CommandChunk {
                command_id: command_id.clone(),
                stream,
                data: String::from_utf8_lossy(&buf[..n]).into_owned(),
            };
            if let Ok(msg) = ControlMessage::new(MessageType::CommandChunk, Some(&chunk))
                && !uplink.send_msg(&msg)
            {
                debug!(command_id = %command_id, "output chunk dropped");
            }
        }
    })
}

async fn supervise(
    mut child: Child,
    readers: [Option<JoinHandle<()>>; 2],
    timeout: Duration,
    command_id: String,
    uplink: Uplink,
) {
    let (outcome, exit_code, error) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (CommandOutcome::Completed, status.code(), None),
        Ok(Err(e)) => (CommandOutcome::Failed, None, Some(e.to_string())),
        Err(_) => {
            warn!(command_id = %command_id, ?timeout, "command timed out, killing");
            let _ = child.kill().await;
            (CommandOutcome::TimedOut, None, None)
        }
    };

    // Flush remaining output before the terminal message.
    for reader in readers.into_iter().flatten() {
        let _ = reader.await;
    }

    info!(command_id = %command_id, ?outcome, ?exit_code, "command finished");
    let response = CommandResponse {
        command_id,
        outcome,
        exit_code,
        error,
    };
    if let Ok(msg) = ControlMessage::new(MessageType::CommandResponse, Some(&response)) {
        uplink.send_msg(&msg);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use canbridge_control::CommandPolicy;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(CommandAllowlist::new([
            CommandPolicy {
                name: "sh".into(),
                max_args: 2,
                timeout: Duration::from_secs(10),
            },
            CommandPolicy {
                name: "sleep".into(),
                max_args: 1,
                timeout: Duration::from_secs(1),
            },
        ]))
    }

    fn request(command: &str, args: &[&str], timeout_secs: u64) -> CommandExecRequest {
        CommandExecRequest {
            command_id: "c1".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs,
        }
    }

    fn uplink() -> (Uplink, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let up = Uplink::default();
        up.attach(tx);
        (up, rx)
    }

    /// Collects chunks until the terminal response.
    async fn collect(rx: &mut mpsc::Receiver<WsMessage>) -> (String, String, CommandResponse) {
        let (mut out, mut err) = (String::new(), String::new());
        loop {
            let Some(WsMessage::Text(t)) = rx.recv().await else {
                panic!("uplink closed");
            };
            let msg = ControlMessage::from_json(&t).unwrap();
            match msg.msg_type {
                MessageType::CommandChunk => {
                    let c: CommandChunk = msg.parse_payload().unwrap().unwrap();
                    match c.stream {
                        OutputStream::Stdout => out.push_str(&c.data),
                        OutputStream::Stderr => err.push_str(&c.data),
                    }
                }
                MessageType::CommandResponse => {
                    return (out, err, msg.parse_payload().unwrap().unwrap());
                }
                other => panic!("unexpected {other}"),
            }
        }
    }

    #[tokio::test]
    async fn streams_output_then_exit_code() {
        let (up, mut rx) = uplink();
        runner()
            .start(&request("sh", &["-c", "echo hi; echo oops >&2; exit 3"], 0), up)
            .unwrap();
        let (out, err, resp) = collect(&mut rx).await;
        assert_eq!(out, "hi\n");
        assert_eq!(err, "oops\n");
        assert_eq!(resp.outcome, CommandOutcome::Completed);
        assert_eq!(resp.exit_code, Some(3));
    }

    #[tokio::test]
    async fn policy_timeout_caps_request() {
        let (up, mut rx) = uplink();
        runner().start(&request("sleep", &["30"], 60), up).unwrap();
        let (_, _, resp) = collect(&mut rx).await;
        assert_eq!(resp.outcome, CommandOutcome::TimedOut);
        assert_eq!(resp.exit_code, None);
    }

    #[test]
    fn refuses_unlisted_and_long_arg_lists() {
        let (up, _rx) = uplink();
        let r = runner();
        assert!(matches!(
            r.start(&request("rm", &["-rf", "/"], 0), up.clone()),
            Err(HandlerError::Command(_))
        ));
        assert!(matches!(
            r.start(&request("sleep", &["1", "2"], 0), up),
            Err(HandlerError::Command(_))
        ));
    }
}
