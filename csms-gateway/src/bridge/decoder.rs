//! External decoder process
//!
//! One child process per session, speaking newline-delimited JSON on
//! stdin/stdout. Stdout lines are delivered on a channel; stderr is logged.
//! Writes to stdin are not throttled: a decoder that stops reading will
//! eventually stall its own session.

use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::DecoderConfig;
use crate::error::GatewayError;

/// Environment variable carrying the device identifier to the decoder
pub const CHARGE_POINT_ENV: &str = "CSMS_CHARGE_POINT_ID";

const OUTPUT_BUFFER: usize = 64;

/// Output of the decoder's stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderOutput {
    /// One complete line, trimmed
    Line(String),
    /// Stdout closed: the process exited or was killed
    Exited,
}

/// Handle to a running decoder
pub struct DecoderProcess {
    charge_point_id: String,
    child: Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
}

impl DecoderProcess {
    /// Spawn the decoder and start its reader tasks
    pub fn spawn(
        config: &DecoderConfig,
        charge_point_id: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<DecoderOutput>), GatewayError> {
        let failed = |reason: String| GatewayError::DecoderProcess {
            charge_point_id: charge_point_id.to_string(),
            reason,
        };

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .env(CHARGE_POINT_ENV, charge_point_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| failed(format!("cannot start {}: {}", config.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| failed("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| failed("stdout not captured".into()))?;
        let stderr = child.stderr.take();

        debug!(
            "{}: decoder started (pid {:?})",
            charge_point_id,
            child.id()
        );

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);

        // Stdout reader
        let id = charge_point_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) if buf.last() != Some(&b'\n') => {
                        warn!(
                            "{}: dropping partial decoder line at EOF: {}",
                            id,
                            String::from_utf8_lossy(&buf)
                        );
                        break;
                    }
                    Ok(_) => {
                        let line = match std::str::from_utf8(&buf) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!(
                                    "{}: dropping non-UTF-8 decoder line ({}): {}",
                                    id,
                                    e,
                                    String::from_utf8_lossy(&buf).trim_end()
                                );
                                continue;
                            }
                        };
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!("{}: decoder -> {}", id, trimmed);
                        if tx.send(DecoderOutput::Line(trimmed.to_string())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("{}: error reading decoder stdout: {}", id, e);
                        break;
                    }
                }
            }
            let _ = tx.send(DecoderOutput::Exited).await;
        });

        // Stderr is diagnostics only
        if let Some(stderr) = stderr {
            let id = charge_point_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("{}: decoder stderr: {}", id, line);
                }
            });
        }

        let process = Arc::new(Self {
            charge_point_id: charge_point_id.to_string(),
            child: Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
        });
        Ok((process, rx))
    }

    /// Write one line to the decoder's stdin
    pub async fn write_line(&self, line: &str) -> Result<(), GatewayError> {
        let mut stdin = self.stdin.lock().await;
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|e| GatewayError::DecoderProcess {
            charge_point_id: self.charge_point_id.clone(),
            reason: format!("stdin write failed: {}", e),
        })
    }

    /// Request termination without waiting for it
    pub fn kill(&self) {
        let mut child = self.child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.start_kill() {
            debug!("{}: decoder kill failed: {}", self.charge_point_id, e);
        }
    }

    /// Exit code if the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        match self.child.lock().try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.child.lock().try_wait(), Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(program: &str, args: &[&str]) -> DecoderConfig {
        DecoderConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: None,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<DecoderOutput>) -> DecoderOutput {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_line_round_trip_and_kill() {
        let (decoder, mut rx) = DecoderProcess::spawn(&config("cat", &[]), "CP1").unwrap();
        assert!(decoder.is_running());

        decoder.write_line(r#"[2,"m1","Heartbeat",{}]"#).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            DecoderOutput::Line(r#"[2,"m1","Heartbeat",{}]"#.to_string())
        );

        decoder.kill();
        assert_eq!(next(&mut rx).await, DecoderOutput::Exited);
    }

    #[tokio::test]
    async fn test_split_lines_and_trailing_partial() {
        let script = r#"printf '[3,"a",'; sleep 0.1; printf '{}]\n\n[3,"b",{}]\n[3,"c"'"#;
        let (_decoder, mut rx) = DecoderProcess::spawn(&config("sh", &["-c", script]), "CP1").unwrap();

        assert_eq!(next(&mut rx).await, DecoderOutput::Line(r#"[3,"a",{}]"#.into()));
        assert_eq!(next(&mut rx).await, DecoderOutput::Line(r#"[3,"b",{}]"#.into()));
        // The unterminated line is dropped
        assert_eq!(next(&mut rx).await, DecoderOutput::Exited);
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let script = r#"printf '\377\376 junk\n[3,"a",{}]\n'; cat"#;
        let (decoder, mut rx) = DecoderProcess::spawn(&config("sh", &["-c", script]), "CP1").unwrap();

        assert_eq!(next(&mut rx).await, DecoderOutput::Line(r#"[3,"a",{}]"#.into()));

        // The reader is still alive
        decoder.write_line(r#"[3,"b",{}]"#).await.unwrap();
        assert_eq!(next(&mut rx).await, DecoderOutput::Line(r#"[3,"b",{}]"#.into()));
        assert!(decoder.is_running());

        decoder.kill();
        assert_eq!(next(&mut rx).await, DecoderOutput::Exited);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let result = DecoderProcess::spawn(&config("/nonexistent/decoder", &[]), "CP1");
        match result {
            Err(GatewayError::DecoderProcess { charge_point_id, .. }) => {
                assert_eq!(charge_point_id, "CP1")
            }
            _ => panic!("expected DecoderProcess error"),
        }
    }

    #[tokio::test]
    async fn test_exit_code() {
        let (decoder, mut rx) = DecoderProcess::spawn(&config("sh", &["-c", "exit 3"]), "CP1").unwrap();
        assert_eq!(next(&mut rx).await, DecoderOutput::Exited);

        let mut code = None;
        for _ in 0..50 {
            code = decoder.exit_code();
            if code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(code, Some(3));
    }
}
