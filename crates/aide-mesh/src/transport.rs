//! JSON-RPC over stdio to the signal-cli child process.
//!
//! One writer (requests get sequential ids), one reader task that routes
//! responses to their waiting callers and queues notifications (incoming
//! envelopes, receipts) onto a channel for the receive loop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use aide_core::config::{TransportConfig, TRANSPORT_RPC_TIMEOUT_SECS};
use aide_core::AideError;

pub struct SignalRpc {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    _child: Child,
}

impl SignalRpc {
    /// Spawn the transport child and start the reader task. Returns the
    /// client and the stream of notifications.
    pub fn spawn(config: &TransportConfig) -> Result<(Arc<Self>, mpsc::Receiver<Value>), AideError> {
        let mut cmd = Command::new(&config.binary);
        if !config.account.is_empty() {
            cmd.arg("-a").arg(&config.account);
        }
        cmd.args(&config.extra_args);
        cmd.arg("jsonRpc");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            AideError::Transport(format!("cannot start transport binary {}: {e}", config.binary))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AideError::Transport("transport stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AideError::Transport("transport stdout unavailable".into()))?;

        let (notify_tx, notify_rx) = mpsc::channel(256);
        let rpc = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            _child: child,
        });

        let reader_rpc = rpc.clone();
        tokio::spawn(async move {
            reader_rpc.read_loop(stdout, notify_tx).await;
        });

        info!(binary = %config.binary, "transport child started");
        Ok((rpc, notify_rx))
    }

    async fn read_loop(
        self: Arc<Self>,
        stdout: tokio::process::ChildStdout,
        notify_tx: mpsc::Sender<Value>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let message: Value = match serde_json::from_str(line) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(error = %e, "unparseable transport line");
                            continue;
                        }
                    };

                    if let Some(id) = message.get("id").and_then(Value::as_u64) {
                        let waiter = self.pending.lock().unwrap().remove(&id);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(message);
                        }
                        continue;
                    }
                    if message.get("method").is_some()
                        && notify_tx.send(message).await.is_err()
                    {
                        return; // receive loop gone
                    }
                }
                Ok(None) => {
                    error!("transport stdout closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "transport read error, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// One JSON-RPC call with the transport timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, AideError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().unwrap().remove(&id);
                return Err(AideError::Transport(format!("transport write failed: {e}")));
            }
            let _ = stdin.flush().await;
        }

        let timeout = std::time::Duration::from_secs(TRANSPORT_RPC_TIMEOUT_SECS);
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(AideError::Transport("transport reader terminated".into()))
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(AideError::Transport(format!("timeout waiting for {method}")));
            }
        };

        if let Some(error) = response.get("error") {
            return Err(AideError::Transport(format!("{method} failed: {error}")));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }
}
