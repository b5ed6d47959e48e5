//! Per-upstream subprocess lifecycle: spawn, initialize handshake,
//! request/response correlation, stderr pumping, health probing and
//! supervised restart.
//!
//! Grounded on `crates/codex/src/mcp/jsonrpc.rs::JsonRpcTransport` (spawn,
//! pending-response map, writer/reader/stderr task split, `Drop` killing the
//! child) and `crates/codex/src/mcp/client.rs::CodexMcpServer::start`
//! (initialize handshake sequencing). Generalized from "one hardcoded
//! subcommand of one binary" to an arbitrary configured `argv`, with the
//! `FrameStream`/`stdio_mode` duplex layer replacing that reader's
//! newline-only `BufReader::lines` loop, and with the health-check /
//! restart supervisor that single-child transport never needed (it never
//! restarted its child; this proxy owns upstreams for a whole session).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::frame::{Frame, FrameStream};
use crate::message::{self, MessageKind};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Lifecycle states for one upstream subprocess.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamStatus {
    New,
    Starting,
    Initialized,
    Unhealthy,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

/// Events the receive pump hands off to the router: upstream-originated
/// requests and notifications.
#[derive(Debug)]
pub enum UpstreamEvent {
    Request {
        server_id: String,
        upstream_id: u64,
        method: String,
        params: Value,
    },
    Notification {
        server_id: String,
        method: String,
        params: Value,
    },
}

type ChildFrameStream = FrameStream<ChildStdout, ChildStdin>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, McpError>>>;

struct Runtime {
    frame: Option<Arc<ChildFrameStream>>,
    pending: PendingMap,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
    capabilities: Value,
    server_info: Value,
    backoff: Duration,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            frame: None,
            pending: HashMap::new(),
            child: None,
            tasks: Vec::new(),
            capabilities: Value::Object(Default::default()),
            server_info: Value::Object(Default::default()),
            backoff: INITIAL_BACKOFF,
        }
    }
}

/// One configured upstream MCP server.
pub struct UpstreamServer {
    pub id: String,
    config: ServerConfig,
    status: RwLock<UpstreamStatus>,
    runtime: Mutex<Runtime>,
    next_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<UpstreamEvent>,
    response_timeout: Duration,
    healthcheck_interval: Duration,
    healthcheck_timeout: Duration,
}

impl UpstreamServer {
    pub fn new(
        config: ServerConfig,
        events_tx: mpsc::UnboundedSender<UpstreamEvent>,
        response_timeout: Duration,
        healthcheck_interval: Duration,
        healthcheck_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: config.id.clone(),
            config,
            status: RwLock::new(UpstreamStatus::New),
            runtime: Mutex::new(Runtime::default()),
            next_id: AtomicU64::new(1),
            events_tx,
            response_timeout,
            healthcheck_interval,
            healthcheck_timeout,
        })
    }

    pub async fn status(&self) -> UpstreamStatus {
        *self.status.read().await
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(self.status().await, UpstreamStatus::Initialized)
    }

    pub async fn capabilities(&self) -> Value {
        self.runtime.lock().await.capabilities.clone()
    }

    pub async fn server_info(&self) -> Value {
        self.runtime.lock().await.server_info.clone()
    }

    /// Spawn the child, perform the `initialize` handshake, and launch the
    /// background pumps and health loop. `client_init` is the client's
    /// original `initialize` params, forwarded with the same
    /// `protocolVersion` and `capabilities`.
    pub async fn start(self: &Arc<Self>, client_init: &Value) -> Result<(), McpError> {
        *self.status.write().await = UpstreamStatus::Starting;
        match tokio::time::timeout(self.config.startup_timeout.0, self.connect_and_initialize(client_init)).await {
            Ok(Ok(())) => {
                *self.status.write().await = UpstreamStatus::Initialized;
                if self.healthcheck_interval > Duration::ZERO {
                    self.spawn_health_loop().await;
                }
                Ok(())
            }
            Ok(Err(err)) => {
                *self.status.write().await = UpstreamStatus::Failed;
                Err(err)
            }
            Err(_) => {
                *self.status.write().await = UpstreamStatus::Failed;
                Err(McpError::Timeout(self.config.startup_timeout.0))
            }
        }
    }

    async fn connect_and_initialize(self: &Arc<Self>, client_init: &Value) -> Result<(), McpError> {
        let mut command = Command::new(&self.config.command[0]);
        command
            .args(&self.config.command[1..])
            .envs(self.config.env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| McpError::Spawn {
            command: format!("{:?}", self.config.command),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Transport("child stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Transport("child stdin unavailable".into()))?;
        let stderr = child.stderr.take();

        let frame = Arc::new(FrameStream::new(stdout, stdin, self.config.stdio_mode.into()));

        let mut runtime = self.runtime.lock().await;
        runtime.frame = Some(frame.clone());
        runtime.pending = HashMap::new();
        runtime.child = Some(child);
        runtime.tasks.clear();
        drop(runtime);

        let receive_handle = tokio::spawn(Arc::clone(self).receive_pump(frame.clone()));
        let mut tasks = vec![receive_handle];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(Self::stderr_pump(self.id.clone(), stderr)));
        }
        self.runtime.lock().await.tasks = tasks;

        let mut init_params = client_init.clone();
        if !init_params.is_object() {
            init_params = Value::Object(Default::default());
        }
        if let Some(client_info) = init_params.get_mut("clientInfo") {
            if let Some(name) = client_info.get("name").and_then(Value::as_str) {
                client_info["name"] = Value::String(format!("{name}-through-proxy"));
            } else {
                client_info["name"] = Value::String("proxy-through-proxy".to_string());
            }
        }

        let (_, rx) = self.request_raw("initialize", init_params).await?;
        let result = recv_with_timeout(rx, self.config.startup_timeout.0).await?;

        let mut runtime = self.runtime.lock().await;
        runtime.capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        runtime.server_info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        drop(runtime);

        self.notify("notifications/initialized", Value::Object(Default::default()))
            .await?;
        Ok(())
    }

    /// Send a request, allocating a fresh monotone ID local to this
    /// upstream.
    pub async fn request_raw(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, McpError>>), McpError> {
        if matches!(
            self.status().await,
            UpstreamStatus::Stopping | UpstreamStatus::Stopped | UpstreamStatus::Failed
        ) {
            return Err(McpError::Transport(format!("upstream `{}` is not running", self.id)));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        let mut runtime = self.runtime.lock().await;
        let frame = runtime
            .frame
            .clone()
            .ok_or_else(|| McpError::Transport("upstream has no active connection".into()))?;
        runtime.pending.insert(id, tx);
        drop(runtime);

        let value = message::request(crate::message::MessageId::Number(id as i64), method, params);
        if let Err(err) = frame.write(&value).await {
            self.runtime.lock().await.pending.remove(&id);
            return Err(err);
        }

        Ok((id, rx))
    }

    /// `request_raw()` bounded by `response_timeout`.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let (id, rx) = self.request_raw(method, params).await?;
        let result = recv_with_timeout(rx, self.response_timeout).await;
        if result.is_err() {
            self.runtime.lock().await.pending.remove(&id);
        }
        result
    }

    pub async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let runtime = self.runtime.lock().await;
        let frame = runtime
            .frame
            .clone()
            .ok_or_else(|| McpError::Transport("upstream has no active connection".into()))?;
        drop(runtime);
        frame.write(&message::notification(method, params)).await
    }

    /// Forward a client response (for an upstream-originated request) back
    /// to this upstream, with the ID rewritten to the upstream's original
    /// ID.
    pub async fn forward_client_response(
        &self,
        original_id: u64,
        result: Option<Value>,
        error: Option<(i64, String, Option<Value>)>,
    ) -> Result<(), McpError> {
        let runtime = self.runtime.lock().await;
        let frame = runtime
            .frame
            .clone()
            .ok_or_else(|| McpError::Transport("upstream has no active connection".into()))?;
        drop(runtime);

        let id = crate::message::MessageId::Number(original_id as i64);
        let value = match (result, error) {
            (Some(result), _) => message::success(id, result),
            (None, Some((code, msg, data))) => message::error_response(Some(id), code, &msg, data),
            (None, None) => message::success(id, Value::Null),
        };
        frame.write(&value).await
    }

    async fn receive_pump(self: Arc<Self>, frame: Arc<ChildFrameStream>) {
        loop {
            let frame_result = frame.read().await;
            match frame_result {
                Ok(Frame::Message(value)) => self.dispatch_incoming(value).await,
                Ok(Frame::Closed) => {
                    self.fail_all_pending(McpError::Transport("upstream closed connection".into()))
                        .await;
                    break;
                }
                Err(err) => {
                    tracing::warn!(server_id = %self.id, error = %err, "failed to decode upstream frame");
                }
            }
        }
    }

    async fn dispatch_incoming(&self, value: Value) {
        match crate::message::classify(&value) {
            Some(MessageKind::Response) => self.handle_response(value).await,
            Some(MessageKind::Request) => {
                let Some(method) = value.get("method").and_then(Value::as_str) else {
                    return;
                };
                let Some(upstream_id) = value.get("id").and_then(Value::as_u64) else {
                    tracing::warn!(server_id = %self.id, "upstream request with non-numeric id, dropping");
                    return;
                };
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                let _ = self.events_tx.send(UpstreamEvent::Request {
                    server_id: self.id.clone(),
                    upstream_id,
                    method: method.to_string(),
                    params,
                });
            }
            Some(MessageKind::Notification) => {
                let Some(method) = value.get("method").and_then(Value::as_str) else {
                    return;
                };
                let params = value.get("params").cloned().unwrap_or(Value::Null);
                let _ = self.events_tx.send(UpstreamEvent::Notification {
                    server_id: self.id.clone(),
                    method: method.to_string(),
                    params,
                });
            }
            None => {
                tracing::warn!(server_id = %self.id, "received malformed upstream message");
            }
        }
    }

    async fn handle_response(&self, value: Value) {
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            tracing::warn!(server_id = %self.id, "upstream response with non-numeric id, dropping");
            return;
        };

        let sender = self.runtime.lock().await.pending.remove(&id);
        let Some(tx) = sender else {
            tracing::warn!(server_id = %self.id, id, "response for unknown request id, dropping");
            return;
        };

        let outcome = if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32603);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream error")
                .to_string();
            let data = error.get("data").cloned();
            Err(McpError::Rpc { code, message, data })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };

        let _ = tx.send(outcome);
    }

    async fn stderr_pump(server_id: String, stderr: ChildStderr) {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::info!(server_id = %server_id, "{line}"),
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(server_id = %server_id, error = %err, "stderr pump read error");
                    break;
                }
            }
        }
    }

    async fn fail_all_pending(&self, make_error: McpError) {
        let mut runtime = self.runtime.lock().await;
        for (_, tx) in runtime.pending.drain() {
            let err = match &make_error {
                McpError::Transport(msg) => McpError::Transport(msg.clone()),
                McpError::Timeout(d) => McpError::Timeout(*d),
                other => McpError::Transport(other.to_string()),
            };
            let _ = tx.send(Err(err));
        }
    }

    async fn spawn_health_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.health_loop().await;
        });
        self.runtime.lock().await.tasks.push(handle);
    }

    async fn health_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.healthcheck_interval).await;
            if !matches!(
                self.status().await,
                UpstreamStatus::Initialized | UpstreamStatus::Unhealthy
            ) {
                continue;
            }

            let ping = tokio::time::timeout(self.healthcheck_timeout, self.request("ping", Value::Null)).await;
            match ping {
                Ok(Ok(_)) => {
                    self.runtime.lock().await.backoff = INITIAL_BACKOFF;
                }
                _ => {
                    tracing::warn!(server_id = %self.id, "healthcheck failed, restarting upstream");
                    *self.status.write().await = UpstreamStatus::Unhealthy;
                    self.fail_all_pending(McpError::Transport("upstream unhealthy".into()))
                        .await;
                    self.restart().await;
                }
            }
        }
    }

    async fn restart(self: &Arc<Self>) {
        *self.status.write().await = UpstreamStatus::Restarting;
        let backoff = self.runtime.lock().await.backoff;

        self.kill_child().await;
        tokio::time::sleep(backoff).await;

        let next_backoff = (backoff * 2).min(MAX_BACKOFF);
        self.runtime.lock().await.backoff = next_backoff;

        let client_init = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "mcp-proxy", "version": env!("CARGO_PKG_VERSION")},
        });
        match self.connect_and_initialize(&client_init).await {
            Ok(()) => {
                *self.status.write().await = UpstreamStatus::Initialized;
                tracing::info!(server_id = %self.id, "upstream restarted successfully");
            }
            Err(err) => {
                tracing::warn!(server_id = %self.id, error = %err, "upstream restart failed, will retry");
                *self.status.write().await = UpstreamStatus::Unhealthy;
            }
        }
    }

    async fn kill_child(&self) {
        let mut runtime = self.runtime.lock().await;
        for task in runtime.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = runtime.child.take() {
            let _ = child.start_kill();
        }
        runtime.frame = None;
    }

    /// Graceful shutdown (spec.md §4.2): best-effort `shutdown` request
    /// bounded by `shutdown_grace`, then SIGTERM, then SIGKILL if the child
    /// is still alive after a second `shutdown_grace` wait.
    pub async fn shutdown(&self) {
        *self.status.write().await = UpstreamStatus::Stopping;

        let _ = tokio::time::timeout(self.config.shutdown_grace.0, self.request("shutdown", Value::Null)).await;
        self.fail_all_pending(McpError::Transport("shutting down".into())).await;

        let mut runtime = self.runtime.lock().await;
        for task in runtime.tasks.drain(..) {
            task.abort();
        }
        if let Some(mut child) = runtime.child.take() {
            if let Some(pid) = child.id() {
                if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::debug!(server_id = %self.id, error = %err, "failed to send SIGTERM to upstream");
                }
            }
            match tokio::time::timeout(self.config.shutdown_grace.0, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.start_kill();
                }
            }
        }
        runtime.frame = None;
        drop(runtime);

        *self.status.write().await = UpstreamStatus::Stopped;
    }
}

async fn recv_with_timeout(
    rx: oneshot::Receiver<Result<Value, McpError>>,
    timeout: Duration,
) -> Result<Value, McpError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(err),
        Ok(Err(_)) => Err(McpError::ChannelClosed),
        Err(_) => Err(McpError::Timeout(timeout)),
    }
}
