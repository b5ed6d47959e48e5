//! Client-facing dispatcher: merges every upstream's tools, resources and
//! prompts into one namespaced view, routes calls to the upstream that
//! owns them, and relays upstream-originated requests and notifications
//! back through the single client connection.
//!
//! The request/response dispatch *shape* — read a frame, classify it, hand
//! it to a per-kind handler — follows
//! `other_examples/07772324_tomatyss-taskter__src-mcp-mod.rs.rs::serve_stream`;
//! the per-request pending/ID-remap bookkeeping reuses the `PendingRequests`
//! map pattern from `crates/codex/src/mcp/jsonrpc.rs`, applied a second
//! time over the client connection instead of an upstream one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::auth::AuthGate;
use crate::config::ProxyConfig;
use crate::cursor;
use crate::error::{code, McpError};
use crate::frame::{Frame, FrameStream};
use crate::message::{self, MessageId, MessageKind};
use crate::ratelimit::RateLimiter;
use crate::resource_uri;
use crate::upstream::{UpstreamEvent, UpstreamServer};

/// `(code, message, data)`, ready to hand to `message::error_response`.
type RpcErr = (i64, String, Option<Value>);

/// Merged listing page size. MCP's list methods take a cursor but no
/// explicit page size, so the proxy picks one.
const PAGE_SIZE: usize = 50;

/// How often the serve loop sweeps idle rate-limit buckets.
const RATE_LIMIT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// A bucket untouched for this long is dropped rather than refilled forever.
const RATE_LIMIT_SWEEP_IDLE_FOR: Duration = Duration::from_secs(600);

#[derive(Clone)]
struct ToolEntry {
    server_id: String,
    original_name: String,
    descriptor: Value,
}

#[derive(Clone)]
struct PromptEntry {
    server_id: String,
    original_name: String,
    descriptor: Value,
}

#[derive(Clone)]
struct ResourceEntry {
    server_id: String,
    original_uri: String,
    descriptor: Value,
}

#[derive(Default)]
struct Registries {
    tools: HashMap<String, Vec<ToolEntry>>,
    prompts: HashMap<String, Vec<PromptEntry>>,
    resources: HashMap<String, Vec<ResourceEntry>>,
    resource_templates: HashMap<String, Vec<Value>>,
}

#[derive(Default)]
struct Lookups {
    tools: HashMap<String, ToolEntry>,
    prompts: HashMap<String, PromptEntry>,
    resources: HashMap<String, ResourceEntry>,
}

/// Owns every configured upstream plus the single client connection, and
/// drives both directions of the proxy for the lifetime of one session.
pub struct Router<R, W> {
    config: ProxyConfig,
    client_frame: Arc<FrameStream<R, W>>,
    upstreams: Vec<Arc<UpstreamServer>>,
    auth: AuthGate,
    rate_limiter: Option<RateLimiter>,
    registries: RwLock<Registries>,
    lookups: RwLock<Lookups>,
    /// client-minted id -> (server that asked, server's own request id),
    /// for routing the client's eventual answer back.
    upstream_requests: Mutex<HashMap<String, (String, u64)>>,
    seq: AtomicU64,
    upstream_events_rx: Mutex<mpsc::UnboundedReceiver<UpstreamEvent>>,
}

impl<R, W> Router<R, W>
where
    R: AsyncRead + Unpin + Send + Sync + 'static,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(config: ProxyConfig, client_frame: Arc<FrameStream<R, W>>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let healthcheck_interval = Duration::from_secs(config.healthcheck_interval);

        let upstreams = config
            .servers
            .iter()
            .cloned()
            .map(|server_config| {
                UpstreamServer::new(
                    server_config,
                    events_tx.clone(),
                    config.response_timeout.0,
                    healthcheck_interval,
                    config.healthcheck_timeout.0,
                )
            })
            .collect::<Vec<_>>();

        let auth = AuthGate::new(config.auth_token.clone());
        let rate_limiter = config.rate_limit_per_minute.map(RateLimiter::new);

        Arc::new(Self {
            config,
            client_frame,
            upstreams,
            auth,
            rate_limiter,
            registries: RwLock::new(Registries::default()),
            lookups: RwLock::new(Lookups::default()),
            upstream_requests: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            upstream_events_rx: Mutex::new(events_rx),
        })
    }

    /// Drive the proxy until the client connection closes, then shut every
    /// upstream down.
    pub async fn serve(self: Arc<Self>) -> Result<(), McpError> {
        let mut sweep = tokio::time::interval(RATE_LIMIT_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.client_frame.read() => {
                    match frame {
                        Ok(Frame::Message(value)) => {
                            let this = Arc::clone(&self);
                            tokio::spawn(async move { this.handle_client_message(value).await });
                        }
                        Ok(Frame::Closed) => break,
                        Err(err) => {
                            // A single malformed frame must not end the
                            // session (spec.md §7: "never crash on a single
                            // bad frame"); keep serving.
                            tracing::warn!(error = %err, "failed to decode client frame, dropping");
                        }
                    }
                }
                Some(event) = self.next_upstream_event() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_upstream_event(event).await });
                }
                _ = sweep.tick() => {
                    // spec.md §4.5: "Idle keys are swept opportunistically."
                    if let Some(limiter) = &self.rate_limiter {
                        limiter.sweep_idle(RATE_LIMIT_SWEEP_IDLE_FOR).await;
                    }
                }
            }
        }
        self.shutdown_all().await;
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        for upstream in &self.upstreams {
            upstream.shutdown().await;
        }
    }

    async fn next_upstream_event(&self) -> Option<UpstreamEvent> {
        self.upstream_events_rx.lock().await.recv().await
    }

    fn upstream_by_id(&self, id: &str) -> Option<Arc<UpstreamServer>> {
        self.upstreams.iter().find(|u| u.id == id).cloned()
    }

    fn namespaced(&self, server_id: &str, original: &str) -> String {
        format!("{server_id}{}{original}", self.config.id_separator)
    }

    async fn send_to_client(&self, value: Value) {
        if let Err(err) = self.client_frame.write(&value).await {
            tracing::warn!(error = %err, "failed to write to client connection");
        }
    }

    // -- client -> proxy dispatch -----------------------------------------

    async fn handle_client_message(self: Arc<Self>, value: Value) {
        match message::classify(&value) {
            Some(MessageKind::Request) => self.handle_client_request(value).await,
            Some(MessageKind::Response) => self.handle_client_response(value).await,
            Some(MessageKind::Notification) => self.handle_client_notification(value).await,
            None => {
                // Neither `id` nor `method` — not a valid JSON-RPC request,
                // response or notification. spec.md §7: never silently drop
                // a client request; always produce a response, or, if there
                // is no id to reply to, a final error.
                tracing::warn!("received malformed client message, replying with invalid request error");
                let id = value
                    .get("id")
                    .cloned()
                    .and_then(|v| serde_json::from_value::<MessageId>(v).ok());
                self.send_to_client(message::error_response(
                    id,
                    code::INVALID_REQUEST,
                    "invalid request",
                    None,
                ))
                .await;
            }
        }
    }

    async fn handle_client_request(self: Arc<Self>, value: Value) {
        let Some(id) = value
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value::<MessageId>(v).ok())
        else {
            tracing::warn!("client request missing a usable id, dropping");
            return;
        };
        let method = value.get("method").and_then(Value::as_str).unwrap_or("").to_string();
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        if let Err((code, msg)) = self.authorize(&params).await {
            self.send_to_client(message::error_response(Some(id), code, &msg, None))
                .await;
            return;
        }

        let outcome = match method.as_str() {
            "initialize" => self.handle_initialize(params).await,
            "ping" => Ok(json!({})),
            "tools/list" => self.handle_tools_list(params).await,
            "tools/call" => self.handle_tools_call(params).await,
            "prompts/list" => self.handle_prompts_list(params).await,
            "prompts/get" => self.handle_prompts_get(params).await,
            "resources/list" => self.handle_resources_list(params).await,
            "resources/read" => self.handle_resources_read(params).await,
            "resources/templates/list" => self.handle_resource_templates_list(params).await,
            "logging/setLevel" => self.handle_logging_set_level(params).await,
            other => Err((
                code::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
                None,
            )),
        };

        match outcome {
            Ok(result) => self.send_to_client(message::success(id, result)).await,
            Err((code, msg, data)) => {
                self.send_to_client(message::error_response(Some(id), code, &msg, data))
                    .await
            }
        }
    }

    /// Forward the client's unrecognized notifications to every initialized
    /// upstream.
    async fn handle_client_notification(self: Arc<Self>, value: Value) {
        let method = value.get("method").and_then(Value::as_str).unwrap_or("").to_string();
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        // Notifications bypass the rate limiter but still honor auth
        // (spec.md §4.3); there's no request id to reply to, so an
        // unauthorized notification is just dropped.
        if self.check_auth(&params).is_err() {
            tracing::debug!(method = %method, "dropping unauthorized client notification");
            return;
        }

        for upstream in &self.upstreams {
            if upstream.is_initialized().await {
                if let Err(err) = upstream.notify(&method, params.clone()).await {
                    tracing::debug!(server_id = %upstream.id, error = %err, "failed to forward client notification");
                }
            }
        }
    }

    /// A client reply to a request the proxy relayed from an upstream.
    async fn handle_client_response(self: Arc<Self>, value: Value) {
        let Some(id) = value
            .get("id")
            .cloned()
            .and_then(|v| serde_json::from_value::<MessageId>(v).ok())
        else {
            return;
        };
        let key = id.to_string();
        let Some((server_id, upstream_id)) = self.upstream_requests.lock().await.remove(&key) else {
            tracing::warn!(id = %key, "client response for an unknown upstream-originated request");
            return;
        };
        let Some(upstream) = self.upstream_by_id(&server_id) else {
            return;
        };

        let result = if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(code::INTERNAL_ERROR);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("client error")
                .to_string();
            let data = error.get("data").cloned();
            upstream.forward_client_response(upstream_id, None, Some((code, message, data))).await
        } else {
            let result = value.get("result").cloned().unwrap_or(Value::Null);
            upstream.forward_client_response(upstream_id, Some(result), None).await
        };
        if let Err(err) = result {
            tracing::warn!(server_id = %server_id, error = %err, "failed to forward client response upstream");
        }
    }

    // -- proxy -> upstream event relay ------------------------------------

    async fn handle_upstream_event(self: Arc<Self>, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Request {
                server_id,
                upstream_id,
                method,
                params,
            } => {
                // Client-visible ID is always `server_id:seq`, a literal
                // colon, unrelated to `id_separator` (which only namespaces
                // tool/prompt names).
                let seq = self.seq.fetch_add(1, Ordering::SeqCst);
                let client_id = format!("{server_id}:{seq}");
                self.upstream_requests
                    .lock()
                    .await
                    .insert(client_id.clone(), (server_id.clone(), upstream_id));
                let params = inject_proxy_server(params, &server_id);
                self.send_to_client(message::request(MessageId::String(client_id), &method, params))
                    .await;
            }
            UpstreamEvent::Notification {
                server_id,
                method,
                params,
            } => {
                if method.ends_with("list_changed") {
                    if let Some(upstream) = self.upstream_by_id(&server_id) {
                        self.refresh_registry_for(&upstream).await;
                    }
                }
                let params = inject_proxy_server(params, &server_id);
                self.send_to_client(message::notification(&method, params)).await;
            }
        }
    }

    // -- auth / rate limiting ----------------------------------------------

    /// Auth check only, no rate limiting — used for notifications, which
    /// spec.md §4.3 exempts from the rate limiter but not from auth.
    fn check_auth(&self, params: &Value) -> Result<(), (i64, String)> {
        let token = Self::auth_token(params);
        if !self.auth.validate(token) {
            return Err((code::UNAUTHORIZED, "unauthorized".to_string()));
        }
        Ok(())
    }

    fn auth_token(params: &Value) -> Option<&str> {
        params.get("proxy").and_then(|m| m.get("authToken")).and_then(Value::as_str)
    }

    async fn authorize(&self, params: &Value) -> Result<(), (i64, String)> {
        self.check_auth(params)?;
        let token = Self::auth_token(params);
        if let Some(limiter) = &self.rate_limiter {
            let key = AuthGate::rate_limit_key(token);
            if !limiter.allow(key).await {
                return Err((code::RATE_LIMITED, "rate limit exceeded".to_string()));
            }
        }
        Ok(())
    }

    // -- initialize / registry population ----------------------------------

    async fn handle_initialize(self: &Arc<Self>, params: Value) -> Result<Value, RpcErr> {
        self.start_all_upstreams(&params).await;
        self.refresh_all_registries().await;
        let capabilities = self.merged_capabilities().await;
        Ok(json!({
            "protocolVersion": params.get("protocolVersion").cloned().unwrap_or_else(|| json!("2024-11-05")),
            "capabilities": capabilities,
            "serverInfo": {"name": "mcp-proxy", "version": env!("CARGO_PKG_VERSION")},
        }))
    }

    /// Fan out to every configured upstream concurrently, each performing
    /// its own spawn + `initialize` handshake.
    async fn start_all_upstreams(&self, client_init: &Value) {
        let mut handles = Vec::new();
        for upstream in self.upstreams.clone() {
            let client_init = client_init.clone();
            handles.push(tokio::spawn(async move {
                if upstream.is_initialized().await {
                    return;
                }
                if let Err(err) = upstream.start(&client_init).await {
                    tracing::warn!(server_id = %upstream.id, error = %err, "upstream failed to start");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Used once, right after `initialize`'s fan-out, to seed every
    /// registry. Per-call listing handlers below re-fan-out on every
    /// `*/list` instead of trusting this snapshot, since an upstream that
    /// restarted mid-session needs its registry refreshed at the next
    /// listing call.
    async fn refresh_all_registries(&self) {
        for upstream in self.upstreams.clone() {
            self.refresh_registry_for(&upstream).await;
        }
    }

    async fn refresh_registry_for(&self, upstream: &Arc<UpstreamServer>) {
        if !upstream.is_initialized().await {
            return;
        }
        let tools = self.drain_paginated(upstream, "tools/list", "tools").await;
        self.replace_tools(&upstream.id, tools).await;

        let prompts = self.drain_paginated(upstream, "prompts/list", "prompts").await;
        self.replace_prompts(&upstream.id, prompts).await;

        let resources = self.drain_paginated(upstream, "resources/list", "resources").await;
        self.replace_resources(&upstream.id, resources).await;

        let templates = self
            .drain_paginated(upstream, "resources/templates/list", "resourceTemplates")
            .await;
        self.replace_resource_templates(&upstream.id, templates).await;
    }

    /// Re-fan-out a single listing kind to every initialized upstream
    /// concurrently and repopulate that kind's registry slice, clearing
    /// any prior entries for the same upstream. Called at the top of each
    /// `*/list` handler so a restarted upstream's tool set is picked up
    /// without waiting for a `list_changed` notification.
    async fn refresh_listing_kind<F, Fut>(self: &Arc<Self>, method: &'static str, items_key: &'static str, replace: F)
    where
        F: Fn(Arc<Self>, String, Vec<Value>) -> Fut + Send + Sync + 'static + Copy,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut handles = Vec::new();
        for upstream in self.upstreams.clone() {
            if !upstream.is_initialized().await {
                continue;
            }
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let items = this.drain_paginated(&upstream, method, items_key).await;
                replace(Arc::clone(&this), upstream.id.clone(), items).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn refresh_tools_listing(self: &Arc<Self>) {
        self.refresh_listing_kind("tools/list", "tools", |this, id, items| async move {
            this.replace_tools(&id, items).await;
        })
        .await;
    }

    async fn refresh_prompts_listing(self: &Arc<Self>) {
        self.refresh_listing_kind("prompts/list", "prompts", |this, id, items| async move {
            this.replace_prompts(&id, items).await;
        })
        .await;
    }

    async fn refresh_resources_listing(self: &Arc<Self>) {
        self.refresh_listing_kind("resources/list", "resources", |this, id, items| async move {
            this.replace_resources(&id, items).await;
        })
        .await;
    }

    async fn refresh_resource_templates_listing(self: &Arc<Self>) {
        self.refresh_listing_kind(
            "resources/templates/list",
            "resourceTemplates",
            |this, id, items| async move {
                this.replace_resource_templates(&id, items).await;
            },
        )
        .await;
    }

    /// Follow an upstream's own `nextCursor` chain to exhaustion. A failure
    /// partway through keeps whatever was already gathered rather than
    /// discarding it (an upstream hiccup shouldn't blank out its listing).
    async fn drain_paginated(&self, upstream: &UpstreamServer, method: &str, items_key: &str) -> Vec<Value> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params = json!({});
            if let Some(c) = &cursor {
                params["cursor"] = json!(c);
            }
            let result = match upstream.request(method, params).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(server_id = %upstream.id, method, error = %err, "failed to list from upstream");
                    break;
                }
            };
            if let Some(items) = result.get(items_key).and_then(Value::as_array) {
                out.extend(items.iter().cloned());
            }
            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) => cursor = Some(next.to_string()),
                None => break,
            }
        }
        out
    }

    async fn replace_tools(&self, server_id: &str, items: Vec<Value>) {
        let entries = items
            .into_iter()
            .filter_map(|item| {
                let name = item.get("name").and_then(Value::as_str)?.to_string();
                Some(ToolEntry {
                    server_id: server_id.to_string(),
                    original_name: name,
                    descriptor: item,
                })
            })
            .collect();
        self.registries.write().await.tools.insert(server_id.to_string(), entries);
        self.rebuild_tool_lookup().await;
    }

    async fn replace_prompts(&self, server_id: &str, items: Vec<Value>) {
        let entries = items
            .into_iter()
            .filter_map(|item| {
                let name = item.get("name").and_then(Value::as_str)?.to_string();
                Some(PromptEntry {
                    server_id: server_id.to_string(),
                    original_name: name,
                    descriptor: item,
                })
            })
            .collect();
        self.registries.write().await.prompts.insert(server_id.to_string(), entries);
        self.rebuild_prompt_lookup().await;
    }

    async fn replace_resources(&self, server_id: &str, items: Vec<Value>) {
        let entries = items
            .into_iter()
            .filter_map(|item| {
                let uri = item.get("uri").and_then(Value::as_str)?.to_string();
                Some(ResourceEntry {
                    server_id: server_id.to_string(),
                    original_uri: uri,
                    descriptor: item,
                })
            })
            .collect();
        self.registries
            .write()
            .await
            .resources
            .insert(server_id.to_string(), entries);
        self.rebuild_resource_lookup().await;
    }

    /// Templates follow the same aggregation pattern as `resources/list`
    /// (spec.md §4.3): namespaced by name, but — unlike a concrete resource
    /// URI — the `uriTemplate` pattern itself is left untouched, since it
    /// isn't a single resolvable URI to rewrite.
    async fn replace_resource_templates(&self, server_id: &str, items: Vec<Value>) {
        let tagged = items
            .into_iter()
            .map(|mut item| {
                if let Value::Object(map) = &mut item {
                    map.entry("proxy").or_insert_with(|| json!({}))["server"] = json!(server_id);
                    if let Some(name) = map.get("name").and_then(Value::as_str) {
                        let namespaced = self.namespaced(server_id, name);
                        map.insert("name".to_string(), json!(namespaced));
                    }
                }
                item
            })
            .collect();
        self.registries
            .write()
            .await
            .resource_templates
            .insert(server_id.to_string(), tagged);
    }

    async fn rebuild_tool_lookup(&self) {
        let registries = self.registries.read().await;
        let mut lookup = HashMap::new();
        for upstream in &self.upstreams {
            if let Some(entries) = registries.tools.get(&upstream.id) {
                for entry in entries {
                    lookup.insert(self.namespaced(&entry.server_id, &entry.original_name), entry.clone());
                }
            }
        }
        self.lookups.write().await.tools = lookup;
    }

    async fn rebuild_prompt_lookup(&self) {
        let registries = self.registries.read().await;
        let mut lookup = HashMap::new();
        for upstream in &self.upstreams {
            if let Some(entries) = registries.prompts.get(&upstream.id) {
                for entry in entries {
                    lookup.insert(self.namespaced(&entry.server_id, &entry.original_name), entry.clone());
                }
            }
        }
        self.lookups.write().await.prompts = lookup;
    }

    async fn rebuild_resource_lookup(&self) {
        let registries = self.registries.read().await;
        let mut lookup = HashMap::new();
        for upstream in &self.upstreams {
            if let Some(entries) = registries.resources.get(&upstream.id) {
                for entry in entries {
                    let proxy_uri = resource_uri::encode(&entry.server_id, &entry.original_uri);
                    lookup.insert(proxy_uri, entry.clone());
                }
            }
        }
        self.lookups.write().await.resources = lookup;
    }

    async fn merged_tool_descriptors(&self) -> Vec<Value> {
        let registries = self.registries.read().await;
        let mut out = Vec::new();
        for upstream in &self.upstreams {
            if let Some(entries) = registries.tools.get(&upstream.id) {
                for entry in entries {
                    let mut descriptor = entry.descriptor.clone();
                    descriptor["name"] = json!(self.namespaced(&entry.server_id, &entry.original_name));
                    attach_proxy_metadata(&mut descriptor, &entry.server_id, &entry.original_name);
                    out.push(descriptor);
                }
            }
        }
        out
    }

    async fn merged_prompt_descriptors(&self) -> Vec<Value> {
        let registries = self.registries.read().await;
        let mut out = Vec::new();
        for upstream in &self.upstreams {
            if let Some(entries) = registries.prompts.get(&upstream.id) {
                for entry in entries {
                    let mut descriptor = entry.descriptor.clone();
                    descriptor["name"] = json!(self.namespaced(&entry.server_id, &entry.original_name));
                    attach_proxy_metadata(&mut descriptor, &entry.server_id, &entry.original_name);
                    out.push(descriptor);
                }
            }
        }
        out
    }

    async fn merged_resource_descriptors(&self) -> Vec<Value> {
        let registries = self.registries.read().await;
        let mut out = Vec::new();
        for upstream in &self.upstreams {
            if let Some(entries) = registries.resources.get(&upstream.id) {
                for entry in entries {
                    let mut descriptor = entry.descriptor.clone();
                    descriptor["uri"] = json!(resource_uri::encode(&entry.server_id, &entry.original_uri));
                    out.push(descriptor);
                }
            }
        }
        out
    }

    async fn merged_resource_templates(&self) -> Vec<Value> {
        let registries = self.registries.read().await;
        let mut out = Vec::new();
        for upstream in &self.upstreams {
            if let Some(items) = registries.resource_templates.get(&upstream.id) {
                out.extend(items.iter().cloned());
            }
        }
        out
    }

    async fn merged_capabilities(&self) -> Value {
        let (mut has_tools, mut has_resources, mut has_prompts, mut subscribe) = (false, false, false, false);
        for upstream in &self.upstreams {
            if !upstream.is_initialized().await {
                continue;
            }
            let caps = upstream.capabilities().await;
            if caps.get("tools").is_some() {
                has_tools = true;
            }
            if let Some(resources) = caps.get("resources") {
                has_resources = true;
                if resources.get("subscribe").and_then(Value::as_bool) == Some(true) {
                    subscribe = true;
                }
            }
            if caps.get("prompts").is_some() {
                has_prompts = true;
            }
        }

        let mut capabilities = json!({"logging": {}});
        if has_tools {
            capabilities["tools"] = json!({"listChanged": true});
        }
        if has_resources {
            capabilities["resources"] = json!({"listChanged": true, "subscribe": subscribe});
        }
        if has_prompts {
            capabilities["prompts"] = json!({"listChanged": true});
        }
        capabilities
    }

    // -- list / call handlers ----------------------------------------------

    /// A malformed cursor is a client-supplied-params problem, not an
    /// upstream transport failure, so it maps to `-32602` regardless of what
    /// `McpError` variant `cursor::decode` happens to raise internally.
    fn cursor_offset(params: &Value) -> Result<u64, RpcErr> {
        match params.get("cursor").and_then(Value::as_str) {
            Some(c) => cursor::decode(c)
                .map_err(|err| (code::INVALID_PARAMS, format!("malformed cursor: {err}"), None)),
            None => Ok(0),
        }
    }

    /// `params.limit` if present, else `PAGE_SIZE` as a sane default cap —
    /// spec.md §4.3 says "if limit is absent, use the full tail", but an
    /// unbounded merged listing is a footgun for any deployment with more
    /// than a couple of upstreams, so an absent limit falls back to
    /// `PAGE_SIZE` rather than truly unbounded.
    fn page_limit(params: &Value) -> Option<usize> {
        match params.get("limit").and_then(Value::as_u64) {
            Some(limit) => Some(limit as usize),
            None => Some(PAGE_SIZE),
        }
    }

    async fn handle_tools_list(self: &Arc<Self>, params: Value) -> Result<Value, RpcErr> {
        self.refresh_tools_listing().await;
        let offset = Self::cursor_offset(&params)?;
        let all = self.merged_tool_descriptors().await;
        let (page, next_cursor) = cursor::paginate(&all, offset, Self::page_limit(&params));
        let mut result = json!({"tools": page});
        if let Some(next) = next_cursor {
            result["nextCursor"] = json!(next);
        }
        Ok(result)
    }

    async fn handle_prompts_list(self: &Arc<Self>, params: Value) -> Result<Value, RpcErr> {
        self.refresh_prompts_listing().await;
        let offset = Self::cursor_offset(&params)?;
        let all = self.merged_prompt_descriptors().await;
        let (page, next_cursor) = cursor::paginate(&all, offset, Self::page_limit(&params));
        let mut result = json!({"prompts": page});
        if let Some(next) = next_cursor {
            result["nextCursor"] = json!(next);
        }
        Ok(result)
    }

    async fn handle_resources_list(self: &Arc<Self>, params: Value) -> Result<Value, RpcErr> {
        self.refresh_resources_listing().await;
        let offset = Self::cursor_offset(&params)?;
        let all = self.merged_resource_descriptors().await;
        let (page, next_cursor) = cursor::paginate(&all, offset, Self::page_limit(&params));
        let mut result = json!({"resources": page});
        if let Some(next) = next_cursor {
            result["nextCursor"] = json!(next);
        }
        Ok(result)
    }

    async fn handle_resource_templates_list(self: &Arc<Self>, params: Value) -> Result<Value, RpcErr> {
        self.refresh_resource_templates_listing().await;
        let offset = Self::cursor_offset(&params)?;
        let all = self.merged_resource_templates().await;
        let (page, next_cursor) = cursor::paginate(&all, offset, Self::page_limit(&params));
        let mut result = json!({"resourceTemplates": page});
        if let Some(next) = next_cursor {
            result["nextCursor"] = json!(next);
        }
        Ok(result)
    }

    async fn handle_tools_call(&self, params: Value) -> Result<Value, RpcErr> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| (code::INVALID_PARAMS, "missing tool name".to_string(), None))?;

        let entry = self
            .lookups
            .read()
            .await
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| (code::INVALID_PARAMS, format!("Unknown tool `{name}`"), None))?;

        let upstream = self
            .upstream_by_id(&entry.server_id)
            .ok_or_else(|| (code::INTERNAL_ERROR, format!("upstream `{}` is gone", entry.server_id), None))?;

        let mut forwarded = params;
        forwarded["name"] = json!(entry.original_name);
        upstream.request("tools/call", forwarded).await.map_err(rpc_error_from)
    }

    async fn handle_prompts_get(&self, params: Value) -> Result<Value, RpcErr> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| (code::INVALID_PARAMS, "missing prompt name".to_string(), None))?;

        let entry = self
            .lookups
            .read()
            .await
            .prompts
            .get(name)
            .cloned()
            .ok_or_else(|| (code::INVALID_PARAMS, format!("Unknown prompt `{name}`"), None))?;

        let upstream = self
            .upstream_by_id(&entry.server_id)
            .ok_or_else(|| (code::INTERNAL_ERROR, format!("upstream `{}` is gone", entry.server_id), None))?;

        let mut forwarded = params;
        forwarded["name"] = json!(entry.original_name);
        upstream.request("prompts/get", forwarded).await.map_err(rpc_error_from)
    }

    /// Decode `params.uri` as a proxy-issued `proxy://resource/` URI; if that
    /// fails, fall back to a registry lookup by the URI as given, so a
    /// client that echoes back an un-decodable but still-registered URI
    /// isn't rejected outright.
    async fn handle_resources_read(&self, params: Value) -> Result<Value, RpcErr> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| (code::INVALID_PARAMS, "missing uri".to_string(), None))?;

        let (server_id, original_uri) = match resource_uri::decode(uri) {
            Ok(decoded) => decoded,
            Err(_) => {
                let entry = self
                    .lookups
                    .read()
                    .await
                    .resources
                    .get(uri)
                    .cloned()
                    .ok_or_else(|| (code::INVALID_PARAMS, format!("Unknown resource `{uri}`"), None))?;
                (entry.server_id, entry.original_uri)
            }
        };
        let upstream = self
            .upstream_by_id(&server_id)
            .ok_or_else(|| (code::INTERNAL_ERROR, format!("upstream `{server_id}` is gone"), None))?;

        let mut forwarded = params;
        forwarded["uri"] = json!(original_uri);
        upstream.request("resources/read", forwarded).await.map_err(rpc_error_from)
    }

    /// Broadcasts the new level to every initialized upstream and records
    /// it for the proxy's own logging. Live-reloading the process-wide
    /// `tracing` filter is left for a future pass; see DESIGN.md.
    async fn handle_logging_set_level(&self, params: Value) -> Result<Value, RpcErr> {
        let level = params
            .get("level")
            .and_then(Value::as_str)
            .ok_or_else(|| (code::INVALID_PARAMS, "missing level".to_string(), None))?;

        tracing::info!(level, "logging level change requested");
        for upstream in &self.upstreams {
            if upstream.is_initialized().await {
                if let Err(err) = upstream.request("logging/setLevel", params.clone()).await {
                    tracing::debug!(server_id = %upstream.id, error = %err, "upstream rejected logging/setLevel");
                }
            }
        }
        Ok(json!({}))
    }
}

/// Attach `metadata.proxy = {serverId, originalName}` to a merged
/// tool/prompt/resource descriptor (spec.md §3's `ToolEntry`/`PromptEntry`
/// data model), creating `metadata` if the upstream's own descriptor didn't
/// have one. Non-object descriptors are left untouched since there is
/// nowhere to attach metadata.
fn attach_proxy_metadata(descriptor: &mut Value, server_id: &str, original_name: &str) {
    if !descriptor.is_object() {
        return;
    }
    descriptor["metadata"]["proxy"] = json!({
        "serverId": server_id,
        "originalName": original_name,
    });
}

/// Set `params.proxy.server = server_id`, creating `params.proxy` if absent,
/// so a client handling an upstream-originated request or notification can
/// tell which upstream it came from. Non-object params (or missing params)
/// become `{"proxy": {"server": ...}}`.
fn inject_proxy_server(params: Value, server_id: &str) -> Value {
    let mut params = if params.is_object() { params } else { json!({}) };
    params["proxy"]["server"] = json!(server_id);
    params
}

fn rpc_error_from(err: McpError) -> RpcErr {
    let (code, message) = err.as_rpc_error();
    let data = err.data();
    (code, message, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DurationSecs, ServerConfig, StdioModeConfig};
    use crate::frame::StdioMode;
    use std::io::Cursor;

    fn server(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            command: vec!["true".to_string()],
            env: Default::default(),
            startup_timeout: DurationSecs(Duration::from_secs(5)),
            shutdown_grace: DurationSecs(Duration::from_secs(1)),
            stdio_mode: StdioModeConfig::Newline,
        }
    }

    fn test_router() -> Arc<Router<Cursor<Vec<u8>>, Vec<u8>>> {
        let config = ProxyConfig {
            log_level: "INFO".to_string(),
            response_timeout: DurationSecs(Duration::from_secs(5)),
            auth_token: None,
            rate_limit_per_minute: None,
            structured_logging: false,
            healthcheck_interval: 0,
            healthcheck_timeout: DurationSecs(Duration::from_secs(5)),
            id_separator: "::".to_string(),
            stdio_mode: StdioModeConfig::Newline,
            servers: vec![server("alpha"), server("beta")],
        };
        let frame = Arc::new(FrameStream::new(Cursor::new(Vec::new()), Vec::new(), StdioMode::Newline));
        Router::new(config, frame)
    }

    #[tokio::test]
    async fn merges_tools_in_registration_order_with_namespaced_names() {
        let router = test_router();
        router
            .replace_tools("alpha", vec![json!({"name": "search", "description": "d"})])
            .await;
        router
            .replace_tools("beta", vec![json!({"name": "search", "description": "d2"})])
            .await;

        let merged = router.merged_tool_descriptors().await;
        let names: Vec<_> = merged.iter().map(|v| v["name"].as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["alpha::search", "beta::search"]);
        assert_eq!(merged[0]["metadata"]["proxy"]["serverId"], "alpha");
        assert_eq!(merged[0]["metadata"]["proxy"]["originalName"], "search");
    }

    #[tokio::test]
    async fn tool_lookup_resolves_namespaced_call() {
        let router = test_router();
        router.replace_tools("alpha", vec![json!({"name": "search"})]).await;

        let entry = router.lookups.read().await.tools.get("alpha::search").cloned();
        assert!(entry.is_some());
        assert_eq!(entry.unwrap().original_name, "search");
    }

    #[tokio::test]
    async fn unknown_tool_call_is_invalid_params() {
        let router = test_router();
        let err = router.handle_tools_call(json!({"name": "nope"})).await.unwrap_err();
        assert_eq!(err.0, code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn resource_listing_round_trips_through_proxy_uri() {
        let router = test_router();
        router
            .replace_resources("alpha", vec![json!({"uri": "file:///etc/hosts", "name": "hosts"})])
            .await;

        let merged = router.merged_resource_descriptors().await;
        let proxy_uri = merged[0]["uri"].as_str().unwrap();
        assert!(proxy_uri.starts_with(resource_uri::SCHEME_PREFIX));

        let entry = router.lookups.read().await.resources.get(proxy_uri).cloned();
        assert_eq!(entry.unwrap().original_uri, "file:///etc/hosts");
    }

    #[tokio::test]
    async fn pagination_splits_merged_listing_across_pages() {
        let router = test_router();
        let items: Vec<Value> = (0..PAGE_SIZE + 5)
            .map(|i| json!({"name": format!("tool{i}")}))
            .collect();
        router.replace_tools("alpha", items).await;

        let first = router.handle_tools_list(json!({})).await.unwrap();
        assert_eq!(first["tools"].as_array().unwrap().len(), PAGE_SIZE);
        let next_cursor = first["nextCursor"].as_str().unwrap().to_string();

        let second = router.handle_tools_list(json!({"cursor": next_cursor})).await.unwrap();
        assert_eq!(second["tools"].as_array().unwrap().len(), 5);
        assert!(second.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn client_supplied_limit_is_honored() {
        let router = test_router();
        router
            .replace_tools("alpha", vec![json!({"name": "t1"}), json!({"name": "t2"})])
            .await;
        router.replace_tools("beta", vec![json!({"name": "t3"})]).await;

        let first = router.handle_tools_list(json!({"limit": 2})).await.unwrap();
        let names: Vec<_> = first["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["alpha::t1", "alpha::t2"]);
        let next_cursor = first["nextCursor"].as_str().unwrap().to_string();

        let second = router
            .handle_tools_list(json!({"cursor": next_cursor}))
            .await
            .unwrap();
        let names: Vec<_> = second["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["beta::t3"]);
        assert!(second.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn unauthorized_request_is_rejected_when_token_configured() {
        let config = ProxyConfig {
            log_level: "INFO".to_string(),
            response_timeout: DurationSecs(Duration::from_secs(5)),
            auth_token: Some("secret".to_string()),
            rate_limit_per_minute: None,
            structured_logging: false,
            healthcheck_interval: 0,
            healthcheck_timeout: DurationSecs(Duration::from_secs(5)),
            id_separator: "::".to_string(),
            stdio_mode: StdioModeConfig::Newline,
            servers: vec![],
        };
        let frame = Arc::new(FrameStream::new(Cursor::new(Vec::new()), Vec::new(), StdioMode::Newline));
        let router = Router::new(config, frame);

        assert!(router.authorize(&json!({})).await.is_err());
        assert!(router
            .authorize(&json!({"proxy": {"authToken": "secret"}}))
            .await
            .is_ok());
    }
}
