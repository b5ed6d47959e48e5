//! Shared integration-test scaffolding, in the style of
//! `crates/codex/src/mcp/test_support.rs::write_fake_mcp_server`: write a
//! small python script to a temp dir, chmod it executable, and point a
//! `ServerConfig` at it.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use mcp_proxy::config::{DurationSecs, ServerConfig, StdioModeConfig};

/// A newline-delimited-JSON fake upstream that answers `initialize`,
/// `tools/list` (one tool named `name`, echoing its arguments back) and
/// `shutdown`, then exits.
pub fn write_fake_upstream(tool_name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-upstream.py");
    let script = format!(
        r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "initialize":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{
            "protocolVersion": "2024-11-05",
            "capabilities": {{"tools": {{"listChanged": True}}}},
            "serverInfo": {{"name": "fake-upstream", "version": "0.0.0"}},
        }}}})
    elif method == "notifications/initialized":
        pass
    elif method == "tools/list":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{
            "tools": [{{"name": "{tool_name}", "description": "echoes its input"}}],
        }}}})
    elif method == "resources/list":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{"resources": []}}}})
    elif method == "prompts/list":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{"prompts": []}}}})
    elif method == "resources/templates/list":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{"resourceTemplates": []}}}})
    elif method == "tools/call":
        params = msg.get("params", {{}})
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{
            "content": [{{"type": "text", "text": json.dumps(params.get("arguments", {{}}))}}],
        }}}})
    elif method == "ping":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{}}}})
    elif method == "shutdown":
        send({{"jsonrpc": "2.0", "id": msg.get("id"), "result": {{}}}})
        break
    elif method == "exit":
        break
"#,
        tool_name = tool_name
    );

    fs::write(&script_path, script).expect("write fake upstream script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// A fake upstream that, once initialized, immediately sends the client a
/// `roots/list` request (id=7) and waits for the matching response before
/// replying to `shutdown` — exercises the upstream-originated request path.
pub fn write_fake_upstream_with_roots_request() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-upstream-roots.py");
    let script = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": True}},
            "serverInfo": {"name": "fake-upstream", "version": "0.0.0"},
        }})
    elif method == "notifications/initialized":
        send({"jsonrpc": "2.0", "id": 7, "method": "roots/list", "params": {}})
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"tools": []}})
    elif method == "resources/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"resources": []}})
    elif method == "prompts/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"prompts": []}})
    elif method == "resources/templates/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"resourceTemplates": []}})
    elif method == "ping":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
    elif "result" in msg or "error" in msg:
        pass  # response to our roots/list request
    elif method == "shutdown":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
        break
    elif method == "exit":
        break
"#;

    fs::write(&script_path, script).expect("write fake upstream script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// A fake upstream that advertises one resource (`file:///etc/hosts`) and
/// echoes back whatever `uri` it's asked to read — exercises the resource
/// URI codec round trip.
pub fn write_fake_resource_upstream() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-upstream-resource.py");
    let script = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"resources": {"subscribe": False}},
            "serverInfo": {"name": "fake-upstream", "version": "0.0.0"},
        }})
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"tools": []}})
    elif method == "resources/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
            "resources": [{"uri": "file:///etc/hosts", "name": "hosts"}],
        }})
    elif method == "prompts/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"prompts": []}})
    elif method == "resources/templates/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"resourceTemplates": []}})
    elif method == "resources/read":
        params = msg.get("params", {})
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
            "contents": [{"uri": params.get("uri"), "text": "127.0.0.1 localhost"}],
        }})
    elif method == "ping":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
    elif method == "shutdown":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
        break
    elif method == "exit":
        break
"#;

    fs::write(&script_path, script).expect("write fake upstream script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

/// A fake upstream that answers its first `ping` normally, then exits
/// without a response on the second `ping` (simulating a crash once the
/// health loop has already seen one success) — exercises restart-on-failed-
/// healthcheck.
pub fn write_fake_flaky_upstream() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("fake-upstream-flaky.py");
    let script = r#"#!/usr/bin/env python3
import json
import sys

def send(payload):
    sys.stdout.write(json.dumps(payload) + "\n")
    sys.stdout.flush()

pings = 0
for line in sys.stdin:
    if not line.strip():
        continue
    msg = json.loads(line)
    method = msg.get("method")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": True}},
            "serverInfo": {"name": "fake-upstream", "version": "0.0.0"},
        }})
    elif method == "tools/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {
            "tools": [{"name": "search"}],
        }})
    elif method == "resources/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"resources": []}})
    elif method == "prompts/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"prompts": []}})
    elif method == "resources/templates/list":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {"resourceTemplates": []}})
    elif method == "ping":
        pings += 1
        if pings >= 2:
            sys.exit(1)
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
    elif method == "shutdown":
        send({"jsonrpc": "2.0", "id": msg.get("id"), "result": {}})
        break
    elif method == "exit":
        break
"#;

    fs::write(&script_path, script).expect("write fake upstream script");
    let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).expect("chmod");
    (dir, script_path)
}

pub fn server_config(id: &str, script: &PathBuf) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        command: vec!["python3".to_string(), script.display().to_string()],
        env: Default::default(),
        startup_timeout: DurationSecs(Duration::from_secs(10)),
        shutdown_grace: DurationSecs(Duration::from_secs(2)),
        stdio_mode: StdioModeConfig::Newline,
    }
}
