//! ShellTool sub-agent: runs `ripgrep` against the local filesystem. The
//! only external command this crate ever invokes, and only `rg` — there is
//! no general shell-execution surface.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::time::timeout;

use super::{error_map, SubAgent, DEFAULT_SHELL_TIMEOUT};

/// Whether the `rg` binary is reachable on `PATH`.
async fn rg_available() -> bool {
    Command::new("rg")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// `ShellTool`: searches `path` for `pattern` via ripgrep, allow-listed to
/// that single binary and invocation shape.
pub struct ShellToolAgent;

#[async_trait]
impl SubAgent for ShellToolAgent {
    fn name(&self) -> &'static str {
        "ShellTool"
    }

    fn timeout(&self) -> std::time::Duration {
        DEFAULT_SHELL_TIMEOUT
    }

    async fn execute(&self, _session_id: &str, payload: &Map<String, Value>) -> Map<String, Value> {
        let pattern = payload
            .get("pattern")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if pattern.is_empty() {
            return error_map("ShellTool requires pattern");
        }
        let path = payload
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(".");
        let max_count = payload.get("max").and_then(Value::as_u64).unwrap_or(200);

        if !rg_available().await {
            return error_map("ripgrep (rg) is not available on PATH");
        }

        let run = Command::new("rg")
            .args(["-n", "--no-heading", "-S", "-m", &max_count.to_string(), pattern, path])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match timeout(DEFAULT_SHELL_TIMEOUT, run).await {
            Ok(Ok(output)) => {
                let mut map = Map::new();
                map.insert(
                    "exit_code".to_string(),
                    Value::from(output.status.code().unwrap_or(-1)),
                );
                map.insert(
                    "output".to_string(),
                    Value::String(String::from_utf8_lossy(&output.stdout).to_string()),
                );
                if !output.stderr.is_empty() {
                    map.insert(
                        "stderr".to_string(),
                        Value::String(String::from_utf8_lossy(&output.stderr).to_string()),
                    );
                }
                map
            }
            Ok(Err(e)) => error_map(e.to_string()),
            Err(_) => error_map("ShellTool timed out"),
        }
    }
}
