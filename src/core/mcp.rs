use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

/// Launcher for the Notion MCP server, merged into the assistant's per-user
/// config so spawned children can reach Notion without extra flags.
const NOTION_SERVER_KEY: &str = "notion";
const NOTION_COMMAND: &str = "npx";
const NOTION_ARGS: &[&str] = &["-y", "@notionhq/notion-mcp-server"];
const TOKEN_VAR: &str = "NOTION_TOKEN";

/// One-shot writer that merges an `mcpServers.notion` entry into the
/// assistant's per-user JSON config before any child is spawned.
///
/// Idempotent: an existing identical entry causes no write at all, so a
/// second run leaves the file byte-identical.
pub struct McpInjector {
    config_path: PathBuf,
}

impl McpInjector {
    /// Injector for the current user's assistant config (`~/.claude.json`).
    pub fn for_current_user() -> Option<Self> {
        dirs::home_dir().map(|home| Self {
            config_path: home.join(".claude.json"),
        })
    }

    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Merge the Notion entry. Returns `true` if the file was written.
    pub fn inject_notion(&self, token: &str) -> Result<bool> {
        let mut root = self.read_config()?;

        let desired = json!({
            "command": NOTION_COMMAND,
            "args": NOTION_ARGS,
            "env": { TOKEN_VAR: token },
        });

        let servers = root
            .as_object_mut()
            .context("assistant config root is not a JSON object")?
            .entry("mcpServers")
            .or_insert_with(|| json!({}));
        let servers = servers
            .as_object_mut()
            .context("mcpServers is not a JSON object")?;

        if servers.get(NOTION_SERVER_KEY) == Some(&desired) {
            return Ok(false);
        }
        servers.insert(NOTION_SERVER_KEY.to_string(), desired);

        self.write_atomic(&root)?;
        info!(
            "injected {} MCP server into {}",
            NOTION_SERVER_KEY,
            self.config_path.display()
        );
        Ok(true)
    }

    fn read_config(&self) -> Result<Value> {
        if !self.config_path.exists() {
            return Ok(json!({}));
        }
        let raw = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("reading {}", self.config_path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.config_path.display()))
    }

    /// Write-temp-then-rename so a crash mid-write never corrupts the file.
    fn write_atomic(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.config_path.with_extension("json.tmp");
        let rendered = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, rendered.as_bytes())
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.config_path)
            .with_context(|| format!("renaming into {}", self.config_path.display()))?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_config_with_required_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let injector = McpInjector::with_path(tmp.path().join("claude.json"));

        assert!(injector.inject_notion("secret-token").unwrap());

        let raw = std::fs::read_to_string(injector.config_path()).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        let entry = &parsed["mcpServers"]["notion"];
        assert_eq!(entry["command"], "npx");
        assert_eq!(entry["env"]["NOTION_TOKEN"], "secret-token");
    }

    #[test]
    fn second_run_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let injector = McpInjector::with_path(tmp.path().join("claude.json"));

        assert!(injector.inject_notion("tok").unwrap());
        let first = std::fs::read(injector.config_path()).unwrap();

        assert!(!injector.inject_notion("tok").unwrap());
        let second = std::fs::read(injector.config_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn preserves_unrelated_config_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("claude.json");
        std::fs::write(
            &path,
            r#"{"theme":"dark","mcpServers":{"other":{"command":"run"}}}"#,
        )
        .unwrap();

        let injector = McpInjector::with_path(&path);
        injector.inject_notion("tok").unwrap();

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["theme"], "dark");
        assert_eq!(parsed["mcpServers"]["other"]["command"], "run");
        assert_eq!(parsed["mcpServers"]["notion"]["command"], "npx");
    }

    #[test]
    fn token_change_rewrites_the_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let injector = McpInjector::with_path(tmp.path().join("claude.json"));

        assert!(injector.inject_notion("old").unwrap());
        assert!(injector.inject_notion("new").unwrap());

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(injector.config_path()).unwrap())
                .unwrap();
        assert_eq!(parsed["mcpServers"]["notion"]["env"]["NOTION_TOKEN"], "new");
    }
}
