//! Gateway configuration materialization for clawboot.
//!
//! The gateway's JSON configuration is treated as a document passed by value
//! through a pipeline of pure transforms and persisted exactly once, owner
//! read/write only. The same crate reconciles the MCP tool registry across
//! its legacy state-side and canonical workspace-side locations.
//!
//! Best-effort steps (stale-entry clean, template merge, plugin install)
//! report a [`StepOutcome`] instead of propagating; fatal failures are
//! reserved for the generator itself and the final persist.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use boot_env::{Env, StatePaths, StepOutcome, openclaw_bin, truthy};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registry name of the browser-automation plugin.
pub const BROWSER_PLUGIN: &str = "browser-relay";

/// Upper bound on the external plugin install. The only operation in the
/// whole startup sequence with an explicit timeout; everything else either
/// finishes or the orchestrator restarts the container.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);

// ─────────────────────────────────────────────────────────────
// Browser plugin settings
// ─────────────────────────────────────────────────────────────

/// Env-derived settings for the optional browser-automation plugin.
#[derive(Debug, Clone)]
pub struct BrowserPlugin {
    /// Activation URL (CDP endpoint). Presence of this is the on switch.
    pub cdp_url: String,
    pub cdp_port: Option<u16>,
    pub autostart: Option<bool>,
}

impl BrowserPlugin {
    pub fn from_env(env: &Env) -> Option<Self> {
        let cdp_url = env.get("OPENCLAW_BROWSER_CDP_URL")?.to_string();
        Some(Self {
            cdp_url,
            cdp_port: env
                .get("OPENCLAW_BROWSER_CDP_PORT")
                .and_then(|p| p.parse().ok()),
            autostart: env.get("OPENCLAW_BROWSER_AUTOSTART").map(truthy),
        })
    }

    /// Where the plugin's extension lands once installed.
    pub fn extension_dir(&self, paths: &StatePaths) -> PathBuf {
        paths.state_dir.join("extensions").join(BROWSER_PLUGIN)
    }
}

// ─────────────────────────────────────────────────────────────
// Pure document transforms
// ─────────────────────────────────────────────────────────────

fn as_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = json!({});
    }
    value.as_object_mut().expect("just ensured object")
}

fn ensure_object<'a>(parent: &'a mut Value, key: &str) -> &'a mut Map<String, Value> {
    let child = as_object(parent)
        .entry(key.to_string())
        .or_insert_with(|| json!({}));
    as_object(child)
}

/// Remove a plugin's entries from `plugins.entries` and `plugins.installs`.
/// Everything else is left untouched.
pub fn strip_plugin(mut doc: Value, name: &str) -> Value {
    if let Some(plugins) = doc.get_mut("plugins") {
        for section in ["entries", "installs"] {
            if let Some(map) = plugins.get_mut(section).and_then(Value::as_object_mut) {
                map.remove(name);
            }
        }
    }
    doc
}

/// Patch a plugin to enabled, copying connection settings from the
/// environment when present. Existing config keys for the plugin survive.
///
/// This writes the document directly instead of shelling out to the
/// gateway's own `plugins enable` command, which hangs in constrained
/// containers.
pub fn enable_plugin(mut doc: Value, name: &str, plugin: &BrowserPlugin) -> Value {
    let plugins = ensure_object(&mut doc, "plugins");
    let entries = plugins.entry("entries".to_string()).or_insert_with(|| json!({}));
    let entry = ensure_object(entries, name);
    entry.insert("enabled".to_string(), json!(true));

    let config = as_object(entry.entry("config".to_string()).or_insert_with(|| json!({})));
    config.insert("cdpUrl".to_string(), json!(plugin.cdp_url));
    if let Some(port) = plugin.cdp_port {
        config.insert("cdpPort".to_string(), json!(port));
    }
    if let Some(autostart) = plugin.autostart {
        config.insert("autostart".to_string(), json!(autostart));
    }
    doc
}

/// Merge template MCP server entries into a destination registry, adding
/// only names absent from the destination. Existing user entries are never
/// overwritten.
pub fn merge_registry(mut dest: Value, template: Value) -> Value {
    let Some(incoming) = template.get("mcpServers").and_then(Value::as_object) else {
        return dest;
    };
    let servers = ensure_object(&mut dest, "mcpServers");
    for (name, config) in incoming {
        if !servers.contains_key(name) {
            servers.insert(name.clone(), config.clone());
        }
    }
    dest
}

// ─────────────────────────────────────────────────────────────
// Private file writes
// ─────────────────────────────────────────────────────────────

/// Write a file readable/writable only by the owning user, creating parent
/// directories as needed. Every generated secret-bearing file goes through
/// here.
pub fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn write_json_private(path: &Path, doc: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(doc)?;
    write_private(path, rendered.as_bytes())
        .with_context(|| format!("writing {}", path.display()))
}

// ─────────────────────────────────────────────────────────────
// Stale plugin pre-clean
// ─────────────────────────────────────────────────────────────

/// Drop a prior config's references to a plugin that is not installed on
/// disk. Fires only when the plugin is configured via environment, its
/// extension directory is absent, and a prior config file exists; otherwise
/// the file is left untouched. Read-modify-write, best-effort.
pub fn clean_stale_plugin(paths: &StatePaths, env: &Env) -> StepOutcome {
    let Some(plugin) = BrowserPlugin::from_env(env) else {
        return StepOutcome::skipped("browser plugin not configured");
    };
    if plugin.extension_dir(paths).is_dir() {
        return StepOutcome::skipped("extension directory present");
    }
    let config_path = paths.gateway_config();
    if !config_path.is_file() {
        return StepOutcome::skipped("no prior config file");
    }

    let prior = match std::fs::read_to_string(&config_path) {
        Ok(data) => data,
        Err(e) => return StepOutcome::failed(format!("read {}: {e}", config_path.display())),
    };
    let doc: Value = match serde_json::from_str(&prior) {
        Ok(doc) => doc,
        // Corrupt JSON: leave the old file untouched and move on.
        Err(e) => return StepOutcome::failed(format!("parse {}: {e}", config_path.display())),
    };

    let cleaned = strip_plugin(doc, BROWSER_PLUGIN);
    match write_json_private(&config_path, &cleaned) {
        Ok(()) => {
            debug!(path = %config_path.display(), plugin = BROWSER_PLUGIN, "stripped stale plugin entries");
            StepOutcome::Applied
        }
        Err(e) => StepOutcome::failed(e.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────
// Config generator seam
// ─────────────────────────────────────────────────────────────

/// The external collaborator that derives the full gateway configuration
/// document from environment variables. Opaque by contract; clawboot only
/// sequences it.
#[async_trait]
pub trait ConfigGenerator: Send + Sync {
    async fn generate(&self, env: &Env) -> Result<Value>;
}

/// Production generator: run a command with the resolved environment and
/// parse its stdout as the configuration document.
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn from_env(env: &Env) -> Self {
        Self {
            program: openclaw_bin(env),
            args: ["config", "generate", "--json"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[async_trait]
impl ConfigGenerator for CommandGenerator {
    async fn generate(&self, env: &Env) -> Result<Value> {
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .envs(env.iter())
            .output()
            .await
            .with_context(|| format!("spawning config generator '{}'", self.program))?;

        if !output.status.success() {
            bail!(
                "config generator exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("config generator produced invalid JSON")
    }
}

/// Closure-backed generator for tests and dry runs.
pub struct StaticGenerator(pub Value);

#[async_trait]
impl ConfigGenerator for StaticGenerator {
    async fn generate(&self, _env: &Env) -> Result<Value> {
        Ok(self.0.clone())
    }
}

// ─────────────────────────────────────────────────────────────
// Materialization pipeline
// ─────────────────────────────────────────────────────────────

/// Materialize the gateway configuration: best-effort stale clean, generate,
/// apply the enable transform, persist once with owner-only permissions.
/// Returns the final document so the proxy renderer can read hook settings
/// without a second parse.
///
/// The enable patch lands before [`install_browser_plugin`] runs: the patch
/// is a document transform and the install a disk side effect, and the
/// document persists exactly once after all transforms. The install step
/// never edits the document, so the result is the same either way.
pub async fn materialize(
    paths: &StatePaths,
    env: &Env,
    generator: &dyn ConfigGenerator,
) -> Result<Value> {
    clean_stale_plugin(paths, env).log("stale-plugin-clean");

    let mut doc = generator
        .generate(env)
        .await
        .context("deriving gateway configuration")?;

    if let Some(plugin) = BrowserPlugin::from_env(env) {
        doc = enable_plugin(doc, BROWSER_PLUGIN, &plugin);
    }

    let config_path = paths.gateway_config();
    write_json_private(&config_path, &doc)?;
    info!(path = %config_path.display(), "gateway configuration written");
    Ok(doc)
}

/// Install the browser-automation plugin when configured and absent.
/// Bounded by [`INSTALL_TIMEOUT`]; timeout or failure is abandoned, not
/// fatal — the gateway's own doctor step surfaces the problem later.
pub async fn install_browser_plugin(paths: &StatePaths, env: &Env) -> StepOutcome {
    let Some(plugin) = BrowserPlugin::from_env(env) else {
        return StepOutcome::skipped("browser plugin not configured");
    };
    if plugin.extension_dir(paths).is_dir() {
        return StepOutcome::skipped("already installed");
    }

    let program = openclaw_bin(env);
    info!(plugin = BROWSER_PLUGIN, url = %plugin.cdp_url, "installing browser plugin");
    let run = tokio::process::Command::new(&program)
        .args(["plugins", "install", BROWSER_PLUGIN])
        .envs(env.iter())
        .output();

    match tokio::time::timeout(INSTALL_TIMEOUT, run).await {
        Err(_) => StepOutcome::failed(format!(
            "install timed out after {}s",
            INSTALL_TIMEOUT.as_secs()
        )),
        Ok(Err(e)) => StepOutcome::failed(format!("spawning '{program}': {e}")),
        Ok(Ok(output)) if !output.status.success() => StepOutcome::failed(format!(
            "install exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Ok(Ok(_)) => StepOutcome::Applied,
    }
}

// ─────────────────────────────────────────────────────────────
// MCP registry reconciliation
// ─────────────────────────────────────────────────────────────

/// Reconcile the MCP registry's two candidate locations to one canonical
/// file. Order matters:
///
/// 1. neither exists + a template ships with the image → seed workspace
///    from template;
/// 2. legacy state file exists, workspace doesn't → migrate forward, then
///    merge as in 3 (the template may have gained entries since the legacy
///    file was written);
/// 3. template + workspace both exist → merge, adding only absent server
///    names (best-effort: parse or I/O failure is logged and swallowed);
/// 4. unconditionally replace the state path with a symlink to the
///    workspace file, removing a regular file there first.
///
/// Afterwards exactly one regular file exists, readable from both paths.
pub fn reconcile_mcp_registry(paths: &StatePaths, template: &Path) -> Result<StepOutcome> {
    let workspace = paths.mcp_workspace();
    let state = paths.mcp_state();

    let state_meta = std::fs::symlink_metadata(&state).ok();
    let state_is_file = state_meta.as_ref().is_some_and(|m| m.is_file());

    if !workspace.exists() {
        if state_is_file {
            let data = std::fs::read(&state)
                .with_context(|| format!("reading legacy registry {}", state.display()))?;
            write_private(&workspace, &data)
                .with_context(|| format!("migrating registry to {}", workspace.display()))?;
            info!(from = %state.display(), to = %workspace.display(), "migrated MCP registry to workspace");
            if template.is_file() {
                merge_template_into(&workspace, template).log("mcp-template-merge");
            }
        } else if template.is_file() {
            let data = std::fs::read(template)
                .with_context(|| format!("reading template {}", template.display()))?;
            write_private(&workspace, &data)
                .with_context(|| format!("seeding registry {}", workspace.display()))?;
            info!(template = %template.display(), "seeded MCP registry from template");
        }
    } else if template.is_file() {
        merge_template_into(&workspace, template).log("mcp-template-merge");
    }

    // Exactly one writable file, reachable from both paths.
    if workspace.is_file() {
        if state_meta.is_some() {
            std::fs::remove_file(&state)
                .with_context(|| format!("removing {}", state.display()))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&workspace, &state)
            .with_context(|| format!("linking {} -> {}", state.display(), workspace.display()))?;
        debug!(state = %state.display(), workspace = %workspace.display(), "registry locations linked");
        Ok(StepOutcome::Applied)
    } else {
        Ok(StepOutcome::skipped("no registry file and no template"))
    }
}

fn merge_template_into(workspace: &Path, template: &Path) -> StepOutcome {
    let dest: Value = match std::fs::read_to_string(workspace)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(doc) => doc,
        Err(e) => return StepOutcome::failed(format!("parse {}: {e}", workspace.display())),
    };
    let tpl: Value = match std::fs::read_to_string(template)
        .map_err(|e| e.to_string())
        .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
    {
        Ok(doc) => doc,
        Err(e) => return StepOutcome::failed(format!("parse {}: {e}", template.display())),
    };

    let merged = merge_registry(dest, tpl);
    match write_json_private(workspace, &merged) {
        Ok(()) => StepOutcome::Applied,
        Err(e) => {
            warn!(error = %e, "failed to write merged registry");
            StepOutcome::failed(e.to_string())
        }
    }
}

/// Template location shipped with the image.
pub fn mcp_template_path(env: &Env) -> PathBuf {
    env.get("OPENCLAW_MCP_TEMPLATE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/opt/openclaw/mcp.template.json"))
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────
