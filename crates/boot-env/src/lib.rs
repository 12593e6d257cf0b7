//! Environment handling for the clawboot startup sequence.
//!
//! Provides [`Env`], an owned snapshot of the process environment that the
//! rest of the startup pipeline reads from, plus alias normalization for
//! platform-injected variable names and the hard preconditions that must
//! hold before the gateway is allowed to start.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

// ─────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────

/// Startup precondition failures. All of these abort the boot.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    /// The gateway bearer token is not set.
    #[error("OPENCLAW_GATEWAY_TOKEN is not set; the gateway cannot authenticate clients")]
    MissingGatewayToken,
    /// No AI provider credential is reachable in any supported form.
    #[error(
        "no AI provider credential found: set one of {provider_keys}, \
         the AWS key pair, or OLLAMA_BASE_URL",
        provider_keys = PROVIDER_KEY_VARS.join(", ")
    )]
    NoProviderCredential,
}

// ─────────────────────────────────────────────────────────────
// Step outcomes
// ─────────────────────────────────────────────────────────────

/// Result of a best-effort startup step.
///
/// The startup sequence distinguishes exactly two severities: fatal errors
/// propagate as `Result::Err` and abort the boot; everything else lands
/// here and is logged uniformly, never silently discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step ran and changed something.
    Applied,
    /// The step's trigger conditions were not met.
    Skipped(String),
    /// The step failed; startup continues regardless.
    Failed(String),
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Emit the single uniform log line for this step.
    pub fn log(&self, step: &str) {
        match self {
            Self::Applied => tracing::info!(step, "applied"),
            Self::Skipped(reason) => tracing::debug!(step, reason, "skipped"),
            Self::Failed(reason) => tracing::warn!(step, reason, "failed (non-fatal)"),
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Env snapshot
// ─────────────────────────────────────────────────────────────

/// Platform alias → canonical variable name.
///
/// The PaaS injects generated credentials under its own `SERVICE_*` naming
/// scheme; the rest of the system only ever reads the canonical names.
const ALIASES: &[(&str, &str)] = &[
    ("SERVICE_PASSWORD_OPENCLAW", "OPENCLAW_GATEWAY_TOKEN"),
    ("SERVICE_USER_OPENCLAW", "OPENCLAW_BASIC_AUTH_USER"),
    ("SERVICE_PASSWORD_BASICAUTH", "OPENCLAW_BASIC_AUTH_PASS"),
    ("SERVICE_FQDN_OPENCLAW", "OPENCLAW_PUBLIC_URL"),
];

/// Single-key provider credentials. Any one of these satisfies the
/// provider precondition on its own.
pub const PROVIDER_KEY_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "OPENROUTER_API_KEY",
    "GEMINI_API_KEY",
    "GROQ_API_KEY",
];

/// An owned snapshot of the process environment.
///
/// Taken once at the top of `start` and passed by reference through the
/// pipeline, so every step sees the same resolved view and tests can build
/// arbitrary environments without touching the real process.
#[derive(Debug, Clone, Default)]
pub struct Env {
    vars: HashMap<String, String>,
}

impl Env {
    /// Snapshot the live process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_iter<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Get a variable. Empty values count as unset everywhere in clawboot.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Overlay a resolved secret set onto this snapshot.
    ///
    /// Vault values win over already-present process variables: the secret
    /// store is the source of truth once it is consulted.
    pub fn overlay(&mut self, secrets: HashMap<String, String>) {
        for (key, value) in secrets {
            self.vars.insert(key, value);
        }
    }

    /// Iterate all (name, value) pairs, for handing to a child process.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ─────────────────────────────────────────────────────────────
// Normalization
// ─────────────────────────────────────────────────────────────

/// Map platform-injected alias names onto the canonical names and apply
/// pass-through defaults. Idempotent; a canonical value that is already set
/// is never replaced.
pub fn normalize(env: &mut Env) {
    for (alias, canonical) in ALIASES {
        if !env.is_set(canonical)
            && let Some(value) = env.get(alias).map(str::to_owned)
        {
            debug!(alias, canonical, "copied platform alias");
            env.set(*canonical, value);
        }
    }

    // Containers have no system keyring; default to the file backend.
    if !env.is_set("OPENCLAW_KEYRING_BACKEND") {
        env.set("OPENCLAW_KEYRING_BACKEND", "file");
    }
}

// ─────────────────────────────────────────────────────────────
// Preconditions
// ─────────────────────────────────────────────────────────────

/// Validate the credentials the gateway cannot start without.
///
/// Runs after secret resolution so vault-supplied values count.
pub fn check_preconditions(env: &Env) -> Result<(), PreconditionError> {
    if !env.is_set("OPENCLAW_GATEWAY_TOKEN") {
        return Err(PreconditionError::MissingGatewayToken);
    }

    let has_provider_key = PROVIDER_KEY_VARS.iter().any(|key| env.is_set(key));
    let has_aws_pair = env.is_set("AWS_ACCESS_KEY_ID") && env.is_set("AWS_SECRET_ACCESS_KEY");
    let has_local_endpoint = env.is_set("OLLAMA_BASE_URL");

    if !has_provider_key && !has_aws_pair && !has_local_endpoint {
        return Err(PreconditionError::NoProviderCredential);
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────
// Shared env conventions
// ─────────────────────────────────────────────────────────────

/// Parse the truthy flag convention used across the env catalog.
pub fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// The gateway binary, overridable for non-standard images.
pub fn openclaw_bin(env: &Env) -> String {
    env.get("OPENCLAW_BIN").unwrap_or("openclaw").to_string()
}

// ─────────────────────────────────────────────────────────────
// State paths
// ─────────────────────────────────────────────────────────────

/// Resolved filesystem locations for the container's lifetime.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// The gateway's private state directory (config, locks, legacy files).
    pub state_dir: PathBuf,
    /// The user-visible workspace directory.
    pub workspace_dir: PathBuf,
}

impl StatePaths {
    pub fn from_env(env: &Env) -> Self {
        Self {
            state_dir: env
                .get("OPENCLAW_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/home/openclaw/.openclaw")),
            workspace_dir: env
                .get("OPENCLAW_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/home/openclaw/workspace")),
        }
    }

    /// Canonical gateway configuration file.
    pub fn gateway_config(&self) -> PathBuf {
        self.state_dir.join("openclaw.json")
    }

    /// Canonical (workspace-side) MCP registry file.
    pub fn mcp_workspace(&self) -> PathBuf {
        self.workspace_dir.join(".mcp.json")
    }

    /// Legacy state-side MCP registry location, kept as a symlink.
    pub fn mcp_state(&self) -> PathBuf {
        self.state_dir.join("mcp.json")
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_copied_when_canonical_unset() {
        let mut env = Env::from_iter([("SERVICE_PASSWORD_OPENCLAW", "tok-123")]);
        normalize(&mut env);
        assert_eq!(env.get("OPENCLAW_GATEWAY_TOKEN"), Some("tok-123"));
    }

    #[test]
    fn test_alias_never_overwrites_canonical() {
        let mut env = Env::from_iter([
            ("SERVICE_PASSWORD_OPENCLAW", "from-alias"),
            ("OPENCLAW_GATEWAY_TOKEN", "explicit"),
        ]);
        normalize(&mut env);
        assert_eq!(env.get("OPENCLAW_GATEWAY_TOKEN"), Some("explicit"));
    }

    #[test]
    fn test_keyring_backend_defaults_to_file() {
        let mut env = Env::default();
        normalize(&mut env);
        assert_eq!(env.get("OPENCLAW_KEYRING_BACKEND"), Some("file"));

        let mut env = Env::from_iter([("OPENCLAW_KEYRING_BACKEND", "system")]);
        normalize(&mut env);
        assert_eq!(env.get("OPENCLAW_KEYRING_BACKEND"), Some("system"));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut env = Env::from_iter([("SERVICE_USER_OPENCLAW", "admin")]);
        normalize(&mut env);
        let first = env.clone();
        normalize(&mut env);
        assert_eq!(
            first.get("OPENCLAW_BASIC_AUTH_USER"),
            env.get("OPENCLAW_BASIC_AUTH_USER")
        );
    }

    #[test]
    fn test_empty_value_counts_as_unset() {
        let env = Env::from_iter([("OPENCLAW_GATEWAY_TOKEN", "")]);
        assert!(!env.is_set("OPENCLAW_GATEWAY_TOKEN"));
        assert!(matches!(
            check_preconditions(&env),
            Err(PreconditionError::MissingGatewayToken)
        ));
    }

    #[test]
    fn test_missing_gateway_token_fails() {
        let env = Env::from_iter([("ANTHROPIC_API_KEY", "sk-ant")]);
        assert!(matches!(
            check_preconditions(&env),
            Err(PreconditionError::MissingGatewayToken)
        ));
    }

    #[test]
    fn test_no_provider_credential_fails_regardless_of_other_vars() {
        let env = Env::from_iter([
            ("OPENCLAW_GATEWAY_TOKEN", "tok"),
            ("OPENCLAW_BASIC_AUTH_USER", "admin"),
            ("SOME_UNRELATED_VAR", "value"),
            // Incomplete AWS pair does not count.
            ("AWS_ACCESS_KEY_ID", "AKIA123"),
        ]);
        assert!(matches!(
            check_preconditions(&env),
            Err(PreconditionError::NoProviderCredential)
        ));
    }

    #[test]
    fn test_single_provider_key_passes() {
        for key in PROVIDER_KEY_VARS {
            let env = Env::from_iter([("OPENCLAW_GATEWAY_TOKEN", "tok"), (*key, "value")]);
            assert!(check_preconditions(&env).is_ok(), "{key} should satisfy");
        }
    }

    #[test]
    fn test_aws_pair_passes() {
        let env = Env::from_iter([
            ("OPENCLAW_GATEWAY_TOKEN", "tok"),
            ("AWS_ACCESS_KEY_ID", "AKIA123"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]);
        assert!(check_preconditions(&env).is_ok());
    }

    #[test]
    fn test_local_endpoint_passes() {
        let env = Env::from_iter([
            ("OPENCLAW_GATEWAY_TOKEN", "tok"),
            ("OLLAMA_BASE_URL", "http://127.0.0.1:11434"),
        ]);
        assert!(check_preconditions(&env).is_ok());
    }

    #[test]
    fn test_overlay_prefers_vault_values() {
        let mut env = Env::from_iter([("OPENCLAW_GATEWAY_TOKEN", "stale")]);
        env.overlay(HashMap::from([(
            "OPENCLAW_GATEWAY_TOKEN".to_string(),
            "fresh".to_string(),
        )]));
        assert_eq!(env.get("OPENCLAW_GATEWAY_TOKEN"), Some("fresh"));
    }

    #[test]
    fn test_state_paths_defaults_and_overrides() {
        let env = Env::default();
        let paths = StatePaths::from_env(&env);
        assert_eq!(
            paths.gateway_config(),
            PathBuf::from("/home/openclaw/.openclaw/openclaw.json")
        );

        let env = Env::from_iter([
            ("OPENCLAW_STATE_DIR", "/data/state"),
            ("OPENCLAW_WORKSPACE_DIR", "/data/workspace"),
        ]);
        let paths = StatePaths::from_env(&env);
        assert_eq!(paths.mcp_state(), PathBuf::from("/data/state/mcp.json"));
        assert_eq!(
            paths.mcp_workspace(),
            PathBuf::from("/data/workspace/.mcp.json")
        );
    }
}
