//! Scheduled redeploy checking for OpenClaw deployments.
//!
//! Compares the running gateway version against the latest upstream release
//! tag and, when the deployment is behind (or forced), triggers a redeploy
//! through the PaaS API. An unknown current version deploys unconditionally;
//! an unknown latest version aborts — deploying blind is not attempted.

#![forbid(unsafe_code)]

use boot_env::{Env, openclaw_bin, truthy};
use serde::Deserialize;
use tracing::{debug, warn};

const DEFAULT_API_BASE: &str = "http://host.docker.internal:8000";
const DEFAULT_RELEASES_URL: &str =
    "https://api.github.com/repos/openclaw/openclaw/releases/latest";

// ─────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// The deploy target is not configured. Misconfiguration (exit code 2).
    #[error("COOLIFY_RESOURCE_UUID is not set; nothing to redeploy")]
    MissingResourceUuid,
    /// The latest upstream version could not be determined. Fatal.
    #[error("could not determine latest release version: {0}")]
    LatestUnknown(String),
    #[error("deploy trigger failed with status {status}: {body}")]
    DeployFailed { status: u16, body: String },
    #[error("deploy request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl DeployError {
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::MissingResourceUuid)
    }
}

// ─────────────────────────────────────────────────────────────
// Version ordering
// ─────────────────────────────────────────────────────────────

/// A lenient semantic version triple.
///
/// Ordering is lexicographic on (major, minor, patch); parsing coerces
/// missing or non-numeric components to zero, so `1.2` == `1.2.0` and
/// `1.x.3` == `1.0.3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Total, never-failing parse. Strips one leading `v`/`V`.
    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix(['v', 'V']).unwrap_or(text);
        let mut parts = text.split('.');
        let mut component = || {
            parts
                .next()
                .and_then(|p| p.trim().parse::<u32>().ok())
                .unwrap_or(0)
        };
        Self {
            major: component(),
            minor: component(),
            patch: component(),
        }
    }

    /// Find the first `MAJOR.MINOR.PATCH`-shaped token in arbitrary command
    /// output (`"openclaw 2.1.3 (build f00)" → 2.1.3`).
    pub fn extract(text: &str) -> Option<Self> {
        for token in text.split_whitespace() {
            let token = token.strip_prefix(['v', 'V']).unwrap_or(token);
            let token = token.trim_end_matches(|c: char| !c.is_ascii_digit());
            let shaped = token.contains('.')
                && token.chars().next().is_some_and(|c| c.is_ascii_digit())
                && token.chars().all(|c| c.is_ascii_digit() || c == '.');
            if shaped {
                return Some(Self::parse(token));
            }
        }
        None
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ─────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployDecision {
    UpToDate,
    Deploy { reason: String },
}

/// Decide whether to redeploy.
///
/// Skip exactly when `latest <= current` and force is not set. An unknown
/// current version deploys unconditionally — "unknown" is treated as "must
/// upgrade", a policy carried over from the source system.
pub fn decide(current: Option<Version>, latest: Version, force: bool) -> DeployDecision {
    if force {
        return DeployDecision::Deploy {
            reason: "force flag set".to_string(),
        };
    }
    match current {
        None => DeployDecision::Deploy {
            reason: "current version unknown".to_string(),
        },
        Some(current) if latest <= current => DeployDecision::UpToDate,
        Some(current) => DeployDecision::Deploy {
            reason: format!("{current} -> {latest}"),
        },
    }
}

// ─────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────

/// Settings for one scheduled redeploy run, read from the (vault-resolved)
/// environment.
#[derive(Debug, Clone)]
pub struct RedeploySettings {
    pub resource_uuid: String,
    pub api_base: String,
    pub api_token: Option<String>,
    pub force: bool,
    pub releases_url: String,
}

impl RedeploySettings {
    pub fn from_env(env: &Env) -> Result<Self, DeployError> {
        let resource_uuid = env
            .get("COOLIFY_RESOURCE_UUID")
            .ok_or(DeployError::MissingResourceUuid)?
            .to_string();
        Ok(Self {
            resource_uuid,
            api_base: env
                .get("COOLIFY_API_BASE")
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            api_token: env.get("COOLIFY_API_TOKEN").map(String::from),
            force: env.get("COOLIFY_FORCE").map(truthy).unwrap_or(false),
            releases_url: env
                .get("OPENCLAW_RELEASES_URL")
                .unwrap_or(DEFAULT_RELEASES_URL)
                .to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────
// Wire types + clients
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LatestRelease {
    tag_name: String,
}

/// Client for the upstream release-listing endpoint.
pub struct ReleaseClient {
    http: reqwest::Client,
    url: String,
}

impl ReleaseClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            url: url.into(),
        }
    }

    /// Latest released version, leading `v` stripped. Any failure here is
    /// [`DeployError::LatestUnknown`] — the caller never deploys blind.
    pub async fn latest(&self) -> Result<Version, DeployError> {
        let resp = self
            .http
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, "clawboot")
            .send()
            .await
            .map_err(|e| DeployError::LatestUnknown(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DeployError::LatestUnknown(format!(
                "release endpoint answered {status}"
            )));
        }

        let release: LatestRelease = resp
            .json()
            .await
            .map_err(|e| DeployError::LatestUnknown(e.to_string()))?;
        if release.tag_name.is_empty() {
            return Err(DeployError::LatestUnknown("empty tag_name".to_string()));
        }
        Ok(Version::parse(&release.tag_name))
    }
}

/// Client for the PaaS deploy-trigger endpoint.
pub struct CoolifyClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl CoolifyClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.into(),
            token,
        }
    }

    /// Trigger a redeploy of the named resource.
    pub async fn deploy(&self, resource_uuid: &str, force: bool) -> Result<(), DeployError> {
        let mut req = self
            .http
            .get(format!("{}/api/v1/deploy", self.base_url))
            .query(&[
                ("uuid", resource_uuid),
                ("force", if force { "true" } else { "false" }),
            ]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeployError::DeployFailed {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        debug!(resource_uuid, force, "deploy triggered");
        Ok(())
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
}

// ─────────────────────────────────────────────────────────────
// Current-version probe
// ─────────────────────────────────────────────────────────────

/// Ask the installed gateway binary for its version. Best-effort: any
/// failure (missing binary, bad exit, unparseable output) yields `None`,
/// which the decision logic treats as "must upgrade".
pub async fn current_version(env: &Env) -> Option<Version> {
    let program = openclaw_bin(env);
    let output = tokio::process::Command::new(&program)
        .arg("--version")
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = Version::extract(&stdout);
            if version.is_none() {
                warn!(program, "version output carried no version token");
            }
            version
        }
        Ok(output) => {
            warn!(program, status = %output.status, "version command failed");
            None
        }
        Err(e) => {
            warn!(program, error = %e, "could not run version command");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────
