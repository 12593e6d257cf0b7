//! Vault-backed secret resolution for clawboot.
//!
//! The shell-era system re-executed the whole startup script with an
//! injected environment and guarded recursion with a flag. This crate
//! replaces that with a two-phase design: [`resolve_environment`] consults
//! the vault synchronously, overlays the resolved secret set onto the
//! in-process [`Env`] snapshot once, and the run phase never re-invokes
//! anything.
//!
//! # Security notes
//! - [`VaultAuth`] implements a custom `Debug` that **never** prints token
//!   or client-secret material.

#![forbid(unsafe_code)]

use boot_env::{Env, StepOutcome};
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

const DEFAULT_API_URL: &str = "https://app.infisical.com";

// ─────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────

/// Errors from vault configuration and token acquisition.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// A project is configured but no usable auth material is present.
    /// This is a misconfiguration (exit code 2), not a runtime failure.
    #[error(
        "vault project is configured but no auth is: \
         set INFISICAL_TOKEN or INFISICAL_CLIENT_ID + INFISICAL_CLIENT_SECRET"
    )]
    MissingAuth,
    /// The token-issuance endpoint answered with a non-2xx status.
    #[error("vault token exchange failed with status {status}: {body}")]
    TokenExchange { status: u16, body: String },
    /// The response parsed but did not carry the expected fields.
    #[error("malformed vault response: {0}")]
    MalformedResponse(String),
    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl VaultError {
    /// True for errors that mean "operator misconfigured the deployment"
    /// rather than "the vault call failed".
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::MissingAuth)
    }
}

// ─────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────

/// How the client authenticates against the vault.
#[derive(Clone)]
pub enum VaultAuth {
    /// A pre-issued static access token.
    Token(String),
    /// Machine-identity pair exchanged for an access token at startup.
    ClientPair {
        client_id: String,
        client_secret: String,
    },
}

/// Custom `Debug` that redacts all credential material.
impl std::fmt::Debug for VaultAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.debug_tuple("Token").field(&"[REDACTED]").finish(),
            Self::ClientPair { client_id, .. } => f
                .debug_struct("ClientPair")
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Vault connection settings derived from the environment.
#[derive(Debug, Clone)]
pub struct VaultSettings {
    pub base_url: String,
    pub project_id: String,
    pub environment: String,
    pub auth: VaultAuth,
}

impl VaultSettings {
    /// Read settings from the environment.
    ///
    /// Returns `Ok(None)` when no vault is configured (no project id), which
    /// is a normal standalone deployment. A project id without any auth
    /// material is a hard misconfiguration.
    pub fn from_env(env: &Env) -> Result<Option<Self>, VaultError> {
        let Some(project_id) = env.get("INFISICAL_PROJECT_ID") else {
            return Ok(None);
        };

        let auth = if let Some(token) = env.get("INFISICAL_TOKEN") {
            VaultAuth::Token(token.to_string())
        } else if let (Some(id), Some(secret)) = (
            env.get("INFISICAL_CLIENT_ID"),
            env.get("INFISICAL_CLIENT_SECRET"),
        ) {
            VaultAuth::ClientPair {
                client_id: id.to_string(),
                client_secret: secret.to_string(),
            }
        } else {
            return Err(VaultError::MissingAuth);
        };

        Ok(Some(Self {
            base_url: env
                .get("INFISICAL_API_URL")
                .unwrap_or(DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
            project_id: project_id.to_string(),
            environment: env
                .get("INFISICAL_ENVIRONMENT")
                .unwrap_or("prod")
                .to_string(),
            auth,
        }))
    }
}

// ─────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretsResponse {
    secrets: Vec<RawSecret>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSecret {
    secret_key: String,
    secret_value: String,
}

// ─────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────

/// Thin client for the vault's token-issuance and secret-listing endpoints.
pub struct VaultClient {
    http: reqwest::Client,
    base_url: String,
}

impl VaultClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.into(),
        }
    }

    /// Acquire an access token. A static token passes through untouched;
    /// a client pair is exchanged against the universal-auth login endpoint.
    pub async fn access_token(&self, auth: &VaultAuth) -> Result<String, VaultError> {
        match auth {
            VaultAuth::Token(token) => Ok(token.clone()),
            VaultAuth::ClientPair {
                client_id,
                client_secret,
            } => {
                let resp = self
                    .http
                    .post(format!("{}/api/v1/auth/universal-auth/login", self.base_url))
                    .json(&serde_json::json!({
                        "clientId": client_id,
                        "clientSecret": client_secret,
                    }))
                    .send()
                    .await?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(VaultError::TokenExchange {
                        status: status.as_u16(),
                        body: body.chars().take(200).collect(),
                    });
                }

                let login: LoginResponse = resp
                    .json()
                    .await
                    .map_err(|e| VaultError::MalformedResponse(e.to_string()))?;
                if login.access_token.is_empty() {
                    return Err(VaultError::MalformedResponse(
                        "login response carried an empty accessToken".to_string(),
                    ));
                }
                debug!("exchanged client pair for vault access token");
                Ok(login.access_token)
            }
        }
    }

    /// Fetch all secrets for a project + environment as a name → value map.
    pub async fn fetch_secrets(
        &self,
        token: &str,
        project_id: &str,
        environment: &str,
    ) -> Result<HashMap<String, String>, VaultError> {
        let resp = self
            .http
            .get(format!("{}/api/v3/secrets/raw", self.base_url))
            .query(&[("workspaceId", project_id), ("environment", environment)])
            .bearer_auth(token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VaultError::TokenExchange {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: SecretsResponse = resp
            .json()
            .await
            .map_err(|e| VaultError::MalformedResponse(e.to_string()))?;

        Ok(parsed
            .secrets
            .into_iter()
            .map(|s| (s.secret_key, s.secret_value))
            .collect())
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("failed to build HTTP client")
}

// ─────────────────────────────────────────────────────────────
// Resolve phase
// ─────────────────────────────────────────────────────────────

/// Resolve phase of the two-phase startup.
///
/// If a vault is configured and the indicator credential (the variable this
/// entrypoint exists to obtain) is absent from the environment, fetch the
/// project's secret set and overlay it onto the snapshot (vault values
/// win). Errors here are fatal in the caller: startup cannot proceed
/// without credentials it was told exist.
pub async fn resolve_environment(
    env: &mut Env,
    indicator: &str,
) -> Result<StepOutcome, VaultError> {
    let Some(settings) = VaultSettings::from_env(env)? else {
        return Ok(StepOutcome::skipped("vault not configured"));
    };

    if env.is_set(indicator) {
        return Ok(StepOutcome::skipped(format!(
            "{indicator} already present in environment"
        )));
    }

    let client = VaultClient::new(&settings.base_url);
    let token = client.access_token(&settings.auth).await?;
    let secrets = client
        .fetch_secrets(&token, &settings.project_id, &settings.environment)
        .await?;

    info!(
        count = secrets.len(),
        project = %settings.project_id,
        environment = %settings.environment,
        "overlaying vault secrets onto environment"
    );
    env.overlay(secrets);
    Ok(StepOutcome::Applied)
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_absent_without_project_id() {
        let env = Env::from_iter([("INFISICAL_TOKEN", "st.abc")]);
        assert!(VaultSettings::from_env(&env).expect("ok").is_none());
    }

    #[test]
    fn test_settings_missing_auth_is_misconfiguration() {
        let env = Env::from_iter([("INFISICAL_PROJECT_ID", "proj-1")]);
        let err = VaultSettings::from_env(&env).expect_err("must fail");
        assert!(err.is_misconfiguration());
    }

    #[test]
    fn test_settings_static_token_wins_over_pair() {
        let env = Env::from_iter([
            ("INFISICAL_PROJECT_ID", "proj-1"),
            ("INFISICAL_TOKEN", "st.abc"),
            ("INFISICAL_CLIENT_ID", "id"),
            ("INFISICAL_CLIENT_SECRET", "secret"),
        ]);
        let settings = VaultSettings::from_env(&env).expect("ok").expect("some");
        assert!(matches!(settings.auth, VaultAuth::Token(_)));
    }

    #[test]
    fn test_settings_defaults() {
        let env = Env::from_iter([
            ("INFISICAL_PROJECT_ID", "proj-1"),
            ("INFISICAL_CLIENT_ID", "id"),
            ("INFISICAL_CLIENT_SECRET", "secret"),
        ]);
        let settings = VaultSettings::from_env(&env).expect("ok").expect("some");
        assert_eq!(settings.base_url, DEFAULT_API_URL);
        assert_eq!(settings.environment, "prod");
    }

    #[test]
    fn test_settings_trims_trailing_slash() {
        let env = Env::from_iter([
            ("INFISICAL_PROJECT_ID", "proj-1"),
            ("INFISICAL_TOKEN", "st.abc"),
            ("INFISICAL_API_URL", "https://vault.internal/"),
        ]);
        let settings = VaultSettings::from_env(&env).expect("ok").expect("some");
        assert_eq!(settings.base_url, "https://vault.internal");
    }

    #[test]
    fn test_auth_debug_redacts_material() {
        let auth = VaultAuth::ClientPair {
            client_id: "machine-1".to_string(),
            client_secret: "super-secret".to_string(),
        };
        let debug_str = format!("{auth:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("super-secret"));

        let token = VaultAuth::Token("st.abc123".to_string());
        assert!(!format!("{token:?}").contains("st.abc123"));
    }

    #[test]
    fn test_secrets_response_parses_to_map() {
        let body = r#"{"secrets":[
            {"secretKey":"OPENCLAW_GATEWAY_TOKEN","secretValue":"tok"},
            {"secretKey":"ANTHROPIC_API_KEY","secretValue":"sk-ant"}
        ]}"#;
        let parsed: SecretsResponse = serde_json::from_str(body).expect("parse");
        let map: HashMap<String, String> = parsed
            .secrets
            .into_iter()
            .map(|s| (s.secret_key, s.secret_value))
            .collect();
        assert_eq!(map.get("OPENCLAW_GATEWAY_TOKEN").map(String::as_str), Some("tok"));
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_skips_when_unconfigured() {
        let mut env = Env::default();
        let outcome = resolve_environment(&mut env, "OPENCLAW_GATEWAY_TOKEN")
            .await
            .expect("ok");
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn test_resolve_skips_when_indicator_already_present() {
        // No network call happens on this path, so a bogus project is fine.
        let mut env = Env::from_iter([
            ("INFISICAL_PROJECT_ID", "proj-1"),
            ("INFISICAL_TOKEN", "st.abc"),
            ("OPENCLAW_GATEWAY_TOKEN", "tok"),
        ]);
        let outcome = resolve_environment(&mut env, "OPENCLAW_GATEWAY_TOKEN")
            .await
            .expect("ok");
        assert!(matches!(outcome, StepOutcome::Skipped(_)));
        assert_eq!(env.get("OPENCLAW_GATEWAY_TOKEN"), Some("tok"));
    }
}
