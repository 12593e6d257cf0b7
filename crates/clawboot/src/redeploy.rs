//! The `check-redeploy` entrypoint: scheduled, stateless, environment-driven.

use crate::error::Fatal;
use boot_deploy::{CoolifyClient, DeployDecision, RedeploySettings, ReleaseClient, decide};
use boot_env::{Env, normalize};
use tracing::info;

pub async fn run() -> Result<(), Fatal> {
    let mut env = Env::from_process();

    // The API token resolves through the vault exactly like the gateway
    // token does at startup.
    boot_vault::resolve_environment(&mut env, "COOLIFY_API_TOKEN")
        .await?
        .log("vault-resolve");
    normalize(&mut env);

    let settings = RedeploySettings::from_env(&env)?;

    let current = boot_deploy::current_version(&env).await;
    let latest = ReleaseClient::new(&settings.releases_url).latest().await?;
    info!(
        current = %current.map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string()),
        %latest,
        force = settings.force,
        "version check"
    );

    match decide(current, latest, settings.force) {
        DeployDecision::UpToDate => {
            info!("up to date, nothing to do");
            Ok(())
        }
        DeployDecision::Deploy { reason } => {
            info!(reason, resource = %settings.resource_uuid, "triggering redeploy");
            CoolifyClient::new(&settings.api_base, settings.api_token.clone())
                .deploy(&settings.resource_uuid, settings.force)
                .await?;
            info!("redeploy triggered");
            Ok(())
        }
    }
}
