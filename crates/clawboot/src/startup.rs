//! The `start` sequence.
//!
//! Order matters: resolve (vault) → normalize → preconditions → gateway
//! config pipeline → plugin install → MCP reconciliation → proxy render →
//! launch. Data flows strictly downstream; no step reads back from a later
//! one.

use crate::error::Fatal;
use crate::launcher;
use anyhow::Context;
use boot_config::{
    CommandGenerator, install_browser_plugin, materialize, mcp_template_path,
    reconcile_mcp_registry, write_private,
};
use boot_env::{Env, StatePaths, check_preconditions, normalize};
use boot_proxy::{BasicAuth, ProxySite, read_hooks, render, render_starting_page};
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};

/// Where the generated proxy artifacts live for this container's lifetime.
struct RunPaths {
    nginx_conf: PathBuf,
    htpasswd: PathBuf,
    html_root: PathBuf,
}

impl RunPaths {
    fn from_env(env: &Env) -> Self {
        let run_dir = env
            .get("OPENCLAW_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/openclaw"));
        Self {
            nginx_conf: run_dir.join("nginx.conf"),
            htpasswd: run_dir.join("openclaw.htpasswd"),
            html_root: run_dir.join("www"),
        }
    }
}

fn port(env: &Env, key: &str, default: u16) -> u16 {
    match env.get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, raw, default, "unparseable port, using default");
            default
        }),
    }
}

pub async fn run() -> Result<(), Fatal> {
    let mut env = Env::from_process();

    // Resolve phase: the vault is consulted exactly once, in-process.
    // Nothing re-executes itself.
    boot_vault::resolve_environment(&mut env, "OPENCLAW_GATEWAY_TOKEN")
        .await?
        .log("vault-resolve");

    normalize(&mut env);
    check_preconditions(&env)?;

    let paths = StatePaths::from_env(&env);
    info!(
        state = %paths.state_dir.display(),
        workspace = %paths.workspace_dir.display(),
        "starting clawboot"
    );

    // Gateway configuration: stale clean, generate, enable patch, persist
    // once. The returned document feeds the proxy renderer.
    let generator = CommandGenerator::from_env(&env);
    let doc = materialize(&paths, &env, &generator).await?;

    install_browser_plugin(&paths, &env)
        .await
        .log("browser-plugin-install");

    reconcile_mcp_registry(&paths, &mcp_template_path(&env))?.log("mcp-reconcile");

    // Front proxy.
    let run_paths = RunPaths::from_env(&env);
    let site = build_site(&env, &doc, &run_paths).await?;
    write_private(&run_paths.nginx_conf, render(&site).as_bytes())
        .with_context(|| format!("writing {}", run_paths.nginx_conf.display()))?;
    std::fs::create_dir_all(&run_paths.html_root)
        .with_context(|| format!("creating {}", run_paths.html_root.display()))?;
    std::fs::write(
        run_paths.html_root.join("starting.html"),
        render_starting_page(),
    )
    .context("writing starting page")?;
    info!(conf = %run_paths.nginx_conf.display(), "proxy configuration written");

    // Hand the process over to the gateway. Only returns on error.
    launcher::launch(&env, &paths, &run_paths.nginx_conf, site.gateway_port).map_err(Fatal::from)
}

async fn build_site(env: &Env, doc: &Value, run_paths: &RunPaths) -> Result<ProxySite, Fatal> {
    let gateway_token = env
        .get("OPENCLAW_GATEWAY_TOKEN")
        .map(str::to_owned)
        .ok_or_else(|| Fatal::failure(anyhow::anyhow!("gateway token missing after preconditions")))?;

    let basic_auth = match env.get("OPENCLAW_BASIC_AUTH_PASS") {
        Some(pass) => {
            let user = env.get("OPENCLAW_BASIC_AUTH_USER").unwrap_or("openclaw");
            write_htpasswd(&run_paths.htpasswd, user, pass)
                .await
                .context("generating htpasswd")?;
            Some(BasicAuth {
                htpasswd_path: run_paths.htpasswd.clone(),
            })
        }
        None => None,
    };

    Ok(ProxySite {
        listen_port: port(env, "OPENCLAW_PROXY_PORT", 8080),
        gateway_port: port(env, "OPENCLAW_GATEWAY_PORT", 18789),
        gateway_token,
        basic_auth,
        hooks: read_hooks(doc),
        browser_port: port(env, "OPENCLAW_BROWSER_PORT", 9223),
        html_root: run_paths.html_root.clone(),
    })
}

/// Hash the basic-auth password with the system openssl (apr1, what nginx
/// expects) and write the htpasswd file owner-only. The password goes over
/// stdin, never through argv.
async fn write_htpasswd(path: &std::path::Path, user: &str, pass: &str) -> anyhow::Result<()> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new("openssl")
        .args(["passwd", "-apr1", "-stdin"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("spawning openssl")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(pass.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }

    let output = child.wait_with_output().await.context("running openssl")?;
    if !output.status.success() {
        anyhow::bail!("openssl passwd exited with {}", output.status);
    }

    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if hash.is_empty() {
        anyhow::bail!("openssl passwd produced no hash");
    }
    write_private(path, format!("{user}:{hash}\n").as_bytes())
        .with_context(|| format!("writing {}", path.display()))
}
