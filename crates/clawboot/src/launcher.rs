//! Process launch: proxy as a background daemon, gateway as the container's
//! foreground process.

use anyhow::Context;
use boot_env::{Env, StatePaths, openclaw_bin};
use std::path::Path;
use tracing::{debug, info};

/// Lock files a dead gateway may have left behind. Removal is best-effort;
/// absence is the normal case.
const STALE_LOCKS: &[&str] = &["gateway.lock", "gateway.pid"];

/// Start nginx, clear stale locks, then replace this process image with the
/// gateway so termination signals from the container runtime reach it
/// directly instead of being absorbed by a wrapper. Only returns on error.
pub fn launch(
    env: &Env,
    paths: &StatePaths,
    nginx_conf: &Path,
    gateway_port: u16,
) -> anyhow::Result<()> {
    // nginx daemonizes itself; a successful exit means the master is up.
    let status = std::process::Command::new("nginx")
        .args(["-c"])
        .arg(nginx_conf)
        .status()
        .context("starting nginx")?;
    if !status.success() {
        anyhow::bail!("nginx exited with {status}");
    }
    info!(conf = %nginx_conf.display(), "proxy started");

    for name in STALE_LOCKS {
        let lock = paths.state_dir.join(name);
        if std::fs::remove_file(&lock).is_ok() {
            debug!(path = %lock.display(), "removed stale lock file");
        }
    }

    let bind = env.get("OPENCLAW_GATEWAY_BIND").unwrap_or("127.0.0.1");
    let token = env
        .get("OPENCLAW_GATEWAY_TOKEN")
        .context("gateway token missing at launch")?;

    info!(bind, port = gateway_port, "handing off to gateway");
    let mut command = std::process::Command::new(openclaw_bin(env));
    command
        .args([
            "gateway",
            "--bind",
            bind,
            "--port",
            &gateway_port.to_string(),
            "--token",
            token,
        ])
        .envs(env.iter());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let err = command.exec();
        Err(anyhow::Error::new(err).context("replacing process with gateway"))
    }
    #[cfg(not(unix))]
    {
        let status = command.status().context("running gateway")?;
        anyhow::bail!("gateway exited with {status}")
    }
}
