use std::path::PathBuf;

use anyhow::Context;
use cradle_launch::LaunchContext;
use cradle_supervisor::{Supervisor, SupervisorSettings, format_error_chain};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("usage: cradle <launch.toml>"))?;
    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("read launch file {}", path.display()))?;
    let ctx: LaunchContext =
        toml::from_str(&raw).with_context(|| format!("parse launch file {}", path.display()))?;

    let supervisor = Supervisor::new(SupervisorSettings::from_env());
    let handle = match supervisor.start(&ctx).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(launch = %ctx.id, code = e.code(), hint = e.hint(), "launch failed");
            for line in e.tail() {
                eprintln!("  | {line}");
            }
            let err = anyhow::Error::new(e).context("start node");
            anyhow::bail!("{}", format_error_chain(&err));
        }
    };

    tracing::info!(
        launch = %handle.id(),
        pid = ?handle.pid(),
        ports = ?handle.ports(),
        work = %handle.work_dir().display(),
        "node ready; press Ctrl-C to stop"
    );

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            }
        }
        code = handle.exited() => tracing::warn!(?code, "node exited on its own"),
    }

    let outcome = handle.stop().await;
    tracing::info!(?outcome, "node stopped");
    Ok(())
}
