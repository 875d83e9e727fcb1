use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use futures::future::BoxFuture;
use rand::{distributions::Alphanumeric, Rng as _};
use tokio::{io::AsyncWriteExt as _, process::Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TunnelOptions, TunnelRule};
use crate::{Error, Result};

const TUNNEL_SERVER_NAME: &str = "cftunnel.com";
const CLIENT_ID_LEN: usize = 32;

pub fn random_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_ID_LEN)
        .map(char::from)
        .collect()
}

/// Everything the tunnel engine needs to open one tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelConfig {
    pub origin_url: String,
    pub hostname: String,
    pub origin_cert: Vec<u8>,
    /// Edge identity the TLS session is pinned to.
    pub server_name: String,
    pub options: TunnelOptions,
    pub client_id: String,
}

impl TunnelConfig {
    pub fn new(rule: &TunnelRule, cert: &[u8], options: &TunnelOptions) -> Self {
        Self {
            origin_url: rule.origin_url(),
            hostname: rule.host.clone(),
            origin_cert: cert.to_vec(),
            server_name: TUNNEL_SERVER_NAME.to_string(),
            options: options.clone(),
            client_id: random_client_id(),
        }
    }
}

/// The external tunnel daemon.
///
/// `run` resolves when the tunnel ends, either because it failed or because
/// `stop` was cancelled. Implementations may panic; callers must contain it.
pub trait TunnelEngine: Send + Sync + 'static {
    fn run(&self, config: TunnelConfig, stop: CancellationToken) -> BoxFuture<'static, Result<()>>;
}

/// Runs each tunnel as a `cloudflared` child process.
#[derive(Debug, Clone)]
pub struct CloudflaredProcess {
    path: PathBuf,
    cert_dir: PathBuf,
}

impl CloudflaredProcess {
    pub fn new(path: impl Into<PathBuf>, cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cert_dir: cert_dir.into(),
        }
    }

    async fn run_tunnel(self, config: TunnelConfig, stop: CancellationToken) -> Result<()> {
        let cert_path = write_cert(&self.cert_dir, &config).await?;

        let result = self.supervise(&config, &cert_path, stop).await;

        if let Err(e) = tokio::fs::remove_file(&cert_path).await {
            warn!("failed to remove origin certificate {}: {e}", cert_path.display());
        }
        result
    }

    async fn supervise(
        &self,
        config: &TunnelConfig,
        cert_path: &Path,
        stop: CancellationToken,
    ) -> Result<()> {
        let mut child = Command::new(&self.path)
            .args(command_args(config, cert_path))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            client_id = %config.client_id,
            pid = child.id(),
            "tunnel daemon started"
        );

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    debug!("tunnel daemon exited");
                    Ok(())
                } else {
                    Err(Error::tunnel_exited(status))
                }
            }
            _ = stop.cancelled() => {
                child.kill().await?;
                debug!("tunnel daemon killed");
                Ok(())
            }
        }
    }
}

/// Writes the origin certificate readable by the owner only.
async fn write_cert(dir: &Path, config: &TunnelConfig) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let cert_path = dir.join(format!("{}.pem", config.client_id));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&cert_path)
        .await?;
    file.write_all(&config.origin_cert).await?;
    file.flush().await?;
    Ok(cert_path)
}

impl TunnelEngine for CloudflaredProcess {
    fn run(&self, config: TunnelConfig, stop: CancellationToken) -> BoxFuture<'static, Result<()>> {
        Box::pin(self.clone().run_tunnel(config, stop))
    }
}

fn command_args(config: &TunnelConfig, cert_path: &Path) -> Vec<String> {
    let opts = &config.options;
    let mut args = vec![
        "tunnel".to_string(),
        "--no-autoupdate".to_string(),
        "--origincert".to_string(),
        cert_path.display().to_string(),
        "--hostname".to_string(),
        config.hostname.clone(),
        "--url".to_string(),
        config.origin_url.clone(),
        "--retries".to_string(),
        opts.retries.to_string(),
        "--ha-connections".to_string(),
        opts.ha_connections.to_string(),
        "--heartbeat-count".to_string(),
        opts.heartbeat_count.to_string(),
        "--heartbeat-interval".to_string(),
        format!("{}ms", opts.heartbeat_interval.as_millis()),
        "--grace-period".to_string(),
        format!("{}ms", opts.grace_period.as_millis()),
        "--compression-quality".to_string(),
        opts.compression_quality.to_string(),
    ];
    if !opts.lb_pool.is_empty() {
        args.push("--lb-pool".to_string());
        args.push(opts.lb_pool.clone());
    }
    if opts.no_chunked_encoding {
        args.push("--no-chunked-encoding".to_string());
    }
    args
}
