use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::controllers::tunnel::{parse_duration, Resource, TunnelOptions};

#[derive(Parser, Debug, Clone)]
pub struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    #[command(about = "Run the ingress controller")]
    Run(ControllerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ControllerArgs {
    #[arg(long, env, default_value = "argo-tunnel")]
    ingress_class: String,
    /// Origin certificate secret (`namespace/name`) for hosts without a TLS entry.
    #[arg(long, env)]
    default_secret: Option<Resource>,
    #[arg(long, env, default_value = "cert.pem")]
    cert_key: String,
    #[arg(long, env, default_value = "30s", value_parser = parse_duration)]
    resync_period: Duration,
    #[arg(long, env, default_value = "60s", value_parser = parse_duration)]
    cache_sync_timeout: Duration,
    #[arg(long, env, default_value = "cloudflared")]
    cloudflared_path: PathBuf,
    #[arg(long, env, default_value = "/var/run/argo-tunnel")]
    cert_dir: PathBuf,
    #[arg(long, env, default_value_t = 4)]
    ha_connections: i32,
    #[arg(long, env, default_value_t = 5)]
    retries: u32,
    #[arg(long, env, default_value_t = 5)]
    heartbeat_count: u64,
    #[arg(long, env, default_value = "5s", value_parser = parse_duration)]
    heartbeat_interval: Duration,
    #[arg(long, env, default_value = "30s", value_parser = parse_duration)]
    grace_period: Duration,
    #[arg(long, env, default_value_t = 0)]
    compression_quality: u64,
    #[arg(long, env, default_value = "0.0.0.0:8080")]
    health_addr: SocketAddr,
}

impl ControllerArgs {
    pub fn ingress_class(&self) -> &str {
        &self.ingress_class
    }

    pub fn default_secret(&self) -> Option<&Resource> {
        self.default_secret.as_ref()
    }

    pub fn cert_key(&self) -> &str {
        &self.cert_key
    }

    pub fn resync_period(&self) -> Duration {
        self.resync_period
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        self.cache_sync_timeout
    }

    pub fn cloudflared_path(&self) -> &PathBuf {
        &self.cloudflared_path
    }

    pub fn cert_dir(&self) -> &PathBuf {
        &self.cert_dir
    }

    pub fn health_addr(&self) -> SocketAddr {
        self.health_addr
    }

    /// Baseline options that ingress annotations override.
    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            compression_quality: self.compression_quality,
            ha_connections: self.ha_connections,
            heartbeat_count: self.heartbeat_count,
            heartbeat_interval: self.heartbeat_interval,
            retries: self.retries,
            grace_period: self.grace_period,
            ..Default::default()
        }
    }
}

impl Cli {
    pub fn commands(&self) -> &Commands {
        &self.commands
    }
}
