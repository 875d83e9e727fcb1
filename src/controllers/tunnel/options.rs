use std::time::Duration;

/// Per-ingress tunnel settings handed to the tunnel engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelOptions {
    pub compression_quality: u64,
    pub ha_connections: i32,
    pub heartbeat_count: u64,
    pub heartbeat_interval: Duration,
    pub lb_pool: String,
    pub no_chunked_encoding: bool,
    pub retries: u32,
    pub grace_period: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            compression_quality: 0,
            ha_connections: 4,
            heartbeat_count: 5,
            heartbeat_interval: Duration::from_secs(5),
            lb_pool: String::new(),
            no_chunked_encoding: false,
            retries: 5,
            grace_period: Duration::from_secs(30),
        }
    }
}

/// A single override of one [`TunnelOptions`] field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelOption {
    CompressionQuality(u64),
    HaConnections(i32),
    HeartbeatCount(u64),
    HeartbeatInterval(Duration),
    LbPool(String),
    DisableChunkedEncoding(bool),
    Retries(u32),
}

impl TunnelOption {
    fn apply(self, opts: &mut TunnelOptions) {
        match self {
            Self::CompressionQuality(v) => opts.compression_quality = v,
            Self::HaConnections(v) => opts.ha_connections = v,
            Self::HeartbeatCount(v) => opts.heartbeat_count = v,
            Self::HeartbeatInterval(v) => opts.heartbeat_interval = v,
            Self::LbPool(v) => opts.lb_pool = v,
            Self::DisableChunkedEncoding(v) => opts.no_chunked_encoding = v,
            Self::Retries(v) => opts.retries = v,
        }
    }
}

impl TunnelOptions {
    /// Applies `opts` on top of `base` in order; a later setter for the same
    /// field wins.
    pub fn collect(base: &TunnelOptions, opts: impl IntoIterator<Item = TunnelOption>) -> Self {
        opts.into_iter().fold(base.clone(), |mut acc, opt| {
            opt.apply(&mut acc);
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_without_setters_is_base() {
        let base = TunnelOptions {
            retries: 9,
            ..Default::default()
        };
        assert_eq!(TunnelOptions::collect(&base, []), base);
    }

    #[test]
    fn collect_applies_in_order() {
        let opts = TunnelOptions::collect(
            &TunnelOptions::default(),
            [
                TunnelOption::Retries(1),
                TunnelOption::LbPool("pool-a".to_string()),
                TunnelOption::DisableChunkedEncoding(true),
                TunnelOption::Retries(3),
            ],
        );
        assert_eq!(opts.retries, 3);
        assert_eq!(opts.lb_pool, "pool-a");
        assert!(opts.no_chunked_encoding);
        assert_eq!(opts.ha_connections, TunnelOptions::default().ha_connections);
    }
}
