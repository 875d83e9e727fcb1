use std::{collections::BTreeMap, str::FromStr, time::Duration};

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt as _;

use super::TunnelOption;
use crate::{Error, Result};

const ANNOTATION_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";
const ANNOTATION_COMPRESSION_QUALITY: &str = "argo.cloudflare.com/compression-quality";
const ANNOTATION_HA_CONNECTIONS: &str = "argo.cloudflare.com/ha-connections";
const ANNOTATION_HEARTBEAT_COUNT: &str = "argo.cloudflare.com/heartbeat-count";
const ANNOTATION_HEARTBEAT_INTERVAL: &str = "argo.cloudflare.com/heartbeat-interval";
const ANNOTATION_LOAD_BALANCER: &str = "argo.cloudflare.com/lb-pool";
const ANNOTATION_NO_CHUNKED_ENCODING: &str = "argo.cloudflare.com/no-chunked-encoding";
const ANNOTATION_RETRIES: &str = "argo.cloudflare.com/retries";

/// Reads the tunnel annotations of `ing`. Missing or malformed values are
/// skipped, leaving the engine default in place.
pub fn parse_ingress_tunnel_options(ing: &Ingress) -> Vec<TunnelOption> {
    let annotations = ing.annotations();
    let mut opts = Vec::new();
    if let Some(v) = parse_meta_uint::<u64>(annotations, ANNOTATION_COMPRESSION_QUALITY) {
        opts.push(TunnelOption::CompressionQuality(v));
    }
    if let Some(v) = parse_meta::<i32>(annotations, ANNOTATION_HA_CONNECTIONS) {
        opts.push(TunnelOption::HaConnections(v));
    }
    if let Some(v) = parse_meta_uint::<u64>(annotations, ANNOTATION_HEARTBEAT_COUNT) {
        opts.push(TunnelOption::HeartbeatCount(v));
    }
    if let Some(v) = parse_meta_duration(annotations, ANNOTATION_HEARTBEAT_INTERVAL) {
        opts.push(TunnelOption::HeartbeatInterval(v));
    }
    if let Some(v) = annotations.get(ANNOTATION_LOAD_BALANCER) {
        opts.push(TunnelOption::LbPool(v.clone()));
    }
    if let Some(v) = parse_meta_bool(annotations, ANNOTATION_NO_CHUNKED_ENCODING) {
        opts.push(TunnelOption::DisableChunkedEncoding(v));
    }
    if let Some(v) = parse_meta_uint::<u32>(annotations, ANNOTATION_RETRIES) {
        opts.push(TunnelOption::Retries(v));
    }
    opts
}

/// The class claimed by `ing`: the legacy annotation first, then
/// `spec.ingressClassName`.
pub fn parse_ingress_class(ing: &Ingress) -> Option<&str> {
    ing.annotations()
        .get(ANNOTATION_INGRESS_CLASS)
        .map(String::as_str)
        .or_else(|| {
            ing.spec
                .as_ref()
                .and_then(|s| s.ingress_class_name.as_deref())
        })
}

fn parse_meta<T: FromStr>(annotations: &BTreeMap<String, String>, key: &str) -> Option<T> {
    annotations.get(key).and_then(|s| s.parse().ok())
}

/// Unsigned values take digits only; a sign is malformed.
fn parse_meta_uint<T: FromStr>(annotations: &BTreeMap<String, String>, key: &str) -> Option<T> {
    annotations
        .get(key)
        .filter(|s| !s.starts_with('+'))
        .and_then(|s| s.parse().ok())
}

fn parse_meta_bool(annotations: &BTreeMap<String, String>, key: &str) -> Option<bool> {
    match annotations.get(key).map(String::as_str) {
        Some("true") => Some(true),
        Some("false") => Some(false),
        _ => None,
    }
}

fn parse_meta_duration(annotations: &BTreeMap<String, String>, key: &str) -> Option<Duration> {
    annotations.get(key).and_then(|s| parse_duration(s).ok())
}

/// Parses a Go style duration such as `300ms`, `1.5h` or `2h45m`.
///
/// Negative durations cannot be represented and are rejected.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || Error::invalid_duration(s);
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (int_part, tail) = rest.split_at(leading_digits(rest));
        let (frac_part, tail) = match tail.strip_prefix('.') {
            Some(t) => t.split_at(leading_digits(t)),
            None => ("", tail),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "\u{00b5}s" | "\u{03bc}s" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 60 * 60 * 1_000_000_000,
            _ => return Err(invalid()),
        };

        let int: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let frac = if frac_part.is_empty() {
            0
        } else {
            // digits past nanosecond precision of the largest unit do not matter
            let digits = &frac_part[..frac_part.len().min(18)];
            let num: u128 = digits.parse().map_err(|_| invalid())?;
            num * scale / 10u128.pow(digits.len() as u32)
        };

        total = int
            .checked_mul(scale)
            .and_then(|v| v.checked_add(frac))
            .and_then(|v| v.checked_add(total))
            .filter(|&v| v <= i64::MAX as u128)
            .ok_or_else(invalid)?;
        rest = tail;
    }

    Ok(Duration::from_nanos(total as u64))
}

fn leading_digits(s: &str) -> usize {
    s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len())
}
