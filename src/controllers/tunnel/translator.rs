use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress};
use kube::ResourceExt as _;
use tracing::{debug, debug_span, info_span, Span};

use super::{
    annotations::parse_ingress_tunnel_options,
    audit::{endpoints_have_subsets, get_service_port},
    informer::{item_key_func, routed_rules},
    InformerSet, Resource, RouteLink, TunnelOptions, TunnelRoute, TunnelRouteLinkMap, TunnelRule,
};

/// Derives the desired tunnels of an Ingress from the informer caches.
///
/// Translation only reads the caches, so it is safe to run concurrently and
/// repeated calls over an unchanged cache produce the same rule set.
pub struct SyncTranslator {
    informers: InformerSet,
    base_options: TunnelOptions,
    cert_key: String,
    default_secret: Option<Resource>,
    span: Span,
}

impl SyncTranslator {
    pub fn new(
        informers: InformerSet,
        base_options: TunnelOptions,
        cert_key: impl Into<String>,
        default_secret: Option<Resource>,
    ) -> Self {
        Self {
            informers,
            base_options,
            cert_key: cert_key.into(),
            default_secret,
            span: info_span!("translator"),
        }
    }

    pub fn translate(&self, ing: Option<&Ingress>) -> Option<TunnelRoute> {
        let ing = ing?;
        let namespace = ing.namespace().unwrap_or_default();
        let name = ing.name_any();
        let span = debug_span!(parent: &self.span, "ingress", %namespace, %name);
        let _enter = span.enter();

        let options = TunnelOptions::collect(&self.base_options, parse_ingress_tunnel_options(ing));
        let mut links = TunnelRouteLinkMap::new();
        for (host, http) in routed_rules(ing) {
            for path in http.paths.iter() {
                if let Some((rule, cert)) = self.resolve_path(ing, &namespace, host, path) {
                    links.insert(rule, RouteLink { cert, link: None });
                }
            }
        }

        Some(TunnelRoute {
            name,
            namespace,
            options,
            links,
        })
    }

    fn resolve_path(
        &self,
        ing: &Ingress,
        namespace: &str,
        host: &str,
        path: &HTTPIngressPath,
    ) -> Option<(TunnelRule, Vec<u8>)> {
        let Some(backend) = path.backend.service.as_ref() else {
            debug!(host, "path has no service backend");
            return None;
        };
        let service_key = item_key_func(namespace, &backend.name);

        let Some(service) = self.informers.service.get_by_key(&service_key) else {
            debug!(host, service = %service_key, "service not found");
            return None;
        };

        let Some(port) = backend
            .port
            .as_ref()
            .and_then(|port| get_service_port(Some(&service), port))
        else {
            debug!(host, service = %service_key, "service port not found");
            return None;
        };

        let Some(secret) = self.host_secret(ing, namespace, host) else {
            debug!(host, "no tls secret for host");
            return None;
        };

        let Some(cert) = self
            .informers
            .secret
            .get_by_key(&secret.key())
            .and_then(|s| s.data.as_ref()?.get(&self.cert_key).map(|b| b.0.clone()))
            .filter(|cert| !cert.is_empty())
        else {
            debug!(host, secret = %secret, "secret or origin certificate not found");
            return None;
        };

        let endpoints = self.informers.endpoint.get_by_key(&service_key);
        if !endpoints_have_subsets(endpoints.as_deref()) {
            debug!(host, service = %service_key, "service has no ready endpoints");
            return None;
        }

        let rule = TunnelRule {
            service: Resource::new(namespace, &backend.name),
            secret,
            host: host.to_string(),
            port,
        };
        Some((rule, cert))
    }

    /// The TLS secret declared for `host`, else the configured default.
    fn host_secret(&self, ing: &Ingress, namespace: &str, host: &str) -> Option<Resource> {
        ing.spec
            .as_ref()
            .and_then(|s| s.tls.as_ref())
            .into_iter()
            .flatten()
            .filter(|tls| tls.hosts.iter().flatten().any(|h| h == host))
            .filter_map(|tls| tls.secret_name.as_deref().filter(|n| !n.is_empty()))
            .last()
            .map(|secret_name| Resource::new(namespace, secret_name))
            .or_else(|| self.default_secret.clone())
    }
}
