mod annotations;
mod audit;
mod engine;
mod informer;
mod link;
mod options;
mod router;
mod translator;

use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

pub use annotations::{parse_duration, parse_ingress_class};
pub use engine::{CloudflaredProcess, TunnelEngine};
#[cfg(test)]
pub use informer::InformerSetWriters;
pub use informer::{
    item_key_func, InformerSet, ResourceEventHandler, SECRET_KIND, SERVICE_KIND,
};
pub use link::{SyncTunnelLink, TunnelLink};
pub use options::{TunnelOption, TunnelOptions};
pub use router::{SyncTunnelRouter, TunnelRouter};
pub use translator::SyncTranslator;

use crate::{Error, Result};

/// A namespaced reference to a Service or Secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub namespace: String,
    pub name: String,
}

impl Resource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> String {
        item_key_func(&self.namespace, &self.name)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for Resource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::invalid_resource(s)),
        }
    }
}

/// Identity of one desired tunnel. Routes are diffed by this key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelRule {
    pub service: Resource,
    pub secret: Resource,
    pub host: String,
    pub port: i32,
}

impl TunnelRule {
    /// `<service>.<namespace>:<port>`
    pub fn origin_url(&self) -> String {
        format!(
            "{}.{}:{}",
            self.service.name, self.service.namespace, self.port
        )
    }
}

/// A desired rule together with its resolved origin certificate and, once the
/// router attached one, the live link serving it.
#[derive(Clone, Default)]
pub struct RouteLink {
    pub cert: Vec<u8>,
    pub link: Option<Arc<dyn TunnelLink>>,
}

impl fmt::Debug for RouteLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteLink")
            .field("cert_len", &self.cert.len())
            .field("attached", &self.link.is_some())
            .finish()
    }
}

pub type TunnelRouteLinkMap = HashMap<TunnelRule, RouteLink>;

/// Desired tunnels of one Ingress. A fresh route replaces the previous one on
/// every translation.
#[derive(Debug, Clone, Default)]
pub struct TunnelRoute {
    pub name: String,
    pub namespace: String,
    pub options: TunnelOptions,
    pub links: TunnelRouteLinkMap,
}

impl TunnelRoute {
    pub fn key(&self) -> String {
        item_key_func(&self.namespace, &self.name)
    }

    pub fn rules(&self) -> std::collections::BTreeSet<&TunnelRule> {
        self.links.keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_from_str() {
        assert_eq!(
            "unit/sec-a".parse::<Resource>().unwrap(),
            Resource::new("unit", "sec-a")
        );
        assert!("sec-a".parse::<Resource>().is_err());
        assert!("/sec-a".parse::<Resource>().is_err());
        assert!("unit/".parse::<Resource>().is_err());
    }

    #[test]
    fn origin_url_format() {
        let rule = TunnelRule {
            service: Resource::new("unit", "svc-a"),
            secret: Resource::new("unit", "sec-a"),
            host: "a.unit.com".to_string(),
            port: 8080,
        };
        assert_eq!(rule.origin_url(), "svc-a.unit:8080");
    }

    #[test]
    fn rules_differing_in_one_field_are_distinct_keys() {
        let rule = TunnelRule {
            service: Resource::new("unit", "svc-a"),
            secret: Resource::new("unit", "sec-a"),
            host: "a.unit.com".to_string(),
            port: 8080,
        };
        let mut links = TunnelRouteLinkMap::new();
        links.insert(rule.clone(), RouteLink::default());
        links.insert(rule.clone(), RouteLink::default());
        assert_eq!(links.len(), 1);

        links.insert(
            TunnelRule {
                port: 8081,
                ..rule.clone()
            },
            RouteLink::default(),
        );
        links.insert(
            TunnelRule {
                host: "b.unit.com".to_string(),
                ..rule
            },
            RouteLink::default(),
        );
        assert_eq!(links.len(), 3);
    }
}
