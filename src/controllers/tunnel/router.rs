use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    informer::item_key_func, SyncTunnelLink, TunnelEngine, TunnelLink, TunnelRoute,
    TunnelRouteLinkMap,
};
use crate::Result;

/// Applies translated routes to running tunnel links.
pub trait TunnelRouter: Send + Sync {
    /// Reconciles the links of `route` against the ones currently running for
    /// the same ingress. Unchanged links keep running untouched.
    fn update_route(&self, route: TunnelRoute) -> Result<()>;
    fn delete_route(&self, namespace: &str, name: &str) -> Result<()>;
    /// Stops every link of every route.
    fn stop(&self) -> Result<()>;
}

pub struct SyncTunnelRouter {
    engine: Arc<dyn TunnelEngine>,
    routes: Mutex<HashMap<String, TunnelRoute>>,
}

impl SyncTunnelRouter {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self {
            engine,
            routes: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn link_of(
        &self,
        namespace: &str,
        name: &str,
        host: &str,
    ) -> Option<Arc<dyn TunnelLink>> {
        self.routes
            .lock()
            .get(&item_key_func(namespace, name))?
            .links
            .iter()
            .find(|(rule, _)| rule.host == host)
            .and_then(|(_, slot)| slot.link.clone())
    }
}

/// Keeps the first error while still visiting every link.
fn first_err(acc: &mut Result<()>, res: Result<()>) {
    if let Err(e) = res {
        warn!("tunnel link transition failed: {e}");
        if acc.is_ok() {
            *acc = Err(e);
        }
    }
}

fn stop_links(links: TunnelRouteLinkMap, acc: &mut Result<()>) {
    for (rule, slot) in links {
        if let Some(link) = slot.link {
            debug!(host = %rule.host, "stopping tunnel link");
            first_err(acc, link.stop());
        }
    }
}

impl TunnelRouter for SyncTunnelRouter {
    fn update_route(&self, mut route: TunnelRoute) -> Result<()> {
        let key = route.key();
        let mut routes = self.routes.lock();
        let mut previous = routes.remove(&key).map(|r| r.links).unwrap_or_default();
        let mut result = Ok(());

        for (rule, slot) in route.links.iter_mut() {
            let candidate: Arc<dyn TunnelLink> = Arc::new(SyncTunnelLink::new(
                rule.clone(),
                slot.cert.clone(),
                route.options.clone(),
                self.engine.clone(),
            ));
            let link = match previous.remove(rule).and_then(|old| old.link) {
                Some(old) if old.equal(candidate.as_ref()) => {
                    debug!(route = %key, host = %old.route_rule().host, "reusing tunnel link");
                    first_err(&mut result, old.start());
                    old
                }
                old => {
                    if let Some(old) = old {
                        first_err(&mut result, old.stop());
                    }
                    info!(route = %key, host = %rule.host, "starting tunnel link");
                    first_err(&mut result, candidate.start());
                    candidate
                }
            };
            slot.link = Some(link);
        }
        stop_links(previous, &mut result);

        routes.insert(key, route);
        result
    }

    fn delete_route(&self, namespace: &str, name: &str) -> Result<()> {
        let key = item_key_func(namespace, name);
        let mut result = Ok(());
        if let Some(route) = self.routes.lock().remove(&key) {
            info!(route = %key, "removing route");
            stop_links(route.links, &mut result);
        }
        result
    }

    fn stop(&self) -> Result<()> {
        let mut result = Ok(());
        for (_, route) in self.routes.lock().drain() {
            stop_links(route.links, &mut result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::tunnel::{
        link::testing::{wait_for, MockEngine},
        Resource, RouteLink, TunnelOptions, TunnelRule,
    };

    fn rule(host: &str) -> TunnelRule {
        TunnelRule {
            service: Resource::new("unit", "svc-a"),
            secret: Resource::new("unit", "sec-a"),
            host: host.to_string(),
            port: 8080,
        }
    }

    fn route(rules: &[(&str, &str)]) -> TunnelRoute {
        TunnelRoute {
            name: "unit".to_string(),
            namespace: "unit".to_string(),
            options: TunnelOptions::default(),
            links: rules
                .iter()
                .map(|(host, cert)| {
                    (
                        rule(host),
                        RouteLink {
                            cert: cert.as_bytes().to_vec(),
                            link: None,
                        },
                    )
                })
                .collect(),
        }
    }

    fn router(engine: &Arc<MockEngine>) -> SyncTunnelRouter {
        SyncTunnelRouter::new(engine.clone())
    }

    #[tokio::test]
    async fn new_route_starts_links() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        router
            .update_route(route(&[("a.unit.com", "a"), ("b.unit.com", "b")]))
            .unwrap();
        wait_for(|| engine.runs() == 2).await;
        assert!(router.link_of("unit", "unit", "a.unit.com").is_some());
    }

    #[tokio::test]
    async fn unchanged_link_is_reused() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        router.update_route(route(&[("a.unit.com", "a")])).unwrap();
        let first = router.link_of("unit", "unit", "a.unit.com").unwrap();

        router.update_route(route(&[("a.unit.com", "a")])).unwrap();
        let second = router.link_of("unit", "unit", "a.unit.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        wait_for(|| engine.runs() == 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(engine.runs(), 1);
        assert_eq!(engine.stopped(), 0);
    }

    #[tokio::test]
    async fn changed_cert_replaces_link() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        router.update_route(route(&[("a.unit.com", "a")])).unwrap();
        wait_for(|| engine.runs() == 1).await;
        let first = router.link_of("unit", "unit", "a.unit.com").unwrap();

        router.update_route(route(&[("a.unit.com", "rotated")])).unwrap();
        let second = router.link_of("unit", "unit", "a.unit.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.origin_cert(), b"rotated");

        wait_for(|| engine.runs() == 2 && engine.stopped() == 1).await;
    }

    #[tokio::test]
    async fn removed_rule_is_stopped() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        router
            .update_route(route(&[("a.unit.com", "a"), ("b.unit.com", "b")]))
            .unwrap();
        wait_for(|| engine.runs() == 2).await;

        router.update_route(route(&[("a.unit.com", "a")])).unwrap();
        wait_for(|| engine.stopped() == 1).await;
        assert!(router.link_of("unit", "unit", "b.unit.com").is_none());
        assert_eq!(engine.runs(), 2);
    }

    #[tokio::test]
    async fn delete_route_stops_links() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        router
            .update_route(route(&[("a.unit.com", "a"), ("b.unit.com", "b")]))
            .unwrap();
        wait_for(|| engine.runs() == 2).await;

        router.delete_route("unit", "unit").unwrap();
        wait_for(|| engine.stopped() == 2).await;
        assert!(router.link_of("unit", "unit", "a.unit.com").is_none());

        // unknown routes are ignored
        router.delete_route("unit", "missing").unwrap();
    }

    #[tokio::test]
    async fn stop_stops_every_route() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        router.update_route(route(&[("a.unit.com", "a")])).unwrap();
        let mut other = route(&[("b.unit.com", "b")]);
        other.name = "other".to_string();
        router.update_route(other).unwrap();
        wait_for(|| engine.runs() == 2).await;

        router.stop().unwrap();
        wait_for(|| engine.stopped() == 2).await;
    }

    #[test]
    fn start_errors_are_reported() {
        let engine = MockEngine::failing(0);
        let router = router(&engine);
        assert!(router.update_route(route(&[("a.unit.com", "a")])).is_err());
        // the route is still recorded and the next update retries the start
        assert!(router.link_of("unit", "unit", "a.unit.com").is_some());
        assert!(router.update_route(route(&[("a.unit.com", "a")])).is_err());
    }
}
