use std::{future::Future, sync::Arc, time::Duration};

use k8s_openapi::api::{
    core::v1::{Endpoints, Secret, Service},
    networking::v1::Ingress,
};
use kube::{Client, Resource as KubeResource};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{interval_at, Instant, Interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::tunnel::{
    item_key_func, parse_ingress_class, CloudflaredProcess, InformerSet, Resource,
    ResourceEventHandler, SyncTranslator, SyncTunnelRouter, TunnelEngine, TunnelRouter,
    SECRET_KIND, SERVICE_KIND,
};
use crate::{cli::ControllerArgs, Result};

/// Runs the informers, the reconcile worker and the router until shutdown.
pub async fn run_controllers(args: ControllerArgs) -> Result<()> {
    let client = Client::try_default().await?;
    let engine: Arc<dyn TunnelEngine> = Arc::new(CloudflaredProcess::new(
        args.cloudflared_path(),
        args.cert_dir(),
    ));
    let router: Arc<dyn TunnelRouter> = Arc::new(SyncTunnelRouter::new(engine));
    let (informers, writers) = InformerSet::new(args.default_secret().cloned());
    let (queue, pending) = mpsc::unbounded_channel();
    let handler = Arc::new(EventHandler {
        informers: informers.clone(),
        queue: queue.clone(),
    });
    let context = Context::new(informers, router.clone(), &args);
    let shutdown = CancellationToken::new();

    info!("Starting controller for Ingress");
    let (_, worker, _) = tokio::join!(
        writers.run(client, handler, shutdown.clone()),
        context.run(
            queue,
            pending,
            args.resync_period(),
            args.cache_sync_timeout(),
            shutdown.clone(),
        ),
        shutdown_on_signal(termination_signal(), shutdown.clone()),
    );

    let stopped = router.stop();
    info!("controller for Ingress shutdown");
    worker.and(stopped)
}

async fn shutdown_on_signal(signal: impl Future<Output = ()>, shutdown: CancellationToken) {
    tokio::select! {
        _ = signal => {
            info!("shutting down");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// Resolves on SIGINT or SIGTERM. SIGTERM is registered before this returns.
fn termination_signal() -> impl Future<Output = ()> {
    let sigterm = signal(SignalKind::terminate());
    async move {
        let sigterm = async {
            match sigterm {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("failed to listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        let sigint = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for SIGINT: {e}");
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = sigterm => {}
            _ = sigint => {}
        }
    }
}

fn object_key<K: KubeResource>(obj: &K) -> String {
    item_key_func(
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default(),
    )
}

/// Turns cache notifications into ingress keys on the work queue.
struct EventHandler {
    informers: InformerSet,
    queue: UnboundedSender<String>,
}

impl EventHandler {
    fn enqueue(&self, key: String) {
        if self.queue.send(key).is_err() {
            debug!("work queue closed");
        }
    }

    /// Enqueues every ingress whose `index` entry points at `obj`.
    fn enqueue_dependents<K: KubeResource>(&self, index: &str, obj: &K) {
        for ing in self.informers.ingress.by_index(index, &object_key(obj)) {
            self.enqueue(object_key(ing.as_ref()));
        }
    }
}

impl ResourceEventHandler<Ingress> for EventHandler {
    fn on_add(&self, obj: &Ingress) {
        self.enqueue(object_key(obj));
    }

    fn on_update(&self, _old: &Ingress, new: &Ingress) {
        self.enqueue(object_key(new));
    }

    fn on_delete(&self, obj: &Ingress) {
        self.enqueue(object_key(obj));
    }
}

impl ResourceEventHandler<Secret> for EventHandler {
    fn on_add(&self, obj: &Secret) {
        self.enqueue_dependents(SECRET_KIND, obj);
    }

    fn on_update(&self, _old: &Secret, new: &Secret) {
        self.enqueue_dependents(SECRET_KIND, new);
    }

    fn on_delete(&self, obj: &Secret) {
        self.enqueue_dependents(SECRET_KIND, obj);
    }
}

impl ResourceEventHandler<Service> for EventHandler {
    fn on_add(&self, obj: &Service) {
        self.enqueue_dependents(SERVICE_KIND, obj);
    }

    fn on_update(&self, _old: &Service, new: &Service) {
        self.enqueue_dependents(SERVICE_KIND, new);
    }

    fn on_delete(&self, obj: &Service) {
        self.enqueue_dependents(SERVICE_KIND, obj);
    }
}

// endpoints share their service's name
impl ResourceEventHandler<Endpoints> for EventHandler {
    fn on_add(&self, obj: &Endpoints) {
        self.enqueue_dependents(SERVICE_KIND, obj);
    }

    fn on_update(&self, _old: &Endpoints, new: &Endpoints) {
        self.enqueue_dependents(SERVICE_KIND, new);
    }

    fn on_delete(&self, obj: &Endpoints) {
        self.enqueue_dependents(SERVICE_KIND, obj);
    }
}

async fn next_resync(resync: Option<&mut Interval>) {
    match resync {
        Some(resync) => {
            resync.tick().await;
        }
        None => std::future::pending().await,
    }
}

struct Context {
    informers: InformerSet,
    translator: SyncTranslator,
    router: Arc<dyn TunnelRouter>,
    ingress_class: String,
}

impl Context {
    fn new(informers: InformerSet, router: Arc<dyn TunnelRouter>, args: &ControllerArgs) -> Self {
        Self {
            translator: SyncTranslator::new(
                informers.clone(),
                args.tunnel_options(),
                args.cert_key(),
                args.default_secret().cloned(),
            ),
            informers,
            router,
            ingress_class: args.ingress_class().to_string(),
        }
    }

    async fn run(
        &self,
        queue: UnboundedSender<String>,
        mut pending: UnboundedReceiver<String>,
        resync_period: Duration,
        cache_sync_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let synced = tokio::select! {
            res = self.informers.wait_for_cache_sync(cache_sync_timeout) => res,
            _ = shutdown.cancelled() => return Ok(()),
        };
        if let Err(e) = synced {
            warn!("informer caches failed to sync: {e}");
            shutdown.cancel();
            return Err(e);
        }
        info!("informer caches synced");

        self.enqueue_all(&queue);
        // a zero period disables the periodic resync
        let mut resync = (!resync_period.is_zero())
            .then(|| interval_at(Instant::now() + resync_period, resync_period));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = next_resync(resync.as_mut()) => self.enqueue_all(&queue),
                Some(key) = pending.recv() => self.reconcile(&key),
            }
        }
        Ok(())
    }

    fn enqueue_all(&self, queue: &UnboundedSender<String>) {
        for ing in self.informers.ingress.state() {
            let _ = queue.send(object_key(ing.as_ref()));
        }
    }

    fn reconcile(&self, key: &str) {
        debug!("Reconciling Ingress \"{key}\"");
        if let Err(e) = self.try_reconcile(key) {
            warn!("reconcile failed: {e:?}");
        }
    }

    fn try_reconcile(&self, key: &str) -> Result<()> {
        let resource: Resource = key.parse()?;
        let ing = self
            .informers
            .ingress
            .get_by_key(key)
            .filter(|ing| self.is_claimed(ing));

        let Some(route) = self.translator.translate(ing.as_deref()) else {
            return self
                .router
                .delete_route(&resource.namespace, &resource.name);
        };
        if route.links.is_empty() {
            info!(ingress = key, "ingress has no routable rules");
        }
        self.router.update_route(route)
    }

    fn is_claimed(&self, ing: &Ingress) -> bool {
        parse_ingress_class(ing) == Some(self.ingress_class.as_str())
    }
}
