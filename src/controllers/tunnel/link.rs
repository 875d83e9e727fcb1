//! Lifecycle of a single tunnel.
//!
//! A started [`SyncTunnelLink`] owns two tasks: the launch task runs the
//! tunnel engine and reports how it ended on the link's error channel, and
//! the repair task consumes that channel, relaunching the engine after a
//! jittered delay whenever it failed. `stop` cancels both.

use std::{any::Any, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt as _;
use parking_lot::RwLock;
use rand::Rng as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument as _, Span};

use super::{
    engine::{random_client_id, TunnelConfig, TunnelEngine},
    TunnelOptions, TunnelRule,
};
use crate::{Error, Result};

const REPAIR_DELAY: Duration = Duration::from_millis(20);
const REPAIR_JITTER: f64 = 1.0;

pub trait TunnelLink: Send + Sync {
    fn host(&self) -> &str;
    fn route_rule(&self) -> &TunnelRule;
    fn origin_url(&self) -> &str;
    fn origin_cert(&self) -> &[u8];
    fn options(&self) -> &TunnelOptions;

    /// Whether `other` would open the same tunnel, so the running one can be
    /// kept.
    fn equal(&self, other: &dyn TunnelLink) -> bool {
        self.host() == other.host()
            && self.origin_url() == other.origin_url()
            && self.options() == other.options()
            && self.origin_cert() == other.origin_cert()
    }

    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

struct Running {
    stop: CancellationToken,
    quit: CancellationToken,
    err_tx: mpsc::UnboundedSender<Result<()>>,
}

struct LinkState {
    config: TunnelConfig,
    running: Option<Running>,
}

struct Shared {
    rule: TunnelRule,
    cert: Vec<u8>,
    opts: TunnelOptions,
    origin_url: String,
    engine: Arc<dyn TunnelEngine>,
    span: Span,
    state: RwLock<LinkState>,
}

pub struct SyncTunnelLink {
    shared: Arc<Shared>,
}

impl fmt::Debug for SyncTunnelLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTunnelLink")
            .field("rule", &self.shared.rule)
            .field("origin_url", &self.shared.origin_url)
            .field("running", &self.shared.state.read().running.is_some())
            .finish()
    }
}

impl SyncTunnelLink {
    pub fn new(
        rule: TunnelRule,
        cert: Vec<u8>,
        opts: TunnelOptions,
        engine: Arc<dyn TunnelEngine>,
    ) -> Self {
        let config = TunnelConfig::new(&rule, &cert, &opts);
        let origin_url = config.origin_url.clone();
        let span = info_span!("link", hostname = %rule.host, origin = %origin_url);
        Self {
            shared: Arc::new(Shared {
                rule,
                cert,
                opts,
                origin_url,
                engine,
                span,
                state: RwLock::new(LinkState {
                    config,
                    running: None,
                }),
            }),
        }
    }
}

impl TunnelLink for SyncTunnelLink {
    fn host(&self) -> &str {
        &self.shared.rule.host
    }

    fn route_rule(&self) -> &TunnelRule {
        &self.shared.rule
    }

    fn origin_url(&self) -> &str {
        &self.shared.origin_url
    }

    fn origin_cert(&self) -> &[u8] {
        &self.shared.cert
    }

    fn options(&self) -> &TunnelOptions {
        &self.shared.opts
    }

    fn start(&self) -> Result<()> {
        if self.shared.state.read().running.is_some() {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current()?;

        let mut state = self.shared.state.write();
        if state.running.is_some() {
            return Ok(());
        }

        let span = self.shared.span.clone();
        span.in_scope(|| info!("link start"));
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let running = Running {
            stop: CancellationToken::new(),
            quit: CancellationToken::new(),
            err_tx,
        };
        runtime.spawn(
            repair(self.shared.clone(), err_rx, running.quit.clone()).instrument(span.clone()),
        );
        runtime.spawn(
            launch(
                self.shared.engine.clone(),
                state.config.clone(),
                running.stop.clone(),
                running.err_tx.clone(),
            )
            .instrument(span),
        );
        state.running = Some(running);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.shared.state.read().running.is_none() {
            return Ok(());
        }

        let mut state = self.shared.state.write();
        let Some(running) = state.running.take() else {
            return Ok(());
        };

        self.shared.span.in_scope(|| info!("link stop"));
        running.quit.cancel();
        running.stop.cancel();
        Ok(())
    }
}

/// Runs the engine once and reports how it ended. A panic inside the engine
/// is reported as an error so that it triggers a repair.
async fn launch(
    engine: Arc<dyn TunnelEngine>,
    config: TunnelConfig,
    stop: CancellationToken,
    err_tx: mpsc::UnboundedSender<Result<()>>,
) {
    let result = AssertUnwindSafe(async move { engine.run(config, stop).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(Error::tunnel_panic(panic_message(panic.as_ref()))));
    // the receiver is gone once the link was stopped
    let _ = err_tx.send(result);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn repair(
    shared: Arc<Shared>,
    mut err_rx: mpsc::UnboundedReceiver<Result<()>>,
    quit: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = quit.cancelled() => return,
            result = err_rx.recv() => match result {
                Some(result) => result,
                None => return,
            },
        };
        let Err(err) = result else {
            continue;
        };

        error!("link exited with error '{err}', repairing ...");
        let delay = jitter(REPAIR_DELAY, REPAIR_JITTER);
        info!("link repair starts in {delay:?}");

        tokio::select! {
            _ = quit.cancelled() => {
                info!("link repair canceled, stop detected.");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if !relaunch(&shared, &quit) {
            info!("link repair canceled, stop detected.");
            return;
        }
    }
}

/// Restarts the engine with a fresh client id unless the link was stopped
/// since `quit` was handed out.
fn relaunch(shared: &Shared, quit: &CancellationToken) -> bool {
    let mut guard = shared.state.write();
    let state = &mut *guard;
    let Some(running) = state.running.as_mut().filter(|_| !quit.is_cancelled()) else {
        return false;
    };

    running.stop.cancel();
    running.stop = CancellationToken::new();
    state.config.client_id = random_client_id();
    tokio::spawn(
        launch(
            shared.engine.clone(),
            state.config.clone(),
            running.stop.clone(),
            running.err_tx.clone(),
        )
        .instrument(shared.span.clone()),
    );
    true
}

/// A duration uniformly drawn from `[base, base + base * max_factor)`.
fn jitter(base: Duration, max_factor: f64) -> Duration {
    let max_factor = if max_factor <= 0.0 { 1.0 } else { max_factor };
    base + base.mul_f64(max_factor * rand::thread_rng().gen::<f64>())
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::controllers::tunnel::Resource;

    fn rule() -> TunnelRule {
        TunnelRule {
            service: Resource::new("unit", "svc-a"),
            secret: Resource::new("unit", "sec-a"),
            host: "a.unit.com".to_string(),
            port: 8080,
        }
    }

    fn link(engine: Arc<MockEngine>) -> SyncTunnelLink {
        SyncTunnelLink::new(rule(), b"sec-a-data".to_vec(), TunnelOptions::default(), engine)
    }

    #[test]
    fn equal_compares_host_origin_options_and_cert() {
        let engine = MockEngine::failing(0);
        let base = link(engine.clone());
        assert!(base.equal(&link(engine.clone())));

        let other_secret = SyncTunnelLink::new(
            TunnelRule {
                secret: Resource::new("unit", "sec-b"),
                ..rule()
            },
            b"sec-a-data".to_vec(),
            TunnelOptions::default(),
            engine.clone(),
        );
        assert!(base.equal(&other_secret));

        let other_host = SyncTunnelLink::new(
            TunnelRule {
                host: "b.unit.com".to_string(),
                ..rule()
            },
            b"sec-a-data".to_vec(),
            TunnelOptions::default(),
            engine.clone(),
        );
        let other_port = SyncTunnelLink::new(
            TunnelRule {
                port: 8081,
                ..rule()
            },
            b"sec-a-data".to_vec(),
            TunnelOptions::default(),
            engine.clone(),
        );
        let other_options = SyncTunnelLink::new(
            rule(),
            b"sec-a-data".to_vec(),
            TunnelOptions {
                retries: 1,
                ..Default::default()
            },
            engine.clone(),
        );
        let other_cert = SyncTunnelLink::new(
            rule(),
            b"sec-b-data".to_vec(),
            TunnelOptions::default(),
            engine,
        );
        for other in [&other_host, &other_port, &other_options, &other_cert] {
            assert!(!base.equal(other), "{other:?}");
            assert!(!other.equal(&base), "{other:?}");
        }
    }

    #[test]
    fn start_outside_runtime_fails() {
        let link = link(MockEngine::failing(0));
        assert!(link.start().is_err());
        assert!(link.stop().is_ok());
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let delay = jitter(REPAIR_DELAY, REPAIR_JITTER);
            assert!(delay >= REPAIR_DELAY && delay < REPAIR_DELAY * 2, "{delay:?}");
        }
        assert!(jitter(REPAIR_DELAY, 0.0) < REPAIR_DELAY * 2);
    }

    #[tokio::test]
    async fn start_twice_launches_once() {
        let engine = MockEngine::failing(0);
        let link = link(engine.clone());
        link.start().unwrap();
        link.start().unwrap();
        wait_for(|| engine.runs() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.runs(), 1);

        link.stop().unwrap();
        link.stop().unwrap();
        wait_for(|| engine.stopped() == 1).await;
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let engine = MockEngine::failing(0);
        link(engine.clone()).stop().unwrap();
        assert_eq!(engine.runs(), 0);
    }

    #[tokio::test]
    async fn repairs_with_fresh_client_id() {
        let engine = MockEngine::failing(2);
        let link = link(engine.clone());
        link.start().unwrap();
        wait_for(|| engine.runs() == 3).await;

        let mut ids = engine.client_ids.lock().clone();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        link.stop().unwrap();
        wait_for(|| engine.stopped() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.runs(), 3);
    }

    #[tokio::test]
    async fn repairs_after_panic() {
        let engine = MockEngine::panicking(1);
        let link = link(engine.clone());
        link.start().unwrap();
        wait_for(|| engine.runs() == 2).await;
        link.stop().unwrap();
        wait_for(|| engine.stopped() == 1).await;
    }

    #[tokio::test]
    async fn stop_preempts_repair() {
        let engine = MockEngine::failing(usize::MAX);
        let link = link(engine.clone());
        link.start().unwrap();
        wait_for(|| engine.runs() >= 2).await;
        link.stop().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let runs = engine.runs();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.runs(), runs);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let engine = MockEngine::failing(0);
        let link = link(engine.clone());
        link.start().unwrap();
        wait_for(|| engine.runs() == 1).await;
        link.stop().unwrap();
        wait_for(|| engine.stopped() == 1).await;

        link.start().unwrap();
        wait_for(|| engine.runs() == 2).await;
        link.stop().unwrap();
        wait_for(|| engine.stopped() == 2).await;
    }
}
