//! Periodic health polling
//!
//! Issues one round of health checks on start and every interval, then
//! replaces the published `StatusBoard` as a whole. Cycles run as their own
//! tasks so a slow round never delays the next tick; a round that completes
//! after a later one has already been published is dropped.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::adapters::{ConsoleBackend, ServiceProbe};
use crate::config::{AppConfig, PollMode};
use crate::domain::{HealthState, ServiceDescriptor, StatusBoard};
use crate::error::{OpsdeckError, Result};

/// Where a cycle gets its health signals from
#[derive(Clone)]
pub enum HealthSource {
    Aggregate(Arc<dyn ConsoleBackend>),
    Grouped(Arc<dyn ConsoleBackend>),
    FanOut(Arc<dyn ServiceProbe>),
}

impl HealthSource {
    pub fn from_mode(
        mode: PollMode,
        backend: Arc<dyn ConsoleBackend>,
        probe: Arc<dyn ServiceProbe>,
    ) -> Self {
        match mode {
            PollMode::Aggregate => HealthSource::Aggregate(backend),
            PollMode::Grouped => HealthSource::Grouped(backend),
            PollMode::FanOut => HealthSource::FanOut(probe),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            HealthSource::Aggregate(_) => "aggregate",
            HealthSource::Grouped(_) => "grouped",
            HealthSource::FanOut(_) => "fan-out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthPollerConfig {
    /// Time between cycle starts
    pub interval: Duration,
    /// Fan-out probe timeout for descriptors without their own
    pub probe_timeout: Duration,
}

impl Default for HealthPollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&AppConfig> for HealthPollerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            interval: config.poller.interval(),
            probe_timeout: config.poller.probe_timeout(),
        }
    }
}

/// Failed cycle, kept until a later cycle succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollFailure {
    pub cycle: u64,
    pub reason: String,
    pub at: chrono::DateTime<Utc>,
}

/// Everything a cycle task needs
#[derive(Clone)]
struct PollContext {
    config: HealthPollerConfig,
    descriptors: Arc<Vec<ServiceDescriptor>>,
    source: HealthSource,
}

impl PollContext {
    async fn collect(&self, cycle: u64) -> Result<StatusBoard> {
        let descriptors = self.descriptors.as_slice();
        match &self.source {
            HealthSource::Aggregate(backend) => {
                let statuses = backend.fetch_statuses().await?;
                Ok(StatusBoard::from_aggregate(cycle, descriptors, &statuses, Utc::now()))
            }
            HealthSource::Grouped(backend) => {
                let grouped = backend.fetch_grouped_statuses().await?;
                Ok(StatusBoard::from_grouped(cycle, descriptors, &grouped, Utc::now()))
            }
            HealthSource::FanOut(probe) => {
                let states = fan_out(probe.as_ref(), descriptors, self.config.probe_timeout).await;
                let mut states = states.into_iter();
                Ok(StatusBoard::build(
                    cycle,
                    descriptors,
                    |_| states.next().unwrap_or(HealthState::Unknown),
                    Utc::now(),
                ))
            }
        }
    }
}

/// Probe every descriptor concurrently, each under its own timeout, so the
/// round is bounded by the slowest timeout rather than their sum. Result
/// order matches `descriptors`.
pub async fn fan_out(
    probe: &dyn ServiceProbe,
    descriptors: &[ServiceDescriptor],
    default_timeout: Duration,
) -> Vec<HealthState> {
    let checks = descriptors.iter().map(|descriptor| async move {
        let Some(url) = descriptor.health_url.as_ref() else {
            return HealthState::Unknown;
        };
        let timeout = descriptor.probe_timeout(default_timeout);
        match tokio::time::timeout(timeout, probe.probe(descriptor, url)).await {
            Ok(Ok(())) => HealthState::Up,
            Ok(Err(e)) => {
                debug!("{} probe failed: {}", descriptor.name, e);
                HealthState::Down
            }
            Err(_) => {
                debug!("{} probe timed out after {:?}", descriptor.name, timeout);
                HealthState::Down
            }
        }
    });
    join_all(checks).await
}

/// Owned poller instance with an explicit start/stop lifecycle
pub struct HealthPoller {
    context: PollContext,
    board_tx: Arc<watch::Sender<Arc<StatusBoard>>>,
    failure_tx: Arc<watch::Sender<Option<PollFailure>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthPoller {
    pub fn new(
        config: HealthPollerConfig,
        descriptors: Vec<ServiceDescriptor>,
        source: HealthSource,
    ) -> Self {
        let (board_tx, _) = watch::channel(Arc::new(StatusBoard::pending(&descriptors)));
        let (failure_tx, _) = watch::channel(None);
        Self {
            context: PollContext {
                config,
                descriptors: Arc::new(descriptors),
                source,
            },
            board_tx: Arc::new(board_tx),
            failure_tx: Arc::new(failure_tx),
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Subscribe to board replacements
    pub fn subscribe(&self) -> watch::Receiver<Arc<StatusBoard>> {
        self.board_tx.subscribe()
    }

    /// Latest published board
    pub fn board(&self) -> Arc<StatusBoard> {
        self.board_tx.borrow().clone()
    }

    pub fn last_failure(&self) -> Option<PollFailure> {
        self.failure_tx.borrow().clone()
    }

    pub fn subscribe_failures(&self) -> watch::Receiver<Option<PollFailure>> {
        self.failure_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Run a single cycle without publishing it
    pub async fn poll_once(&self, cycle: u64) -> Result<StatusBoard> {
        self.context.collect(cycle).await
    }

    /// Start the repeating timer. The first cycle is issued immediately.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(OpsdeckError::InvalidState(
                "health poller already running".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let context = self.context.clone();
        let board_tx = Arc::clone(&self.board_tx);
        let failure_tx = Arc::clone(&self.failure_tx);

        info!(
            "Starting health poller ({} mode, {} services, every {:?})",
            context.source.name(),
            context.descriptors.len(),
            context.config.interval
        );

        self.handle = Some(tokio::spawn(run(context, board_tx, failure_tx, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Cancel the timer and any in-flight cycle. No board update is
    /// published after this returns.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Health poller task ended abnormally: {}", e);
            }
            info!("Health poller stopped");
        }
    }
}

impl Drop for HealthPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    context: PollContext,
    board_tx: Arc<watch::Sender<Arc<StatusBoard>>>,
    failure_tx: Arc<watch::Sender<Option<PollFailure>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(context.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut in_flight: JoinSet<(u64, Result<StatusBoard>)> = JoinSet::new();
    let mut next_cycle: u64 = 1;
    // Highest cycle whose outcome has been applied
    let mut applied: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let cycle = next_cycle;
                next_cycle += 1;
                let ctx = context.clone();
                in_flight.spawn(async move { (cycle, ctx.collect(cycle).await) });
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                let (cycle, outcome) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        warn!("Poll cycle task failed: {}", e);
                        continue;
                    }
                };
                if cycle <= applied {
                    debug!("Dropping superseded poll cycle {}", cycle);
                    continue;
                }
                applied = cycle;
                match outcome {
                    Ok(board) => {
                        let (up, down, unknown) = board.counts();
                        debug!("Poll cycle {}: {} up, {} down, {} unknown", cycle, up, down, unknown);
                        board_tx.send_replace(Arc::new(board));
                        failure_tx.send_if_modified(|f| f.take().is_some());
                    }
                    Err(e) => {
                        // Previous board stays in place
                        if e.is_transport() {
                            warn!("Poll cycle {} failed: {}", cycle, e);
                        } else {
                            error!("Poll cycle {} got an unusable response: {}", cycle, e);
                        }
                        failure_tx.send_replace(Some(PollFailure {
                            cycle,
                            reason: e.operator_message(),
                            at: Utc::now(),
                        }));
                    }
                }
            }
        }
    }

    in_flight.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockConsoleBackend;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn svc(name: &str, category: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, category)
            .with_health_url(Url::parse(&format!("http://{}.local", name.to_lowercase())).unwrap())
    }

    /// Probe whose behaviour is scripted per service name
    struct ScriptedProbe {
        calls: AtomicUsize,
        script: fn(&str, usize) -> ProbeStep,
    }

    enum ProbeStep {
        Up,
        Down,
        Hang,
        After(Duration, bool),
    }

    #[async_trait]
    impl ServiceProbe for ScriptedProbe {
        async fn probe(&self, descriptor: &ServiceDescriptor, _url: &Url) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match (self.script)(&descriptor.name, call) {
                ProbeStep::Up => Ok(()),
                ProbeStep::Down => Err(OpsdeckError::Transport("503".into())),
                ProbeStep::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                ProbeStep::After(delay, up) => {
                    tokio::time::sleep(delay).await;
                    if up {
                        Ok(())
                    } else {
                        Err(OpsdeckError::Transport("503".into()))
                    }
                }
            }
        }
    }

    fn scripted(script: fn(&str, usize) -> ProbeStep) -> Arc<ScriptedProbe> {
        Arc::new(ScriptedProbe {
            calls: AtomicUsize::new(0),
            script,
        })
    }

    #[tokio::test]
    async fn test_aggregate_scenario_missing_service_is_down() {
        let mut backend = MockConsoleBackend::new();
        backend.expect_fetch_statuses().returning(|| {
            let mut m = HashMap::new();
            m.insert("Zabbix".to_string(), true);
            Ok(m)
        });

        let poller = HealthPoller::new(
            HealthPollerConfig::default(),
            vec![svc("Zabbix", "Dashboard"), svc("Grafana", "Dashboard")],
            HealthSource::Aggregate(Arc::new(backend)),
        );
        let board = poller.poll_once(1).await.unwrap();

        let dashboard = board.category("Dashboard").unwrap();
        assert_eq!(dashboard.services[0].name, "Zabbix");
        assert_eq!(dashboard.services[0].state, HealthState::Up);
        assert_eq!(dashboard.services[1].name, "Grafana");
        assert_eq!(dashboard.services[1].state, HealthState::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_bounded_by_slowest_timeout() {
        let probe = scripted(|_, _| ProbeStep::Hang);
        let descriptors = vec![
            svc("Zabbix", "Services").with_timeout(Duration::from_secs(1)),
            svc("Prometheus", "Services").with_timeout(Duration::from_secs(2)),
            svc("Grafana", "Dashboard").with_timeout(Duration::from_secs(3)),
        ];

        let started = tokio::time::Instant::now();
        let states = fan_out(probe.as_ref(), &descriptors, Duration::from_secs(10)).await;
        let elapsed = started.elapsed();

        assert_eq!(states, vec![HealthState::Down; 3]);
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(6), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_isolates_failures_and_unknown() {
        let probe = scripted(|name, _| match name {
            "Zabbix" => ProbeStep::Down,
            _ => ProbeStep::Up,
        });
        let descriptors = vec![
            svc("Zabbix", "Services"),
            svc("Prometheus", "Services"),
            ServiceDescriptor::new("Fluentd", "Logging"),
        ];

        let poller = HealthPoller::new(
            HealthPollerConfig::default(),
            descriptors,
            HealthSource::FanOut(probe.clone()),
        );
        let board = poller.poll_once(1).await.unwrap();

        assert_eq!(board.state_of("Zabbix"), Some(HealthState::Down));
        assert_eq!(board.state_of("Prometheus"), Some(HealthState::Up));
        assert_eq!(board.state_of("Fluentd"), Some(HealthState::Unknown));
        // No URL, no probe
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_keeps_previous_board_and_stop_halts_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut backend = MockConsoleBackend::new();
        backend.expect_fetch_statuses().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut m = HashMap::new();
                m.insert("Zabbix".to_string(), true);
                Ok(m)
            } else {
                Err(OpsdeckError::Transport("connection refused".into()))
            }
        });

        let mut poller = HealthPoller::new(
            HealthPollerConfig {
                interval: Duration::from_secs(10),
                probe_timeout: Duration::from_secs(1),
            },
            vec![svc("Zabbix", "Services"), svc("Grafana", "Dashboard")],
            HealthSource::Aggregate(Arc::new(backend)),
        );
        poller.start().unwrap();
        assert!(poller.start().is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let board = poller.board();
        assert_eq!(board.cycle, 1);
        assert_eq!(board.state_of("Zabbix"), Some(HealthState::Up));
        assert!(poller.last_failure().is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let board = poller.board();
        assert_eq!(board.cycle, 1);
        assert_eq!(board.state_of("Zabbix"), Some(HealthState::Up));
        let failure = poller.last_failure().unwrap();
        assert_eq!(failure.cycle, 2);
        assert_eq!(failure.reason, "connection refused");

        poller.stop().await;
        assert!(!poller.is_running());
        let seen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_cycle_is_dropped() {
        // First probe is slow and down; every later probe is fast and up.
        let probe = scripted(|_, call| {
            if call == 0 {
                ProbeStep::After(Duration::from_millis(2500), false)
            } else {
                ProbeStep::Up
            }
        });

        let mut poller = HealthPoller::new(
            HealthPollerConfig {
                interval: Duration::from_secs(1),
                probe_timeout: Duration::from_secs(5),
            },
            vec![svc("Zabbix", "Services")],
            HealthSource::FanOut(probe),
        );
        let mut boards = poller.subscribe();
        poller.start().unwrap();

        tokio::time::sleep(Duration::from_millis(3200)).await;
        poller.stop().await;

        let board = boards.borrow_and_update().clone();
        assert!(board.cycle >= 3);
        assert_eq!(board.state_of("Zabbix"), Some(HealthState::Up));
    }
}
