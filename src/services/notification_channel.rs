//! Push notification channel
//!
//! A single task owns the connection and drives an explicit state machine:
//! connect attempt, open stream, reconnect backoff. The notification hide
//! deadline and the shutdown signal are raced against whichever phase is
//! active, so teardown cancels every pending timer.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::adapters::{push_url, PushConnector, PushFrame, PushStream};
use crate::config::AppConfig;
use crate::domain::{ChannelEvent, ChannelState, ChannelView, ConnectivityBanner, NotificationEvent};
use crate::error::{OpsdeckError, Result};

const BANNER_MESSAGE: &str = "Lost connection to the notification service. Reconnecting...";
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct NotificationChannelConfig {
    /// Wait between a disconnect and the next connection attempt
    pub reconnect_delay: Duration,
    /// How long a notification stays visible
    pub display_window: Duration,
}

impl Default for NotificationChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            display_window: Duration::from_secs(5),
        }
    }
}

impl From<&AppConfig> for NotificationChannelConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            reconnect_delay: config.notify.reconnect_delay(),
            display_window: config.notify.display_window(),
        }
    }
}

pub struct NotificationChannel {
    /// Push endpoint, or the reason none could be derived
    target: std::result::Result<Url, String>,
    connector: Arc<dyn PushConnector>,
    config: NotificationChannelConfig,
    view_tx: Arc<watch::Sender<ChannelView>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    config_error_reported: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationChannel {
    pub fn new(
        base_url: Option<Url>,
        connector: Arc<dyn PushConnector>,
        config: NotificationChannelConfig,
    ) -> Self {
        let target = base_url
            .ok_or_else(|| OpsdeckError::Configuration("backend base address is not set".into()))
            .and_then(|base| push_url(&base))
            .map_err(|e| e.operator_message());
        Self::with_target(target, connector, config)
    }

    pub fn from_config(config: &AppConfig, connector: Arc<dyn PushConnector>) -> Self {
        let target = config
            .base_url()
            .and_then(|base| push_url(&base))
            .map_err(|e| e.operator_message());
        Self::with_target(target, connector, NotificationChannelConfig::from(config))
    }

    fn with_target(
        target: std::result::Result<Url, String>,
        connector: Arc<dyn PushConnector>,
        config: NotificationChannelConfig,
    ) -> Self {
        let (view_tx, _) = watch::channel(ChannelView::default());
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            target,
            connector,
            config,
            view_tx: Arc::new(view_tx),
            events_tx,
            config_error_reported: false,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Push endpoint this channel connects to
    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref().ok()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelView> {
        self.view_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events_tx.subscribe()
    }

    pub fn view(&self) -> ChannelView {
        self.view_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start connecting. Without a usable base address nothing is attempted
    /// and the configuration error is reported on the first call only.
    pub fn start(&mut self) -> Result<()> {
        let target = match &self.target {
            Ok(url) => url.clone(),
            Err(reason) => {
                if !self.config_error_reported {
                    self.config_error_reported = true;
                    error!("Push channel disabled: {}", reason);
                    let _ = self
                        .events_tx
                        .send(ChannelEvent::ConfigurationError(reason.clone()));
                }
                return Err(OpsdeckError::Configuration(reason.clone()));
            }
        };

        if self.is_running() {
            return Err(OpsdeckError::InvalidState(
                "notification channel already running".to_string(),
            ));
        }
        if self.view_tx.borrow().state.is_terminal() {
            return Err(OpsdeckError::InvalidState(
                "notification channel was shut down".to_string(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ChannelTask {
            target,
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            view_tx: Arc::clone(&self.view_tx),
            events_tx: self.events_tx.clone(),
            seq: 0,
            hide_at: None,
        };
        self.handle = Some(tokio::spawn(task.run(shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Close the connection and cancel reconnect and hide timers
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Notification channel task ended abnormally: {}", e);
            }
        }
        // The task may have stopped on its own (credential rejected)
        let finished = self.view_tx.send_if_modified(|view| {
            if view.state.is_terminal() {
                return false;
            }
            view.state = ChannelState::Shutdown;
            view.notification = None;
            true
        });
        if finished {
            let _ = self
                .events_tx
                .send(ChannelEvent::StateChanged(ChannelState::Shutdown));
        }
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

type ConnectAttempt = Pin<Box<dyn Future<Output = Result<Box<dyn PushStream>>> + Send>>;

enum Phase {
    Connecting(ConnectAttempt),
    Open(Box<dyn PushStream>),
    Backoff(Instant),
}

enum Step {
    Shutdown,
    Expire,
    Connected(Result<Box<dyn PushStream>>),
    Frame(PushFrame),
    Retry,
}

struct ChannelTask {
    target: Url,
    connector: Arc<dyn PushConnector>,
    config: NotificationChannelConfig,
    view_tx: Arc<watch::Sender<ChannelView>>,
    events_tx: broadcast::Sender<ChannelEvent>,
    seq: u64,
    hide_at: Option<Instant>,
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ChannelTask {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting notification channel: {}", self.target);
        let mut phase = self.connect();

        loop {
            let hide_at = self.hide_at;
            let step = match &mut phase {
                Phase::Connecting(attempt) => tokio::select! {
                    _ = shutdown.changed() => Step::Shutdown,
                    _ = deadline(hide_at) => Step::Expire,
                    result = attempt => Step::Connected(result),
                },
                Phase::Open(stream) => tokio::select! {
                    _ = shutdown.changed() => Step::Shutdown,
                    _ = deadline(hide_at) => Step::Expire,
                    frame = stream.next_frame() => Step::Frame(frame),
                },
                Phase::Backoff(at) => {
                    let at = *at;
                    tokio::select! {
                        _ = shutdown.changed() => Step::Shutdown,
                        _ = deadline(hide_at) => Step::Expire,
                        _ = sleep_until(at) => Step::Retry,
                    }
                }
            };

            match step {
                Step::Shutdown => {
                    if let Phase::Open(stream) = &mut phase {
                        stream.close().await;
                    }
                    self.shut_down();
                    return;
                }
                Step::Expire => self.expire(),
                Step::Connected(Ok(stream)) => {
                    self.on_connected();
                    phase = Phase::Open(stream);
                }
                Step::Connected(Err(OpsdeckError::Unauthenticated(reason))) => {
                    self.on_rejected(reason);
                    return;
                }
                Step::Connected(Err(e)) => {
                    phase = self.on_lost(ChannelState::Errored, &e.operator_message(), true);
                }
                Step::Frame(PushFrame::Text(text)) => self.show(text),
                Step::Frame(PushFrame::Closed { clean }) => {
                    phase = self.on_lost(ChannelState::Closed, "connection closed", !clean);
                }
                Step::Frame(PushFrame::Failed(reason)) => {
                    phase = self.on_lost(ChannelState::Errored, &reason, true);
                }
                Step::Retry => phase = self.connect(),
            }
        }
    }

    fn emit(&self, event: ChannelEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn set_state(&self, target: ChannelState) {
        let changed = self.view_tx.send_if_modified(|view| {
            if view.state.can_transition_to(target) {
                view.state = target;
                true
            } else {
                debug!("Ignoring channel transition {} -> {}", view.state, target);
                false
            }
        });
        if changed {
            self.emit(ChannelEvent::StateChanged(target));
        }
    }

    fn connect(&self) -> Phase {
        self.set_state(ChannelState::Connecting);
        let connector = Arc::clone(&self.connector);
        let target = self.target.clone();
        Phase::Connecting(Box::pin(async move { connector.connect(&target).await }))
    }

    fn on_connected(&self) {
        info!("Push channel connected");
        self.set_state(ChannelState::Connected);
        let cleared = self
            .view_tx
            .send_if_modified(|view| view.banner.take().is_some());
        if cleared {
            info!("Push channel recovered");
            self.emit(ChannelEvent::BannerCleared);
        }
    }

    /// Record a disconnect and schedule the next attempt
    fn on_lost(&self, state: ChannelState, reason: &str, raise_banner: bool) -> Phase {
        self.set_state(state);
        if raise_banner {
            self.raise_banner(reason);
        } else {
            debug!("Push channel closed cleanly");
        }
        debug!("Reconnecting push channel in {:?}", self.config.reconnect_delay);
        Phase::Backoff(Instant::now() + self.config.reconnect_delay)
    }

    /// Retrying with the same credential would be refused again, so the
    /// task ends here and a later `start` resumes.
    fn on_rejected(&mut self, reason: String) {
        warn!("Push channel credential rejected, not reconnecting: {}", reason);
        self.hide_at = None;
        self.set_state(ChannelState::Rejected);
        self.view_tx.send_modify(|view| view.notification = None);
        self.emit(ChannelEvent::CredentialRejected(reason));
    }

    /// At most one banner per disconnect episode
    fn raise_banner(&self, reason: &str) {
        let mut raised = None;
        self.view_tx.send_if_modified(|view| {
            if view.banner.is_some() {
                return false;
            }
            let banner = ConnectivityBanner {
                message: BANNER_MESSAGE.to_string(),
                raised_at: Utc::now(),
            };
            view.banner = Some(banner.clone());
            raised = Some(banner);
            true
        });
        match raised {
            Some(banner) => {
                warn!("Push channel down: {}", reason);
                self.emit(ChannelEvent::BannerRaised(banner));
            }
            None => debug!("Push channel still down: {}", reason),
        }
    }

    /// A new notification replaces the visible one and restarts the window
    fn show(&mut self, text: String) {
        self.seq += 1;
        let event = NotificationEvent {
            seq: self.seq,
            text,
            received_at: Utc::now(),
        };
        debug!("Notification #{}: {}", event.seq, event.text);
        self.hide_at = Some(Instant::now() + self.config.display_window);
        self.view_tx.send_modify(|view| view.notification = Some(event.clone()));
        self.emit(ChannelEvent::Notification(event));
    }

    fn expire(&mut self) {
        self.hide_at = None;
        let mut hidden = None;
        self.view_tx.send_if_modified(|view| {
            hidden = view.notification.take().map(|n| n.seq);
            hidden.is_some()
        });
        if let Some(seq) = hidden {
            self.emit(ChannelEvent::Expired(seq));
        }
    }

    fn shut_down(&mut self) {
        self.hide_at = None;
        self.view_tx.send_modify(|view| {
            view.state = ChannelState::Shutdown;
            view.notification = None;
        });
        self.emit(ChannelEvent::StateChanged(ChannelState::Shutdown));
        info!("Notification channel shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct FakeStream {
        frames: mpsc::UnboundedReceiver<PushFrame>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PushStream for FakeStream {
        async fn next_frame(&mut self) -> PushFrame {
            self.frames
                .recv()
                .await
                .unwrap_or(PushFrame::Closed { clean: false })
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Connection attempts are served from a script; an empty script refuses
    #[derive(Default)]
    struct FakeConnector {
        script: Mutex<VecDeque<Option<FakeStream>>>,
        attempts: AtomicUsize,
        /// Attempts answered with a credential rejection before the script
        rejections: AtomicUsize,
        targets: Mutex<Vec<Url>>,
        closed: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn refuse(&self) {
            self.script.lock().unwrap().push_back(None);
        }

        fn reject(&self) {
            self.rejections.fetch_add(1, Ordering::SeqCst);
        }

        fn accept(&self) -> mpsc::UnboundedSender<PushFrame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.script.lock().unwrap().push_back(Some(FakeStream {
                frames: rx,
                closed: Arc::clone(&self.closed),
            }));
            tx
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushConnector for FakeConnector {
        async fn connect(&self, url: &Url) -> Result<Box<dyn PushStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(url.clone());
            let rejected = self
                .rejections
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if rejected {
                return Err(OpsdeckError::Unauthenticated("HTTP 401: invalid token".into()));
            }
            let next = self.script.lock().unwrap().pop_front().flatten();
            match next {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(OpsdeckError::Transport("connection refused".into())),
            }
        }
    }

    fn channel(connector: &Arc<FakeConnector>) -> NotificationChannel {
        NotificationChannel::new(
            Some(Url::parse("http://localhost:8000").unwrap()),
            connector.clone(),
            NotificationChannelConfig::default(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_notification_replaces_visible_one() {
        let connector = Arc::new(FakeConnector::default());
        let frames = connector.accept();
        let mut ch = channel(&connector);
        ch.start().unwrap();
        settle().await;
        assert_eq!(ch.view().state, ChannelState::Connected);

        frames.send(PushFrame::Text("host-1 disk full".into())).unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        frames.send(PushFrame::Text("host-3 CPU high".into())).unwrap();
        settle().await;

        let shown = ch.view().notification.unwrap();
        assert_eq!(shown.text, "host-3 CPU high");
        assert_eq!(shown.seq, 2);

        // The first notification's deadline no longer applies
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(ch.view().notification.unwrap().text, "host-3 CPU high");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(ch.view().notification.is_none());

        ch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_storm_raises_one_banner() {
        let connector = Arc::new(FakeConnector::default());
        connector.refuse();
        connector.refuse();
        connector.refuse();
        let _frames = connector.accept();

        let mut ch = channel(&connector);
        let mut events = ch.events();
        ch.start().unwrap();

        settle().await;
        assert_eq!(ch.view().state, ChannelState::Errored);
        assert!(ch.view().banner.is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 4);
        let view = ch.view();
        assert_eq!(view.state, ChannelState::Connected);
        assert!(view.banner.is_none());

        let events = drain(&mut events);
        let raised = events
            .iter()
            .filter(|e| matches!(e, ChannelEvent::BannerRaised(_)))
            .count();
        assert_eq!(raised, 1);
        assert_eq!(events.iter().filter(|e| **e == ChannelEvent::BannerCleared).count(), 1);

        // Same target on every attempt
        let targets = connector.targets.lock().unwrap().clone();
        assert!(targets.iter().all(|t| t.as_str() == "ws://localhost:8000/ws/notify"));

        ch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclean_close_starts_new_episode() {
        let connector = Arc::new(FakeConnector::default());
        let first = connector.accept();
        let second = connector.accept();
        let _third = connector.accept();

        let mut ch = channel(&connector);
        let mut events = ch.events();
        ch.start().unwrap();
        settle().await;

        first.send(PushFrame::Closed { clean: true }).unwrap();
        settle().await;
        assert_eq!(ch.view().state, ChannelState::Closed);
        assert!(ch.view().banner.is_none());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(ch.view().state, ChannelState::Connected);

        second.send(PushFrame::Failed("reset by peer".into())).unwrap();
        settle().await;
        assert!(ch.view().banner.is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(connector.attempts(), 3);
        assert!(ch.view().banner.is_none());

        let raised = drain(&mut events)
            .iter()
            .filter(|e| matches!(e, ChannelEvent::BannerRaised(_)))
            .count();
        assert_eq!(raised, 1);

        ch.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        connector.refuse();
        let mut ch = channel(&connector);
        ch.start().unwrap();
        settle().await;
        assert_eq!(ch.view().state, ChannelState::Errored);

        ch.shutdown().await;
        assert_eq!(ch.view().state, ChannelState::Shutdown);
        assert!(!ch.is_running());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.attempts(), 1);
        assert!(ch.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_open_connection() {
        let connector = Arc::new(FakeConnector::default());
        let frames = connector.accept();
        let mut ch = channel(&connector);
        ch.start().unwrap();
        settle().await;
        frames.send(PushFrame::Text("backup finished".into())).unwrap();
        settle().await;

        ch.shutdown().await;
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
        let view = ch.view();
        assert_eq!(view.state, ChannelState::Shutdown);
        assert!(view.notification.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credential_stops_reconnecting() {
        let connector = Arc::new(FakeConnector::default());
        connector.reject();
        let _frames = connector.accept();

        let mut ch = channel(&connector);
        let mut events = ch.events();
        ch.start().unwrap();
        settle().await;

        assert_eq!(ch.view().state, ChannelState::Rejected);
        assert!(ch.view().banner.is_none());
        assert!(!ch.is_running());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        let rejected = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, ChannelEvent::CredentialRejected(_)))
            .count();
        assert_eq!(rejected, 1);

        // Starting again (after the credential is renewed) resumes
        ch.start().unwrap();
        settle().await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(ch.view().state, ChannelState::Connected);

        ch.shutdown().await;
        assert_eq!(ch.view().state, ChannelState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_after_rejection_is_terminal() {
        let connector = Arc::new(FakeConnector::default());
        connector.reject();
        let mut ch = channel(&connector);
        ch.start().unwrap();
        settle().await;
        assert_eq!(ch.view().state, ChannelState::Rejected);

        ch.shutdown().await;
        assert_eq!(ch.view().state, ChannelState::Shutdown);
        assert!(ch.start().is_err());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_unset_base_reports_configuration_error_once() {
        let connector = Arc::new(FakeConnector::default());
        let mut ch = NotificationChannel::new(
            None,
            connector.clone(),
            NotificationChannelConfig::default(),
        );
        let mut events = ch.events();

        assert!(matches!(ch.start(), Err(OpsdeckError::Configuration(_))));
        assert!(matches!(ch.start(), Err(OpsdeckError::Configuration(_))));
        assert_eq!(connector.attempts(), 0);

        let errors: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, ChannelEvent::ConfigurationError(_)))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(ch.view().state, ChannelState::Idle);
    }
}
