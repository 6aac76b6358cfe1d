// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! OmnitelK exporter session.
//!
//! The exporter accepts OTLP trace requests, flattens them into span records
//! and pushes them onto a bounded ingestion queue. A background session task
//! keeps a control connection open, fetches the shard assignment, installs it
//! in the [`Router`] and then starts draining the queue into the router.
//!
//! ```text
//! Disconnected -> Connecting -> Assigning -> Active -> Stopped
//!                     ^             |          |
//!                     +-------------+----------+  (fetch failure)
//! ```
//!
//! Spans exported before the first assignment wait in the queue. `export`
//! blocks while the queue is full.

use crate::backoff::ExponentialBackoff;
use crate::config::Config;
use crate::control_plane::{ControlPlane, GrpcControlPlane, ShardingConfigSource};
use crate::error::{Error, Result};
use crate::metrics::EventSink;
use crate::proto::{ShardingConfig, SpanRecord};
use crate::router::{Router, RouterSettings};
use crate::shard_map::ShardMap;
use crate::sink::RecordSink;
use crate::translate;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of the control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not started.
    Disconnected,
    /// Opening the control connection, possibly after a backoff.
    Connecting,
    /// Connected, waiting for the sharding config.
    Assigning,
    /// A shard map is installed and the queue is being drained.
    Active,
    /// Stopped. Terminal.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Assigning => "assigning",
            SessionState::Active => "active",
            SessionState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Sharded trace exporter.
pub struct OmnitelkExporter {
    shared: Arc<Shared>,
    session_task: Mutex<Option<JoinHandle<()>>>,
    stop_lock: tokio::sync::Mutex<()>,
}

/// State reachable from the session and drain tasks.
struct Shared {
    config: Config,
    control_plane: Arc<dyn ControlPlane>,
    router: Arc<Router>,
    events: Arc<dyn EventSink>,
    /// Taken on stop, which closes the queue.
    span_tx: RwLock<Option<flume::Sender<SpanRecord>>>,
    /// Taken by the drain task when the first map is installed.
    span_rx: Mutex<Option<flume::Receiver<SpanRecord>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl OmnitelkExporter {
    /// Create an exporter. Nothing runs until [`OmnitelkExporter::start`].
    ///
    /// # Arguments
    ///
    /// * `config` - Exporter configuration, validated here.
    /// * `control_plane` - Source of the shard assignment.
    /// * `sink` - Destination of the encoded records.
    /// * `events` - Receiver of pipeline events.
    pub fn new(
        config: Config,
        control_plane: Arc<dyn ControlPlane>,
        sink: Arc<dyn RecordSink>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(Router::new(
            RouterSettings::from(&config),
            sink,
            Arc::clone(&events),
        ));
        let (span_tx, span_rx) = flume::bounded(config.queue_size);
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                control_plane,
                router,
                events,
                span_tx: RwLock::new(Some(span_tx)),
                span_rx: Mutex::new(Some(span_rx)),
                drain_task: Mutex::new(None),
                state_tx,
                shutdown_tx,
            }),
            session_task: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create an exporter that fetches its assignment over gRPC from
    /// `config.endpoint`.
    pub fn with_grpc_control_plane(
        config: Config,
        sink: Arc<dyn RecordSink>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let control_plane = Arc::new(GrpcControlPlane::new(config.endpoint.clone()));
        Self::new(config, control_plane, sink, events)
    }

    /// Exporter configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Shard map currently installed in the router.
    pub fn shard_map(&self) -> ShardMap {
        self.shared.router.shard_map()
    }

    /// Spawn the session task. Must be called from a tokio runtime.
    ///
    /// Starting twice has no effect; starting after stop fails.
    pub fn start(&self) -> Result<()> {
        let mut session_task = self
            .session_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state() == SessionState::Stopped || *self.shared.shutdown_tx.borrow() {
            return Err(Error::PipelineStopped);
        }
        if session_task.is_some() {
            return Ok(());
        }

        tracing::info!(
            name = %self.shared.config.name,
            endpoint = %self.shared.control_plane.endpoint(),
            max_in_flight_spans = self.shared.config.max_in_flight_spans,
            "Starting OmnitelK exporter"
        );
        let shutdown_rx = self.shared.shutdown_tx.subscribe();
        *session_task = Some(tokio::spawn(run_session(
            Arc::clone(&self.shared),
            shutdown_rx,
        )));
        Ok(())
    }

    /// Accept a trace request.
    ///
    /// A request that cannot be translated is rejected as a whole. Otherwise
    /// every span is queued, waiting for room when the queue is full.
    /// Routing problems of individual spans are reported as events, not
    /// returned here.
    pub async fn export(&self, request: ExportTraceServiceRequest) -> Result<()> {
        let records = translate::flatten_request(request)?;
        let span_tx = self
            .shared
            .span_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::PipelineStopped)?;

        for record in records {
            span_tx
                .send_async(record)
                .await
                .map_err(|_| Error::PipelineStopped)?;
        }
        Ok(())
    }

    /// Stop the exporter.
    ///
    /// Closes the ingestion queue, routes whatever the drain task still finds
    /// in it, flushes every shard buffer and joins the background tasks.
    /// Spans still queued when no shard map was ever installed are discarded.
    /// Safe to call in any state and more than once.
    pub async fn stop(&self) {
        let _stop = self.stop_lock.lock().await;
        if self.state() == SessionState::Stopped {
            return;
        }
        tracing::info!(
            name = %self.shared.config.name,
            state = %self.state(),
            "Stopping OmnitelK exporter"
        );

        let _ = self.shared.shutdown_tx.send_replace(true);
        drop(
            self.shared
                .span_tx
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let session_task = self
            .session_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session_task) = session_task {
            if let Err(e) = session_task.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }

        // The session task is gone, so the drain can no longer be started.
        let undrained = self
            .shared
            .span_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(span_rx) = undrained {
            if !span_rx.is_empty() {
                tracing::warn!(
                    spans = span_rx.len(),
                    "Discarding spans queued before any shard map was installed"
                );
            }
        }

        let drain_task = self
            .shared
            .drain_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(drain_task) = drain_task {
            if let Err(e) = drain_task.await {
                tracing::warn!(error = %e, "Drain task ended abnormally");
            }
        }

        self.shared.router.stop().await;
        self.shared.set_state(SessionState::Stopped);
        tracing::info!(name = %self.shared.config.name, "OmnitelK exporter stopped");
    }
}

impl Drop for OmnitelkExporter {
    fn drop(&mut self) {
        // Lets a session task that was never stopped exit on its own.
        let _ = self.shared.shutdown_tx.send_replace(true);
    }
}

impl Shared {
    /// Move to `state`. Nothing leaves `Stopped`.
    fn set_state(&self, state: SessionState) {
        let mut previous = state;
        let _ = self.state_tx.send_if_modified(|current| {
            previous = *current;
            if *current == state || *current == SessionState::Stopped {
                return false;
            }
            *current = state;
            true
        });
        if previous != state && previous != SessionState::Stopped {
            tracing::debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    /// Install a sharding config unless it matches the active map.
    async fn install(&self, config: ShardingConfig) -> Result<()> {
        let map = ShardMap::from_definitions(&config.shard_definitions)?;
        if !map.is_empty() && map == self.router.shard_map() {
            tracing::debug!(shards = map.len(), "Sharding config unchanged");
            return Ok(());
        }
        self.router.set_shard_map(map).await
    }

    /// Start draining the ingestion queue into the router. Only the first
    /// call has an effect.
    fn start_drain(&self) {
        let span_rx = self
            .span_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(span_rx) = span_rx {
            let handle = tokio::spawn(drain_queue(Arc::clone(&self.router), span_rx));
            *self
                .drain_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }
}

/// Why an active session ended.
enum SessionEnd {
    Shutdown,
    Reconnect,
}

async fn run_session(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let endpoint = shared.control_plane.endpoint().to_string();
    let mut backoff =
        ExponentialBackoff::new(shared.config.initial_backoff, shared.config.max_backoff);

    loop {
        shared.set_state(SessionState::Connecting);
        let Some(connected) = until_shutdown(&mut shutdown_rx, shared.control_plane.connect()).await
        else {
            return;
        };
        let mut source = match connected {
            Ok(source) => {
                tracing::info!(endpoint = %endpoint, "Connected to control plane");
                source
            }
            Err(e) => {
                shared.events.connect_failed(&endpoint);
                let delay = backoff.next_delay();
                tracing::warn!(
                    endpoint = %endpoint,
                    error = %e,
                    retry_in = ?delay,
                    "Control plane connection failed"
                );
                if sleep_until_shutdown(&mut shutdown_rx, delay).await {
                    return;
                }
                continue;
            }
        };

        shared.set_state(SessionState::Assigning);
        let Some(fetched) = fetch_and_install(&shared, source.as_mut(), &mut shutdown_rx).await
        else {
            return;
        };
        if let Err(e) = fetched {
            shared.events.assignment_fetch_failed();
            let delay = backoff.next_delay();
            tracing::warn!(
                endpoint = %endpoint,
                error = %e,
                retry_in = ?delay,
                "Failed to obtain shard assignment, reconnecting"
            );
            if sleep_until_shutdown(&mut shutdown_rx, delay).await {
                return;
            }
            continue;
        }

        backoff.reset();
        shared.set_state(SessionState::Active);
        shared.start_drain();
        tracing::info!(
            endpoint = %endpoint,
            shards = shared.router.shard_map().len(),
            "Session active"
        );

        match stay_active(&shared, source.as_mut(), &mut shutdown_rx).await {
            SessionEnd::Shutdown => return,
            SessionEnd::Reconnect => {
                let delay = backoff.next_delay();
                if sleep_until_shutdown(&mut shutdown_rx, delay).await {
                    return;
                }
            }
        }
    }
}

/// Fetch the assignment and install it. Only the fetch is abandoned on
/// shutdown; an install always runs to completion.
async fn fetch_and_install(
    shared: &Shared,
    source: &mut dyn ShardingConfigSource,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Result<()>> {
    match until_shutdown(shutdown_rx, source.fetch_sharding_config()).await? {
        Ok(config) => Some(shared.install(config).await),
        Err(e) => Some(Err(e)),
    }
}

/// Wait for shutdown, re-fetching the assignment every refresh interval if
/// one is configured. The installed map stays in effect on reconnect.
async fn stay_active(
    shared: &Shared,
    source: &mut dyn ShardingConfigSource,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let Some(refresh_interval) = shared.config.refresh_interval else {
        shutdown_signalled(shutdown_rx).await;
        return SessionEnd::Shutdown;
    };

    loop {
        if sleep_until_shutdown(shutdown_rx, refresh_interval).await {
            return SessionEnd::Shutdown;
        }
        let Some(refreshed) = fetch_and_install(shared, source, shutdown_rx).await else {
            return SessionEnd::Shutdown;
        };
        match refreshed {
            Ok(()) => {}
            Err(Error::PipelineStopped) => return SessionEnd::Shutdown,
            Err(e) => {
                shared.events.assignment_fetch_failed();
                tracing::warn!(error = %e, "Shard assignment refresh failed, reconnecting");
                return SessionEnd::Reconnect;
            }
        }
    }
}

/// Resolves once shutdown is signalled or the exporter is gone.
async fn shutdown_signalled(shutdown_rx: &mut watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run `future` unless shutdown is signalled first.
async fn until_shutdown<F: Future>(
    shutdown_rx: &mut watch::Receiver<bool>,
    future: F,
) -> Option<F::Output> {
    if *shutdown_rx.borrow() {
        return None;
    }
    tokio::select! {
        () = shutdown_signalled(shutdown_rx) => None,
        output = future => Some(output),
    }
}

/// Sleep for `delay`. Returns true if shutdown was signalled meanwhile.
async fn sleep_until_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    until_shutdown(shutdown_rx, tokio::time::sleep(delay))
        .await
        .is_none()
}

async fn drain_queue(router: Arc<Router>, span_rx: flume::Receiver<SpanRecord>) {
    // Ends once the queue is closed and empty.
    while let Ok(record) = span_rx.recv_async().await {
        if let Err(e) = router.dispatch(record).await {
            tracing::warn!(
                error = %e,
                remaining = span_rx.len(),
                "Router refused span, stopping drain"
            );
            break;
        }
    }
    tracing::debug!("Ingestion queue drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopEvents;
    use crate::sink::create_record_channel;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl ControlPlane for Unreachable {
        fn endpoint(&self) -> &str {
            "unreachable"
        }

        async fn connect(&self) -> Result<Box<dyn ShardingConfigSource>> {
            Err(Error::Connection {
                endpoint: "unreachable".into(),
                message: "refused".into(),
            })
        }
    }

    fn exporter() -> OmnitelkExporter {
        let (sender, _receiver) = create_record_channel(4);
        OmnitelkExporter::new(
            Config::new("unreachable"),
            Arc::new(Unreachable),
            Arc::new(sender),
            Arc::new(NoopEvents),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (sender, _receiver) = create_record_channel(4);
        let result = OmnitelkExporter::new(
            Config::new("x").with_queue_size(0),
            Arc::new(Unreachable),
            Arc::new(sender),
            Arc::new(NoopEvents),
        );
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_stop_from_disconnected() {
        let exporter = exporter();
        assert_eq!(exporter.state(), SessionState::Disconnected);

        exporter.stop().await;
        assert_eq!(exporter.state(), SessionState::Stopped);
        exporter.stop().await;
        assert_eq!(exporter.state(), SessionState::Stopped);

        assert!(matches!(exporter.start(), Err(Error::PipelineStopped)));
        assert!(matches!(
            exporter.export(ExportTraceServiceRequest::default()).await,
            Err(Error::PipelineStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let exporter = exporter();
        let mut states = exporter.subscribe_state();
        exporter.start().unwrap();
        exporter.start().unwrap();

        let _ = states
            .wait_for(|state| *state == SessionState::Connecting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(exporter.state(), SessionState::Connecting);

        exporter.stop().await;
        assert_eq!(exporter.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_is_terminal() {
        let exporter = exporter();
        exporter.shared.set_state(SessionState::Connecting);
        exporter.stop().await;

        // A session task that outlived stop cannot revive the state.
        exporter.shared.set_state(SessionState::Connecting);
        exporter.shared.set_state(SessionState::Active);
        assert_eq!(exporter.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_start_refused_once_shutdown_signalled() {
        let exporter = exporter();
        // Shutdown is signalled before stop publishes the Stopped state.
        let _ = exporter.shared.shutdown_tx.send_replace(true);
        assert_eq!(exporter.state(), SessionState::Disconnected);

        assert!(matches!(exporter.start(), Err(Error::PipelineStopped)));
        assert!(exporter
            .session_task
            .lock()
            .unwrap()
            .is_none());
        exporter.stop().await;
        assert_eq!(exporter.state(), SessionState::Stopped);
    }

    #[test]
    fn test_session_state_labels() {
        assert_eq!(SessionState::Assigning.to_string(), "assigning");
        assert_eq!(SessionState::Stopped.to_string(), "stopped");
    }
}
