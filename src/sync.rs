//! Keeps a [`DashboardSnapshot`] fresh from a [`UsageBackend`].
//!
//! A controller task owns the refresh timer, the optional invalidation subscription and every
//! in-flight fetch cycle. Readers only ever see whole snapshots through a `watch` channel.
//!
//! Cycles may overlap. Each one is tagged with a sequence number when issued and its outcome
//! is applied only if that number is higher than the last applied one, so a slow cycle that
//! finishes after a newer one is dropped instead of overwriting fresher data. A cycle whose
//! task panics is applied the same way, as a failure.

use crate::{
    backend::{BackendQueryError, Invalidation, InvalidationReceiver, UsageBackend},
    usage::{DashboardSnapshot, TimeRange},
};
use anyhow::{Result, anyhow};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, oneshot, watch},
    task::{self, JoinError, JoinHandle, JoinSet},
    time,
};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// What readers see. `snapshot` survives failed cycles; `error` describes the latest one.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub snapshot: Option<Arc<DashboardSnapshot>>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Sequence number of the cycle whose outcome is currently shown.
    pub sequence: u64,
}

enum Command {
    Refresh,
    Subscribe(InvalidationReceiver),
}

type CycleResult = Result<DashboardSnapshot, BackendQueryError>;

/// Cheap, cloneable access to a running controller.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncState>,
}

impl SyncHandle {
    /// Issues one fetch cycle now, regardless of the timer.
    pub fn refresh(&self) {
        if self.commands.send(Command::Refresh).is_err() {
            tracing::debug!("refresh requested after the sync task stopped");
        }
    }

    /// Refreshes on every event from `source` until teardown. Replaces any earlier source.
    pub fn subscribe(&self, source: InvalidationReceiver) {
        if self.commands.send(Command::Subscribe(source)).is_err() {
            tracing::debug!("subscription requested after the sync task stopped");
        }
    }

    pub fn current(&self) -> SyncState {
        self.state.borrow().clone()
    }
}

pub struct SyncController {
    handle: SyncHandle,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl SyncController {
    /// Starts the controller. The first cycle is issued immediately, then one every
    /// `refresh_interval`.
    pub fn spawn<B: UsageBackend>(backend: Arc<B>, refresh_interval: Duration) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SyncState::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let refresh_interval = refresh_interval.max(MIN_REFRESH_INTERVAL);

        let join = tokio::spawn(run(
            Cycles::new(backend, state_tx),
            refresh_interval,
            commands_rx,
            shutdown_rx,
        ));

        Self {
            handle: SyncHandle {
                commands: commands_tx,
                state: state_rx,
            },
            shutdown: Some(shutdown_tx),
            join,
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    pub fn subscribe(&self, source: InvalidationReceiver) {
        self.handle.subscribe(source);
    }

    /// Stops the timer, drops the subscription and aborts outstanding cycles. Handles
    /// cloned from this controller become inert.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join.await.map_err(|err| anyhow!(err))
    }
}

async fn run<B: UsageBackend>(
    mut cycles: Cycles<B>,
    refresh_interval: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval(refresh_interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut invalidations: Option<InvalidationReceiver> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            Some(joined) = cycles.in_flight.join_next_with_id(), if !cycles.in_flight.is_empty() => {
                cycles.finish(joined);
            }
            Some(command) = commands.recv() => match command {
                Command::Refresh => cycles.start("manual"),
                Command::Subscribe(source) => {
                    if invalidations.replace(source).is_some() {
                        tracing::debug!("replaced invalidation source");
                    }
                }
            },
            received = next_invalidation(&mut invalidations) => match received {
                Ok(_) => cycles.start("invalidation"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "invalidation receiver lagged");
                    cycles.start("invalidation");
                }
                Err(RecvError::Closed) => {
                    tracing::debug!("invalidation source closed");
                    invalidations = None;
                }
            },
            _ = ticker.tick() => cycles.start("timer"),
        }
    }

    cycles.in_flight.shutdown().await;
    tracing::debug!("sync controller stopped");
}

async fn next_invalidation(
    source: &mut Option<InvalidationReceiver>,
) -> Result<Invalidation, RecvError> {
    match source {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

struct Cycles<B> {
    backend: Arc<B>,
    state: watch::Sender<SyncState>,
    in_flight: JoinSet<CycleResult>,
    /// Sequence number of each in-flight task.
    seqs: HashMap<task::Id, u64>,
    issued: u64,
    applied: u64,
}

impl<B: UsageBackend> Cycles<B> {
    fn new(backend: Arc<B>, state: watch::Sender<SyncState>) -> Self {
        Self {
            backend,
            state,
            in_flight: JoinSet::new(),
            seqs: HashMap::new(),
            issued: 0,
            applied: 0,
        }
    }

    fn start(&mut self, trigger: &'static str) {
        self.issued += 1;
        let seq = self.issued;
        let backend = Arc::clone(&self.backend);
        let task = self
            .in_flight
            .spawn(async move { fetch_snapshot(backend.as_ref()).await });
        self.seqs.insert(task.id(), seq);
        tracing::debug!(seq, trigger, "fetch cycle started");
        self.publish_loading();
    }

    fn finish(&mut self, joined: Result<(task::Id, CycleResult), JoinError>) {
        let (id, outcome) = match joined {
            Ok((id, result)) => (id, result.map_err(|err| err.to_string())),
            Err(err) => {
                tracing::error!(error = %err, "fetch cycle task failed");
                (err.id(), Err(format!("fetch cycle aborted: {err}")))
            }
        };
        let Some(seq) = self.seqs.remove(&id) else {
            tracing::warn!(%id, "finished task has no fetch cycle");
            self.publish_loading();
            return;
        };

        if seq <= self.applied {
            tracing::debug!(seq, applied = self.applied, "discarding stale fetch cycle");
            return;
        }
        self.applied = seq;
        let is_loading = self.is_loading();

        match outcome {
            Ok(snapshot) => {
                tracing::debug!(seq, "snapshot replaced");
                let snapshot = Arc::new(snapshot);
                self.state.send_modify(|state| {
                    state.snapshot = Some(snapshot);
                    state.error = None;
                    state.is_loading = is_loading;
                    state.sequence = seq;
                });
            }
            Err(message) => {
                tracing::warn!(seq, error = %message, "fetch cycle failed, keeping last snapshot");
                self.state.send_modify(|state| {
                    state.error = Some(message);
                    state.is_loading = is_loading;
                    state.sequence = seq;
                });
            }
        }
    }

    /// Loading while a cycle newer than the applied one may still land.
    fn is_loading(&self) -> bool {
        self.issued > self.applied && !self.in_flight.is_empty()
    }

    fn publish_loading(&self) {
        let is_loading = self.is_loading();
        self.state.send_if_modified(|state| {
            let changed = state.is_loading != is_loading;
            state.is_loading = is_loading;
            changed
        });
    }
}

/// Runs the five queries concurrently. The cycle fails as a whole if any one of them fails.
pub async fn fetch_snapshot<B: UsageBackend>(
    backend: &B,
) -> Result<DashboardSnapshot, BackendQueryError> {
    let (today, week, month, billing_windows, sessions) = tokio::try_join!(
        backend.usage_data(TimeRange::Today),
        backend.usage_data(TimeRange::Week),
        backend.usage_data(TimeRange::Month),
        backend.billing_windows(),
        backend.session_breakdown(),
    )?;

    Ok(DashboardSnapshot {
        today,
        week,
        month,
        billing_windows,
        sessions,
    })
}
