use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    error::{Result, RingError},
    protocol::Command,
    state::ConnectionState,
    types::{MeasurementKind, MeasurementSession, MeasurementTiming, MeasurementWindow},
};

const TICK: Duration = Duration::from_secs(1);

/// Where measurement commands go.
///
/// Implemented by the session so that measurements only ever reach the link
/// through its command queue.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Enqueue a command without waiting for it
    ///
    /// # Errors
    ///
    /// Fails when the session is not `Ready`.
    fn dispatch(&self, command: Command) -> Result<()>;

    /// Enqueue a command and wait for the transport acknowledgement
    ///
    /// # Errors
    ///
    /// Fails when the session is not `Ready`, or the write fails or times out.
    async fn submit(&self, command: Command) -> Result<()>;
}

/// Why a measurement ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// The caller stopped it
    Requested,
    /// The link went away
    Disconnected,
    /// The ring did not accept the start command
    TriggerRejected,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::TriggerRejected => write!(f, "trigger rejected"),
        }
    }
}

/// Progress of a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementEvent {
    /// Time left in a running measurement
    Progress {
        /// Measurement kind
        kind: MeasurementKind,
        /// Time left
        remaining: Duration,
        /// Full length
        total: Duration,
    },
    /// The measurement ran to the end
    Completed {
        /// Measurement kind
        kind: MeasurementKind,
    },
    /// The measurement ended early
    Cancelled {
        /// Measurement kind
        kind: MeasurementKind,
        /// Why it ended
        reason: CancelReason,
    },
}

impl MeasurementEvent {
    /// Measurement this event belongs to
    #[must_use]
    pub const fn kind(&self) -> MeasurementKind {
        match self {
            Self::Progress { kind, .. }
            | Self::Completed { kind }
            | Self::Cancelled { kind, .. } => *kind,
        }
    }

    /// Whether no further events follow for this run
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

struct Active {
    session: MeasurementSession,
    id: u64,
    ticker: Option<JoinHandle<()>>,
}

/// Runs timed measurements, at most one per kind
pub struct MeasurementController {
    sink: Arc<dyn CommandSink>,
    timing: MeasurementTiming,
    sessions: Mutex<HashMap<MeasurementKind, Active>>,
    events: broadcast::Sender<MeasurementEvent>,
    next_id: AtomicU64,
}

impl MeasurementController {
    /// Create a controller that sends its commands to `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn CommandSink>, timing: MeasurementTiming) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sink,
            timing,
            sessions: Mutex::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MeasurementKind, Active>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: MeasurementEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start a measurement of `kind`.
    ///
    /// Does nothing if one is already running. Progress starts at the full
    /// length and counts down once per second; a sample request is sent every
    /// sub-interval and the measurement stops itself at zero.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NotReady`] without touching any state when the
    /// session is not `Ready`, or the queue error when the ring does not take
    /// the start command.
    pub async fn start(self: &Arc<Self>, kind: MeasurementKind) -> Result<()> {
        let state = self.sink.state();
        if !state.is_ready() {
            return Err(RingError::NotReady { state });
        }
        let window = self.timing.window(kind);
        if window.total_secs == 0 {
            return Err(RingError::InvalidParameters(format!(
                "{kind} measurement has zero length"
            )));
        }

        let id = {
            let mut sessions = self.lock();
            if sessions.contains_key(&kind) {
                debug!("{} measurement already running", kind);
                return Ok(());
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let session = MeasurementSession::new(kind, window.total());
            sessions.insert(
                kind,
                Active {
                    session,
                    id,
                    ticker: None,
                },
            );
            self.emit(MeasurementEvent::Progress {
                kind,
                remaining: session.remaining,
                total: session.total,
            });
            id
        };

        info!("Starting {} measurement", kind);
        if let Err(e) = self.sink.submit(Command::measurement_start(kind)).await {
            let mut sessions = self.lock();
            if sessions.get(&kind).is_some_and(|a| a.id == id) {
                sessions.remove(&kind);
                self.emit(MeasurementEvent::Cancelled {
                    kind,
                    reason: CancelReason::TriggerRejected,
                });
            }
            return Err(e);
        }

        let ticker = tokio::spawn(Arc::clone(self).tick(kind, id, window));
        match self.lock().get_mut(&kind) {
            Some(active) if active.id == id => active.ticker = Some(ticker),
            // Stopped or torn down while the trigger was in flight
            _ => ticker.abort(),
        }
        Ok(())
    }

    async fn tick(self: Arc<Self>, kind: MeasurementKind, id: u64, window: MeasurementWindow) {
        let mut ticks = interval_at(Instant::now() + TICK, TICK);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut elapsed: u32 = 0;

        loop {
            ticks.tick().await;
            elapsed += 1;

            let finished = {
                let mut sessions = self.lock();
                let Some(active) = sessions.get_mut(&kind).filter(|a| a.id == id) else {
                    return;
                };
                active.session.remaining = active.session.remaining.saturating_sub(TICK);
                let MeasurementSession {
                    remaining, total, ..
                } = active.session;

                self.emit(MeasurementEvent::Progress {
                    kind,
                    remaining,
                    total,
                });
                if remaining.is_zero() {
                    sessions.remove(&kind);
                    self.emit(MeasurementEvent::Completed { kind });
                }
                remaining.is_zero()
            };

            if finished {
                info!("{} measurement completed", kind);
                if let Err(e) = self.sink.dispatch(Command::measurement_stop(kind)) {
                    debug!("Stop for {} not sent: {}", kind, e);
                }
                return;
            }

            if window.sample_every_secs > 0 && elapsed % window.sample_every_secs == 0 {
                if let Err(e) = self.sink.dispatch(Command::measurement_sample(kind)) {
                    debug!("Sample request for {} not sent: {}", kind, e);
                }
            }
        }
    }

    /// Stop a running measurement; returns whether one was running
    pub fn stop(&self, kind: MeasurementKind) -> bool {
        let removed = {
            let mut sessions = self.lock();
            let removed = sessions.remove(&kind);
            if removed.is_some() {
                self.emit(MeasurementEvent::Cancelled {
                    kind,
                    reason: CancelReason::Requested,
                });
            }
            removed
        };
        let Some(active) = removed else {
            return false;
        };

        if let Some(ticker) = active.ticker {
            ticker.abort();
        }
        info!("Stopped {} measurement", kind);
        if let Err(e) = self.sink.dispatch(Command::measurement_stop(kind)) {
            debug!("Stop for {} not sent: {}", kind, e);
        }
        true
    }

    /// End every running measurement without sending anything to the ring.
    ///
    /// Returns how many were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut sessions = self.lock();
        let mut kinds: Vec<MeasurementKind> = sessions.keys().copied().collect();
        kinds.sort();

        for kind in &kinds {
            if let Some(active) = sessions.remove(kind) {
                if let Some(ticker) = active.ticker {
                    ticker.abort();
                }
                self.emit(MeasurementEvent::Cancelled {
                    kind: *kind,
                    reason,
                });
            }
        }
        if !kinds.is_empty() {
            info!("Cancelled {} measurement(s): {}", kinds.len(), reason);
        }
        kinds.len()
    }

    /// Progress of the running measurement of `kind`
    #[must_use]
    pub fn session(&self, kind: MeasurementKind) -> Option<MeasurementSession> {
        self.lock().get(&kind).map(|a| a.session)
    }

    /// Kinds currently running
    #[must_use]
    pub fn active_kinds(&self) -> Vec<MeasurementKind> {
        let mut kinds: Vec<_> = self.lock().keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Events for every kind
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MeasurementEvent> {
        self.events.subscribe()
    }

    /// Events for the next run of `kind`; the stream ends after its terminal
    /// event
    #[must_use]
    pub fn progress(&self, kind: MeasurementKind) -> BoxStream<'static, MeasurementEvent> {
        let rx = self.events.subscribe();
        stream::unfold(Some(rx), move |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => {
                        let next = (!event.is_terminal()).then_some(rx);
                        return Some((event, next));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::broadcast::error::TryRecvError;

    struct FakeSink {
        state: Mutex<ConnectionState>,
        reject: AtomicBool,
        commands: Mutex<Vec<Command>>,
    }

    impl FakeSink {
        fn ready() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(ConnectionState::Ready),
                reject: AtomicBool::new(false),
                commands: Mutex::new(Vec::new()),
            })
        }

        fn opcodes(&self) -> Vec<u8> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.opcode() as u8)
                .collect()
        }
    }

    #[async_trait]
    impl CommandSink for FakeSink {
        fn state(&self) -> ConnectionState {
            *self.state.lock().unwrap()
        }

        fn dispatch(&self, command: Command) -> Result<()> {
            self.commands.lock().unwrap().push(command);
            Ok(())
        }

        async fn submit(&self, command: Command) -> Result<()> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(RingError::CommandRejected("busy".to_string()));
            }
            self.commands.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn controller(sink: &Arc<FakeSink>) -> Arc<MeasurementController> {
        Arc::new(MeasurementController::new(
            Arc::clone(sink) as Arc<dyn CommandSink>,
            MeasurementTiming::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_completes_exactly_once() {
        let sink = FakeSink::ready();
        let controller = controller(&sink);
        let progress = controller.progress(MeasurementKind::HeartRate);
        let mut all = controller.subscribe();

        controller.start(MeasurementKind::HeartRate).await.unwrap();
        let events: Vec<_> = progress.collect().await;

        let remaining: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                MeasurementEvent::Progress { remaining, .. } => Some(remaining.as_secs()),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, (0..=30).rev().collect::<Vec<_>>());
        assert_eq!(
            events.last(),
            Some(&MeasurementEvent::Completed {
                kind: MeasurementKind::HeartRate
            })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        // Start, two sample requests, auto-stop
        assert_eq!(sink.opcodes(), vec![0x10, 0x12, 0x12, 0x11]);
        assert_eq!(controller.session(MeasurementKind::HeartRate), None);

        // Nothing after completion
        while all.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(all.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_rejected_when_not_ready() {
        let sink = FakeSink::ready();
        *sink.state.lock().unwrap() = ConnectionState::Subscribing;
        let controller = controller(&sink);
        let mut events = controller.subscribe();

        let error = controller.start(MeasurementKind::SpO2).await.unwrap_err();
        assert!(matches!(
            error,
            RingError::NotReady {
                state: ConnectionState::Subscribing
            }
        ));
        assert!(controller.active_kinds().is_empty());
        assert!(sink.opcodes().is_empty());
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_noop() {
        let sink = FakeSink::ready();
        let controller = controller(&sink);

        controller.start(MeasurementKind::Stress).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        controller.start(MeasurementKind::Stress).await.unwrap();

        assert_eq!(sink.opcodes(), vec![0x10]);
        let session = controller.session(MeasurementKind::Stress).unwrap();
        assert_eq!(session.remaining, Duration::from_secs(28));
        assert!(session.active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels() {
        let sink = FakeSink::ready();
        let controller = controller(&sink);
        let progress = controller.progress(MeasurementKind::BloodPressure);

        controller.start(MeasurementKind::BloodPressure).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(controller.stop(MeasurementKind::BloodPressure));
        assert!(!controller.stop(MeasurementKind::BloodPressure));

        let events: Vec<_> = progress.collect().await;
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[4],
            MeasurementEvent::Cancelled {
                kind: MeasurementKind::BloodPressure,
                reason: CancelReason::Requested
            }
        );
        assert_eq!(sink.opcodes(), vec![0x10, 0x11]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_on_disconnect() {
        let sink = FakeSink::ready();
        let controller = controller(&sink);
        let mut events = controller.subscribe();

        controller.start(MeasurementKind::HeartRate).await.unwrap();
        controller.start(MeasurementKind::SpO2).await.unwrap();
        assert_eq!(controller.cancel_all(CancelReason::Disconnected), 2);
        assert!(controller.active_kinds().is_empty());

        let mut cancelled = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MeasurementEvent::Cancelled { kind, reason } = event {
                assert_eq!(reason, CancelReason::Disconnected);
                cancelled.push(kind);
            }
        }
        assert_eq!(
            cancelled,
            vec![MeasurementKind::HeartRate, MeasurementKind::SpO2]
        );

        // Tickers are gone
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(sink.opcodes(), vec![0x10, 0x10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_trigger_rolls_back() {
        let sink = FakeSink::ready();
        sink.reject.store(true, Ordering::SeqCst);
        let controller = controller(&sink);
        let progress = controller.progress(MeasurementKind::HeartRate);

        assert!(controller.start(MeasurementKind::HeartRate).await.is_err());
        assert_eq!(controller.session(MeasurementKind::HeartRate), None);

        let events: Vec<_> = progress.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            MeasurementEvent::Cancelled {
                kind: MeasurementKind::HeartRate,
                reason: CancelReason::TriggerRejected
            }
        );
    }
}
