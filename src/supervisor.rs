use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream, StreamExt},
    Future,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    decoder::{DecodeStats, PacketDecoder},
    error::{Result, RingError},
    measurement::{CancelReason, CommandSink, MeasurementController, MeasurementEvent},
    protocol::{device_clock_now, Command},
    queue::{CommandQueue, CommandSender},
    scanner::Scanner,
    state::{ConnectionState, SessionEvent, StateTransition},
    store::{RingSnapshot, RingStateStore},
    transport::{BondState, Link, LinkEvent, Transport},
    types::{
        Channel, ChannelKey, DeviceHandle, MeasurementKind, MeasurementSession, RawPacket,
        ScanParams, SessionConfig,
    },
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between a session's driver task and its handles
struct SessionCore {
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<StateTransition>,
    store: RingStateStore,
    stats: watch::Sender<DecodeStats>,
    commands: Mutex<Option<CommandSender>>,
    closed: AtomicBool,
}

impl SessionCore {
    fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (transitions, _) = broadcast::channel(32);
        let (stats, _) = watch::channel(DecodeStats::default());
        Self {
            config,
            state,
            transitions,
            store: RingStateStore::new(),
            stats,
            commands: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Feed `event` to the state machine; returns the transition if the
    /// state changed
    fn apply(&self, event: SessionEvent) -> Option<StateTransition> {
        let mut transition = None;
        self.state.send_if_modified(|state| {
            let next = state.on(event);
            if next == *state {
                return false;
            }
            transition = Some(StateTransition {
                from: *state,
                to: next,
                event,
            });
            *state = next;
            true
        });

        match transition {
            Some(t) => {
                info!("Session state: {} -> {}", t.from, t.to);
                let _ = self.transitions.send(t);
            }
            None => debug!("{:?} ignored in {}", event, self.current()),
        }
        transition
    }

    fn sender(&self) -> Result<CommandSender> {
        let state = self.current();
        if !state.is_ready() {
            return Err(RingError::NotReady { state });
        }
        lock(&self.commands)
            .clone()
            .ok_or(RingError::NotReady { state })
    }
}

#[async_trait]
impl CommandSink for SessionCore {
    fn state(&self) -> ConnectionState {
        self.current()
    }

    fn dispatch(&self, command: Command) -> Result<()> {
        self.sender()?.dispatch(command)
    }

    async fn submit(&self, command: Command) -> Result<()> {
        let sender = self.sender()?;
        sender.submit(command).await
    }
}

enum Control {
    Disconnect { done: oneshot::Sender<()> },
}

impl Control {
    fn into_ack(self) -> oneshot::Sender<()> {
        match self {
            Self::Disconnect { done } => done,
        }
    }
}

/// Why a connection attempt did not reach `Ready`
enum AttemptError {
    /// Terminal; the event moves the session to `Failed`
    Fatal(SessionEvent),
    /// Worth another try after backoff
    Transient(RingError),
}

type AttemptResult<T> = std::result::Result<T, AttemptError>;

enum Attempt {
    Established(Established),
    Failed(AttemptError),
    Interrupted(Option<oneshot::Sender<()>>),
}

/// A link that reached the readiness handshake
struct Established {
    link: Arc<dyn Link>,
    queue: CommandQueue,
    packets: BoxStream<'static, RawPacket>,
    events: BoxStream<'static, LinkEvent>,
    opened_at: Instant,
}

enum StreamEnd {
    Requested(Option<oneshot::Sender<()>>),
    LinkLost { early: bool },
}

/// Watches the link event stream while a setup step runs
struct SetupGuard<'a> {
    events: &'a mut BoxStream<'static, LinkEvent>,
    opened_at: Instant,
    window: Duration,
    bonded: bool,
}

impl SetupGuard<'_> {
    fn link_lost(&self) -> AttemptError {
        let after = self.opened_at.elapsed();
        if after < self.window {
            warn!("Link dropped {:?} after opening; ring is busy elsewhere", after);
            AttemptError::Fatal(SessionEvent::LinkLost { early: true })
        } else {
            AttemptError::Transient(RingError::Disconnected)
        }
    }

    /// Run `step`, failing early if the link drops first
    async fn run<T>(&mut self, step: impl Future<Output = Result<T>>) -> AttemptResult<T> {
        tokio::pin!(step);
        loop {
            tokio::select! {
                biased;
                event = self.events.next() => match event {
                    Some(LinkEvent::Disconnected) | None => return Err(self.link_lost()),
                    Some(LinkEvent::BondStateChanged(BondState::Bonded)) => self.bonded = true,
                    Some(other) => debug!("Link event during setup: {:?}", other),
                },
                result = &mut step => return result.map_err(AttemptError::Transient),
            }
        }
    }

    /// Wait for the platform to finish a pairing already in progress
    async fn bond_completion(&mut self) -> AttemptResult<()> {
        if self.bonded {
            return Ok(());
        }
        loop {
            match self.events.next().await {
                Some(LinkEvent::BondStateChanged(BondState::Bonded)) => return Ok(()),
                Some(LinkEvent::BondStateChanged(BondState::None)) => {
                    return Err(AttemptError::Fatal(SessionEvent::BondFailed))
                }
                Some(LinkEvent::Disconnected) | None => return Err(self.link_lost()),
                Some(other) => debug!("Link event while bonding: {:?}", other),
            }
        }
    }
}

/// Everything an attempt needs besides the control channel
struct Context {
    core: Arc<SessionCore>,
    measurements: Arc<MeasurementController>,
    transport: Arc<dyn Transport>,
    device: DeviceHandle,
    pending: Mutex<Option<Arc<dyn Link>>>,
}

impl Context {
    async fn establish(&self) -> AttemptResult<Established> {
        let core = &self.core;
        let timeouts = &core.config.timeouts;
        let channels = &core.config.channels;

        let link = self.transport.open(&self.device).await.map_err(|e| match e {
            RingError::LinkUnavailable => AttemptError::Fatal(SessionEvent::Unavailable),
            other => AttemptError::Transient(other),
        })?;
        let opened_at = Instant::now();
        *lock(&self.pending) = Some(Arc::clone(&link));

        let mut events = link.events().await.map_err(AttemptError::Transient)?;
        let mut guard = SetupGuard {
            events: &mut events,
            opened_at,
            window: timeouts.peer_busy_window(),
            bonded: false,
        };

        let bond_state = guard.run(link.bond_state()).await?;
        core.apply(SessionEvent::LinkOpened {
            bonded: bond_state == BondState::Bonded,
        });
        if bond_state != BondState::Bonded {
            self.bond(&*link, bond_state, &mut guard).await?;
            core.apply(SessionEvent::BondSucceeded);
        }

        let keys = guard.run(link.discover()).await?;
        let missing: Vec<Channel> = channels
            .required
            .iter()
            .copied()
            .filter(|c| !keys.contains(&channels.key(*c)))
            .collect();
        if !missing.is_empty() {
            error!("Required channel(s) missing: {:?}", missing);
            return Err(AttemptError::Fatal(SessionEvent::ChannelMissing));
        }
        core.apply(SessionEvent::ChannelsLocated);

        let mut streams = Vec::new();
        for channel in Channel::NOTIFY {
            let key = channels.key(channel);
            if !keys.contains(&key) {
                debug!("Optional channel {} not present", channel);
                continue;
            }
            let notifications = self
                .subscribe(&*link, channel, &key, &mut guard)
                .await?;
            streams.push(
                notifications
                    .map(move |bytes| RawPacket::new(channel, bytes))
                    .boxed(),
            );
        }
        let packets = stream::select_all(streams).boxed();

        let queue = CommandQueue::start(
            Arc::clone(&link),
            channels.key(Channel::Command),
            timeouts.command_timeout(),
        );
        let sender = queue.sender();
        for command in [Command::handshake(), Command::time_sync(device_clock_now())] {
            self.send_with_retry(&sender, command, &mut guard).await?;
        }

        lock(&self.pending).take();
        Ok(Established {
            link,
            queue,
            packets,
            events,
            opened_at,
        })
    }

    async fn bond(
        &self,
        link: &dyn Link,
        state: BondState,
        guard: &mut SetupGuard<'_>,
    ) -> AttemptResult<()> {
        let bond_timeout = self.core.config.timeouts.bond_timeout();
        let pairing = async {
            if state == BondState::Bonding {
                info!("Pairing already in progress, waiting for completion");
                guard.bond_completion().await
            } else {
                info!("Pairing with {}", self.device);
                match guard.run(link.bond()).await {
                    Err(AttemptError::Transient(e)) => {
                        warn!("Pairing failed: {}", e);
                        Err(AttemptError::Fatal(SessionEvent::BondFailed))
                    }
                    other => other,
                }
            }
        };

        timeout(bond_timeout, pairing).await.unwrap_or_else(|_| {
            warn!("Pairing did not complete within {:?}", bond_timeout);
            Err(AttemptError::Fatal(SessionEvent::BondFailed))
        })
    }

    async fn subscribe(
        &self,
        link: &dyn Link,
        channel: Channel,
        key: &ChannelKey,
        guard: &mut SetupGuard<'_>,
    ) -> AttemptResult<BoxStream<'static, bytes::Bytes>> {
        let attempts = self.core.config.timeouts.subscribe_attempts.max(1);
        let mut attempt = 1;
        loop {
            match guard.run(link.subscribe(key)).await {
                Ok(notifications) => {
                    debug!("Subscribed to {} channel", channel);
                    return Ok(notifications);
                }
                Err(AttemptError::Transient(RingError::Disconnected)) => {
                    return Err(AttemptError::Transient(RingError::Disconnected))
                }
                Err(AttemptError::Transient(e)) if attempt < attempts => {
                    warn!(
                        "Subscribing to {} failed (attempt {}/{}): {}",
                        channel, attempt, attempts, e
                    );
                    attempt += 1;
                }
                Err(AttemptError::Transient(e)) => {
                    error!(
                        "Giving up on {} channel after {} attempts: {}",
                        channel, attempts, e
                    );
                    return Err(AttemptError::Fatal(SessionEvent::SubscriptionFailed));
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    async fn send_with_retry(
        &self,
        sender: &CommandSender,
        command: Command,
        guard: &mut SetupGuard<'_>,
    ) -> AttemptResult<()> {
        match guard.run(sender.submit(command.clone())).await {
            Err(AttemptError::Transient(e)) => {
                let delay = self.core.config.timeouts.command_retry_delay();
                warn!("{:?} failed, retrying in {:?}: {}", command.opcode(), delay, e);
                guard
                    .run(async {
                        sleep(delay).await;
                        sender.submit(command).await
                    })
                    .await
            }
            other => other,
        }
    }

    /// Best-effort teardown of a link an abandoned attempt left open
    async fn close_pending(&self) {
        let link = lock(&self.pending).take();
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                debug!("Closing abandoned link failed: {}", e);
            }
        }
    }

    fn link_lost(&self, opened_at: Instant) -> StreamEnd {
        let early = opened_at.elapsed() < self.core.config.timeouts.peer_busy_window();
        if early {
            warn!("Link dropped right after it came up; ring is busy elsewhere");
        } else {
            warn!("Link to {} lost", self.device);
        }
        StreamEnd::LinkLost { early }
    }
}

/// Owns one session from connect intent to terminal state
struct SessionDriver {
    ctx: Context,
    control: mpsc::UnboundedReceiver<Control>,
    decoder: PacketDecoder,
}

impl SessionDriver {
    async fn run(mut self) {
        let policy = self.ctx.core.config.reconnect.clone();
        let mut failures: u32 = 0;
        let mut reconnecting = false;

        self.ctx.core.apply(SessionEvent::ConnectRequested);
        loop {
            match self.attempt(reconnecting).await {
                Attempt::Established(established) => {
                    failures = 0;
                    match self.stream(established).await {
                        StreamEnd::Requested(done) => {
                            return self.finish(SessionEvent::DisconnectRequested, done)
                        }
                        StreamEnd::LinkLost { early: true } => {
                            return self.finish(SessionEvent::LinkLost { early: true }, None)
                        }
                        StreamEnd::LinkLost { early: false } => {
                            self.ctx.core.apply(SessionEvent::LinkLost { early: false });
                        }
                    }
                }
                Attempt::Failed(AttemptError::Fatal(event)) => return self.finish(event, None),
                Attempt::Failed(AttemptError::Transient(e)) => {
                    warn!("Connection attempt failed: {}", e);
                    self.ctx.core.apply(SessionEvent::AttemptFailed);
                }
                Attempt::Interrupted(done) => {
                    return self.finish(SessionEvent::DisconnectRequested, done)
                }
            }

            failures += 1;
            if failures > policy.max_attempts {
                error!("Giving up after {} reconnect attempts", policy.max_attempts);
                return self.finish(SessionEvent::RetriesExhausted, None);
            }
            let delay = policy.delay_for(failures);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, failures, policy.max_attempts
            );
            tokio::select! {
                biased;
                control = self.control.recv() => {
                    return self.finish(
                        SessionEvent::DisconnectRequested,
                        control.map(Control::into_ack),
                    );
                }
                () = sleep(delay) => {}
            }

            reconnecting = true;
            self.ctx.core.apply(SessionEvent::ConnectRequested);
        }
    }

    async fn attempt(&mut self, reconnecting: bool) -> Attempt {
        let budget = self.ctx.core.config.timeouts.connect_timeout();
        let outcome = tokio::select! {
            biased;
            control = self.control.recv() => {
                Attempt::Interrupted(control.map(Control::into_ack))
            }
            result = timeout(budget, self.ctx.establish()) => match result {
                Ok(Ok(established)) => Attempt::Established(established),
                Ok(Err(e)) => Attempt::Failed(e),
                Err(_) if reconnecting => {
                    Attempt::Failed(AttemptError::Transient(RingError::Timeout {
                        timeout_ms: self.ctx.core.config.timeouts.connect_timeout_ms,
                    }))
                }
                Err(_) => {
                    error!("Connection not ready within {:?}", budget);
                    Attempt::Failed(AttemptError::Fatal(SessionEvent::TimedOut))
                }
            },
        };

        if !matches!(outcome, Attempt::Established(_)) {
            self.ctx.close_pending().await;
        }
        outcome
    }

    async fn stream(&mut self, established: Established) -> StreamEnd {
        let Established {
            link,
            queue,
            mut packets,
            mut events,
            opened_at,
        } = established;
        let core = Arc::clone(&self.ctx.core);

        *lock(&core.commands) = Some(queue.sender());
        core.apply(SessionEvent::Subscribed);
        info!("Session with {} ready", self.ctx.device);

        if let Err(e) = queue.sender().dispatch(Command::battery_query()) {
            debug!("Battery query not sent: {}", e);
        }
        let interval = core.config.timeouts.keep_alive_interval();
        let keep_alive =
            (!interval.is_zero()).then(|| tokio::spawn(keep_alive(queue.sender(), interval)));

        let end = loop {
            tokio::select! {
                biased;
                control = self.control.recv() => {
                    break StreamEnd::Requested(control.map(Control::into_ack));
                }
                event = events.next() => match event {
                    Some(LinkEvent::Disconnected) | None => break self.ctx.link_lost(opened_at),
                    Some(other) => debug!("Link event: {:?}", other),
                },
                packet = packets.next() => match packet {
                    Some(packet) => ingest(&mut self.decoder, &core, &packet),
                    None => break self.ctx.link_lost(opened_at),
                },
            }
        };

        // Tear everything down before the state leaves Ready
        if let Some(keep_alive) = keep_alive {
            keep_alive.abort();
        }
        lock(&core.commands).take();
        self.ctx.measurements.cancel_all(CancelReason::Disconnected);
        drop(queue);
        core.store.reset();
        self.decoder.reset();
        if let Err(e) = link.close().await {
            debug!("Closing link failed: {}", e);
        }
        end
    }

    fn finish(&mut self, event: SessionEvent, done: Option<oneshot::Sender<()>>) {
        let core = &self.ctx.core;
        lock(&core.commands).take();
        self.ctx.measurements.cancel_all(CancelReason::Disconnected);
        core.store.reset();

        // Terminal state is visible before the closed flag is raised
        core.apply(event);
        core.closed.store(true, Ordering::SeqCst);
        core.state.send_modify(|_| {});
        info!("Session with {} finished in {}", self.ctx.device, core.current());

        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

fn ingest(decoder: &mut PacketDecoder, core: &SessionCore, packet: &RawPacket) {
    let readings = decoder.decode(packet);
    core.store.apply(&readings);
    core.stats.send_replace(decoder.stats());
}

async fn keep_alive(sender: CommandSender, every: Duration) {
    let mut ticks = interval_at(Instant::now() + every, every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        debug!("Keep-alive tick");
        if sender.dispatch(Command::link_check()).is_err() {
            return;
        }
    }
}

/// Handle to a running ring session.
///
/// Cheap to clone. The session keeps running while any handle (or the
/// [`Supervisor`] that created it) is alive.
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
    measurements: Arc<MeasurementController>,
    control: mpsc::UnboundedSender<Control>,
    device: DeviceHandle,
}

impl SessionHandle {
    /// Start a session with `device` on a background task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn spawn(
        transport: Arc<dyn Transport>,
        device: DeviceHandle,
        config: SessionConfig,
    ) -> Self {
        let timing = config.measurements.clone();
        let core = Arc::new(SessionCore::new(config));
        let measurements = Arc::new(MeasurementController::new(
            Arc::clone(&core) as Arc<dyn CommandSink>,
            timing,
        ));
        let (control, control_rx) = mpsc::unbounded_channel();

        let driver = SessionDriver {
            ctx: Context {
                core: Arc::clone(&core),
                measurements: Arc::clone(&measurements),
                transport,
                device: device.clone(),
                pending: Mutex::new(None),
            },
            control: control_rx,
            decoder: PacketDecoder::new(),
        };
        tokio::spawn(driver.run());

        Self {
            core,
            measurements,
            control,
            device,
        }
    }

    /// Device this session talks to
    #[must_use]
    pub const fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.core.current()
    }

    /// Change stream of the current state
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Every state transition from now on
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.core.transitions.subscribe()
    }

    /// Whether the session reached a terminal state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst) || self.state().is_failed()
    }

    /// Wait until the session is `Ready`.
    ///
    /// Reconnection in between is invisible; only the outcome is reported.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::SessionFailed`] with the failure reason, or
    /// [`RingError::Disconnected`] if the session was torn down first.
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.core.state.subscribe();
        let closed = &self.core.closed;
        let state = *rx
            .wait_for(|s| {
                s.is_ready()
                    || s.is_failed()
                    || (*s == ConnectionState::Disconnected && closed.load(Ordering::SeqCst))
            })
            .await
            .map_err(|_| RingError::Disconnected)?;

        match state {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Failed(reason) => Err(RingError::SessionFailed(reason)),
            _ => Err(RingError::Disconnected),
        }
    }

    /// Latest ring values
    #[must_use]
    pub fn snapshot(&self) -> RingSnapshot {
        self.core.store.snapshot()
    }

    /// Change stream of ring values
    #[must_use]
    pub fn snapshots(&self) -> watch::Receiver<RingSnapshot> {
        self.core.store.subscribe()
    }

    /// Decoder counters for this session
    #[must_use]
    pub fn decode_stats(&self) -> DecodeStats {
        *self.core.stats.borrow()
    }

    /// Start a timed measurement
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NotReady`] unless the session is `Ready`, or the
    /// queue error if the ring did not take the start command.
    pub async fn start_measurement(&self, kind: MeasurementKind) -> Result<()> {
        self.measurements.start(kind).await
    }

    /// Stop a running measurement; returns whether one was running
    pub fn stop_measurement(&self, kind: MeasurementKind) -> bool {
        self.measurements.stop(kind)
    }

    /// Progress of the running measurement of `kind`
    #[must_use]
    pub fn measurement(&self, kind: MeasurementKind) -> Option<MeasurementSession> {
        self.measurements.session(kind)
    }

    /// Kinds currently being measured
    #[must_use]
    pub fn active_measurements(&self) -> Vec<MeasurementKind> {
        self.measurements.active_kinds()
    }

    /// Measurement events for every kind
    #[must_use]
    pub fn measurement_events(&self) -> broadcast::Receiver<MeasurementEvent> {
        self.measurements.subscribe()
    }

    /// Events for the next run of `kind`, ending after its terminal event
    #[must_use]
    pub fn measurement_progress(
        &self,
        kind: MeasurementKind,
    ) -> BoxStream<'static, MeasurementEvent> {
        self.measurements.progress(kind)
    }

    /// Send a raw command through the session queue
    ///
    /// # Errors
    ///
    /// Returns [`RingError::NotReady`] unless the session is `Ready`, or the
    /// write error.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.core.submit(command).await
    }

    /// Tear the session down and wait until it is gone.
    ///
    /// Running measurements end with [`CancelReason::Disconnected`] and the
    /// snapshot is cleared. Does nothing on a finished session.
    ///
    /// # Errors
    ///
    /// None at present.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, ack) = oneshot::channel();
        if self.control.send(Control::Disconnect { done }).is_err() {
            return Ok(());
        }
        // A dropped ack means the driver finished on its own
        let _ = ack.await;
        Ok(())
    }
}

/// Entry point: scans for rings and owns at most one live session
pub struct Supervisor {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    idle: watch::Sender<ConnectionState>,
    active: Mutex<Option<SessionHandle>>,
}

impl Supervisor {
    /// Create a supervisor over `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let (idle, _) = watch::channel(ConnectionState::Idle);
        Self {
            transport,
            config,
            idle,
            active: Mutex::new(None),
        }
    }

    fn live_session(&self) -> Option<SessionHandle> {
        lock(&self.active)
            .as_ref()
            .filter(|s| !s.is_finished())
            .cloned()
    }

    fn idle_event(&self, event: SessionEvent) {
        self.idle.send_if_modified(|state| {
            let next = state.on(event);
            let changed = next != *state;
            *state = next;
            changed
        });
    }

    /// Scan for rings, strongest first
    ///
    /// # Errors
    ///
    /// Returns [`RingError::SessionActive`] while a session is live, or the
    /// transport error.
    pub async fn scan(&self, params: &ScanParams) -> Result<Vec<DeviceHandle>> {
        if self.live_session().is_some() {
            return Err(RingError::SessionActive);
        }
        self.idle_event(SessionEvent::ScanStarted);
        let result = Scanner::new(Arc::clone(&self.transport)).scan(params).await;
        self.idle_event(SessionEvent::ScanFinished);
        result
    }

    /// Scan and return the strongest ring
    ///
    /// # Errors
    ///
    /// Returns [`RingError::DeviceNotFound`] if no ring was seen.
    pub async fn find_first(&self, params: &ScanParams) -> Result<DeviceHandle> {
        self.scan(params)
            .await?
            .into_iter()
            .next()
            .ok_or(RingError::DeviceNotFound)
    }

    /// Start a session with `device`
    ///
    /// # Errors
    ///
    /// Returns [`RingError::SessionActive`] if a session is still live.
    pub fn connect(&self, device: DeviceHandle) -> Result<SessionHandle> {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|s| !s.is_finished()) {
            return Err(RingError::SessionActive);
        }

        info!("Connecting to {}", device);
        let session =
            SessionHandle::spawn(Arc::clone(&self.transport), device, self.config.clone());
        *active = Some(session.clone());
        Ok(session)
    }

    /// Tear down the current session, if any
    ///
    /// # Errors
    ///
    /// See [`SessionHandle::disconnect`].
    pub async fn disconnect(&self) -> Result<()> {
        let session = lock(&self.active).clone();
        match session {
            Some(session) => session.disconnect().await,
            None => Ok(()),
        }
    }

    /// State of the current session, or the scanner state when there is none
    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        let idle = *self.idle.borrow();
        if idle == ConnectionState::Scanning {
            return idle;
        }
        lock(&self.active)
            .as_ref()
            .map_or(idle, SessionHandle::state)
    }

    /// The most recent session
    #[must_use]
    pub fn session(&self) -> Option<SessionHandle> {
        lock(&self.active).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockTransport, state::FailureReason};
    use tokio_test::assert_ok;

    const STATUS_69: [u8; 20] = [
        15, 6, 26, 1, 20, 16, 22, 32, 69, 0, 0, 5, 106, 0, 1, 20, 0, 0, 0, 0,
    ];
    const LEGACY_85: [u8; 12] = [3, 0, 0, 0, 0, 0, 0, 85, 0, 0, 0, 0];
    const HEALTH_STRESS_42: [u8; 10] = [0x0E, 0x04, 42, 0, 0, 0, 0, 0, 0, 0];

    fn supervisor(transport: &MockTransport) -> Supervisor {
        Supervisor::new(Arc::new(transport.clone()), SessionConfig::default())
    }

    async fn ready(transport: &MockTransport) -> (Supervisor, SessionHandle) {
        let supervisor = supervisor(transport);
        let session = supervisor.connect(MockTransport::ring()).unwrap();
        assert_ok!(session.wait_established().await);
        (supervisor, session)
    }

    async fn failure(session: &SessionHandle) -> FailureReason {
        match session.wait_established().await {
            Err(RingError::SessionFailed(reason)) => reason,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StateTransition>) -> Vec<ConnectionState> {
        let mut states = Vec::new();
        while let Ok(t) = rx.try_recv() {
            states.push(t.to);
        }
        states
    }

    async fn wait_for_state(session: &SessionHandle, target: ConnectionState) {
        let mut rx = session.state_changes();
        rx.wait_for(|s| *s == target).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_paired_ring_reaches_ready() {
        let transport = MockTransport::with_ring();
        let supervisor = supervisor(&transport);
        let session = supervisor.connect(MockTransport::ring()).unwrap();
        let mut transitions = session.transitions();

        assert_ok!(session.wait_established().await);
        assert_eq!(
            drain(&mut transitions),
            vec![
                ConnectionState::Connecting,
                ConnectionState::DiscoveringServices,
                ConnectionState::Subscribing,
                ConnectionState::Ready,
            ]
        );
        assert_eq!(supervisor.current_state(), ConnectionState::Ready);

        // Handshake and time sync during setup, battery query once ready
        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.opcodes(), vec![0x02, 0x01, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_in_progress_completes() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| {
            b.bond_state = BondState::Bonding;
            b.announce_bond = true;
        });
        let supervisor = supervisor(&transport);
        let session = supervisor.connect(MockTransport::ring()).unwrap();
        let mut transitions = session.transitions();

        assert_ok!(session.wait_established().await);
        assert!(drain(&mut transitions).contains(&ConnectionState::Bonding));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_without_completion_is_rejected() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.bond_state = BondState::Bonding);
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();

        let started = Instant::now();
        assert_eq!(failure(&session).await, FailureReason::BondRejected);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
        assert!(!transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pairing_is_rejected() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| {
            b.bond_state = BondState::None;
            b.bond_succeeds = false;
        });
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();
        assert_eq!(failure(&session).await, FailureReason::BondRejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_channel_is_protocol_mismatch() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.missing_channels.push(Channel::HeartRate));
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();

        assert_eq!(failure(&session).await, FailureReason::ProtocolMismatch);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_retried() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| {
            b.subscribe_failures.insert(Channel::Status, 2);
        });
        let (_supervisor, session) = ready(&transport).await;
        assert!(session.state().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_exhausted() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| {
            b.subscribe_failures.insert(Channel::Steps, 3);
        });
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();
        assert_eq!(failure(&session).await, FailureReason::RetriesExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_drop_is_peer_busy() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.drop_on_open = true);
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();

        assert_eq!(failure(&session).await, FailureReason::PeerBusy);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_right_after_ready_is_peer_busy() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;

        transport.drop_link();
        wait_for_state(&session, ConnectionState::Failed(FailureReason::PeerBusy)).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_stable_ready_reconnects() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;
        transport.notify(Channel::Status, &STATUS_69);
        session
            .snapshots()
            .wait_for(|s| s.battery_percent.is_some())
            .await
            .unwrap();

        sleep(Duration::from_secs(10)).await;
        let mut transitions = session.transitions();
        transport.drop_link();

        let mut seen = Vec::new();
        loop {
            let t = transitions.recv().await.unwrap();
            seen.push(t.to);
            if t.to == ConnectionState::Disconnected {
                // Link loss clears the snapshot before the state moves
                assert!(session.snapshot().is_empty());
            }
            if t.to == ConnectionState::Ready {
                break;
            }
        }
        assert_eq!(seen[0], ConnectionState::Disconnected);
        assert!(!seen.iter().any(|s| s.is_failed()));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;

        sleep(Duration::from_secs(10)).await;
        transport.configure(|b| b.open_failures = 100);
        transport.drop_link();

        wait_for_state(
            &session,
            ConnectionState::Failed(FailureReason::RetriesExhausted),
        )
        .await;
        assert_eq!(transport.open_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_sees_exhausted_retries() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;

        sleep(Duration::from_secs(10)).await;
        transport.configure(|b| b.open_failures = 100);
        transport.drop_link();
        wait_for_state(&session, ConnectionState::Disconnected).await;

        // Waiting from inside the backoff resolves with the terminal reason
        assert_eq!(failure(&session).await, FailureReason::RetriesExhausted);
        assert!(session.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_handshake_retried_once() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.reject_writes = 1);
        let supervisor = supervisor(&transport);

        let started = Instant::now();
        let session = supervisor.connect(MockTransport::ring()).unwrap();
        assert_ok!(session.wait_established().await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_secs(1));
        assert_eq!(transport.open_count(), 1);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.opcodes(), vec![0x02, 0x01, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_handshake_rejection_reconnects() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.reject_writes = 2);
        let supervisor = supervisor(&transport);
        let session = supervisor.connect(MockTransport::ring()).unwrap();
        let mut transitions = session.transitions();

        assert_ok!(session.wait_established().await);
        let seen = drain(&mut transitions);
        assert!(seen.contains(&ConnectionState::Disconnected));
        assert!(!seen.iter().any(|s| s.is_failed()));
        assert_eq!(seen.last(), Some(&ConnectionState::Ready));
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_commands_keep_session_ready() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;
        sleep(Duration::from_millis(10)).await;
        transport.configure(|b| b.reject_writes = 10);

        let error = session.send(Command::battery_query()).await.unwrap_err();
        assert!(matches!(error, RingError::CommandRejected(_)));
        assert!(session.state().is_ready());

        // Several keep-alive ticks fail without touching the link
        sleep(Duration::from_secs(50)).await;
        assert!(session.state().is_ready());
        assert_eq!(transport.open_count(), 1);

        transport.configure(|b| b.reject_writes = 0);
        assert_ok!(session.send(Command::battery_query()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_commands_keep_session_ready() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;
        sleep(Duration::from_millis(10)).await;
        transport.configure(|b| b.stall_writes = true);

        let error = session.send(Command::battery_query()).await.unwrap_err();
        assert!(matches!(error, RingError::Timeout { timeout_ms: 3000 }));

        sleep(Duration::from_secs(50)).await;
        assert!(session.state().is_ready());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_timeout_is_terminal() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.stall_open = true);
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();

        let started = Instant::now();
        assert_eq!(failure(&session).await, FailureReason::Timeout);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_timeouts_are_retried() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;

        sleep(Duration::from_secs(10)).await;
        transport.configure(|b| b.stall_open = true);
        transport.drop_link();

        wait_for_state(
            &session,
            ConnectionState::Failed(FailureReason::RetriesExhausted),
        )
        .await;
        assert_eq!(transport.open_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_measurements_and_clears_snapshot() {
        let transport = MockTransport::with_ring();
        let (supervisor, session) = ready(&transport).await;
        let mut events = session.measurement_events();

        transport.notify(Channel::Status, &STATUS_69);
        session
            .snapshots()
            .wait_for(|s| s.battery_percent == Some(69))
            .await
            .unwrap();

        assert_ok!(session.start_measurement(MeasurementKind::HeartRate).await);
        assert_ok!(session.start_measurement(MeasurementKind::SpO2).await);
        assert_eq!(session.active_measurements().len(), 2);

        assert_ok!(supervisor.disconnect().await);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.snapshot().is_empty());
        assert!(session.active_measurements().is_empty());
        assert!(!transport.is_connected());

        let mut cancelled = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let MeasurementEvent::Cancelled { kind, reason } = event {
                assert_eq!(reason, CancelReason::Disconnected);
                cancelled.push(kind);
            }
        }
        cancelled.sort();
        assert_eq!(
            cancelled,
            vec![MeasurementKind::HeartRate, MeasurementKind::SpO2]
        );
        assert!(matches!(
            session.wait_established().await,
            Err(RingError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_tie_break_through_session() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;

        transport.notify(Channel::Status, &STATUS_69);
        transport.notify(Channel::Status, &LEGACY_85);
        transport.notify(Channel::Status, &HEALTH_STRESS_42);
        session
            .snapshots()
            .wait_for(|s| s.stress == Some(42))
            .await
            .unwrap();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.battery_percent, Some(69));
        assert_eq!(snapshot.heart_rate_bpm, Some(106));
        assert_eq!(session.decode_stats().superseded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_packets_reach_snapshot() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;

        transport.notify(Channel::Steps, &[7, 137]);
        transport.notify(Channel::Steps, &[7, 137, 1, 0, 38, 1, 0, 11, 0, 0]);
        let snapshot = session
            .snapshots()
            .wait_for(|s| s.steps.is_some())
            .await
            .unwrap()
            .clone();

        assert_eq!(snapshot.steps, Some(393));
        assert_eq!(snapshot.distance_m, Some(294));
        assert_eq!(snapshot.calories_kcal, Some(11));
        assert_eq!(session.decode_stats().too_short, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_ticks() {
        let transport = MockTransport::with_ring();
        let (_supervisor, _session) = ready(&transport).await;
        sleep(Duration::from_millis(10)).await;
        transport.clear_writes();

        sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.opcodes(), vec![0x04, 0x04]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_rejected_until_ready() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.stall_open = true);
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();
        wait_for_state(&session, ConnectionState::Connecting).await;

        let error = session
            .start_measurement(MeasurementKind::HeartRate)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            RingError::NotReady {
                state: ConnectionState::Connecting
            }
        ));
        assert!(session.measurement(MeasurementKind::HeartRate).is_none());
        assert!(session.send(Command::battery_query()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_passthrough() {
        let transport = MockTransport::with_ring();
        let (_supervisor, session) = ready(&transport).await;
        sleep(Duration::from_millis(10)).await;
        transport.clear_writes();

        assert_ok!(session.send(Command::measurement_sample(MeasurementKind::Stress)).await);
        assert_eq!(transport.writes(), vec![vec![0x12, 0x04]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_live_session() {
        let transport = MockTransport::with_ring();
        let (supervisor, _session) = ready(&transport).await;

        assert!(matches!(
            supervisor.connect(MockTransport::ring()),
            Err(RingError::SessionActive)
        ));
        assert!(matches!(
            supervisor.scan(&ScanParams::default()).await,
            Err(RingError::SessionActive)
        ));

        assert_ok!(supervisor.disconnect().await);
        let again = supervisor.connect(MockTransport::ring()).unwrap();
        assert_ok!(again.wait_established().await);
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.open_failures = 100);
        let session = supervisor(&transport).connect(MockTransport::ring()).unwrap();
        wait_for_state(&session, ConnectionState::Disconnected).await;

        assert_ok!(session.disconnect().await);
        assert!(session.is_finished());
        assert!(matches!(
            session.wait_established().await,
            Err(RingError::Disconnected)
        ));

        // Further disconnects are no-ops
        assert_ok!(session.disconnect().await);
        let opens = transport.open_count();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), opens);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_adapter() {
        let transport = MockTransport::with_ring();
        transport.configure(|b| b.unavailable = true);
        let supervisor = supervisor(&transport);

        assert!(matches!(
            supervisor.find_first(&ScanParams::default()).await,
            Err(RingError::LinkUnavailable)
        ));
        let session = supervisor.connect(MockTransport::ring()).unwrap();
        assert_eq!(failure(&session).await, FailureReason::LinkUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_through_supervisor() {
        let transport = MockTransport::with_ring();
        let supervisor = supervisor(&transport);

        let device = supervisor.find_first(&ScanParams::default()).await.unwrap();
        assert_eq!(device, MockTransport::ring());
        assert_eq!(supervisor.current_state(), ConnectionState::Idle);
    }
}
