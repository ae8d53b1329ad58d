//! A connected force sensor: notification pump, streaming engine and test
//! runners behind one handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::characteristic_io::CharacteristicIo;
use crate::config::DeviceConfig;
use crate::decoder::{Command, CommandResponse, DecodedEvent, RawValue};
use crate::descriptor::{DeviceDescriptor, DeviceFamily};
use crate::error::GripError;
use crate::measurement::{ForceMeasurement, ForceSample, Unit};
use crate::protocol::{
    Activity, ActivityMonitor, CriticalForceOptions, CriticalForceResult, CriticalForceSession,
    PeakForceOptions, PeakForceResult, PeakForceSession, RfdOptions, RfdResult, RfdSession, Step,
    TestOutcome, TestSession,
};
use crate::stream::{EngineState, StreamingEngine, TareState};
use crate::transport::{NotificationStream, Transport, TransportError};

/// What subscribers of a device see.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Measurement(ForceMeasurement),
    /// The stream ended: its duration elapsed or it was stopped.
    Stopped,
    /// The notification stream closed.
    Disconnected,
}

type TareWaiter = oneshot::Sender<Option<TareState>>;

struct Shared<T> {
    io: CharacteristicIo<T>,
    engine: Mutex<StreamingEngine>,
    events: broadcast::Sender<StreamEvent>,
    battery: watch::Sender<Option<u8>>,
    tare_waiter: Mutex<Option<TareWaiter>>,
    clock: Instant,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Transport> Shared<T> {
    fn engine(&self) -> MutexGuard<'_, StreamingEngine> {
        lock(&self.engine)
    }

    fn dispatch(&self, bytes: &[u8]) {
        let received_at_ms = self.clock.elapsed().as_millis() as u64;
        for event in self.io.route(bytes, received_at_ms) {
            match event {
                DecodedEvent::WeightSample(sample) => self.ingest(std::slice::from_ref(&sample)),
                DecodedEvent::WeightFrame(frame) => self.ingest(&frame),
                DecodedEvent::BatteryLevel(level) => {
                    self.battery.send_replace(Some(level));
                }
                DecodedEvent::ErrorInfo(info) => warn!("device reported: {info}"),
                DecodedEvent::LowPower => warn!("device battery is low"),
                DecodedEvent::CommandAck(_) => {}
                DecodedEvent::DecodeError(err) => debug!("skipping malformed notification: {err}"),
            }
        }
    }

    fn ingest(&self, frame: &[ForceSample]) {
        let out = self.engine().ingest_frame(frame);
        if let Some(tare) = out.tare_completed {
            if let Some(waiter) = lock(&self.tare_waiter).take() {
                let _ = waiter.send(Some(tare));
            }
        }
        // Nobody listening is fine.
        if let Some(measurement) = out.measurement {
            let _ = self.events.send(StreamEvent::Measurement(measurement));
        }
        if out.stopped {
            let _ = self.events.send(StreamEvent::Stopped);
        }
    }

    fn connection_lost(&self) {
        self.io.mailbox().clear_all();
        self.engine().cancel_tare();
        self.engine().stop();
        lock(&self.tare_waiter).take();
        let _ = self.events.send(StreamEvent::Disconnected);
    }
}

async fn pump<T: Transport>(shared: Arc<Shared<T>>, mut notifications: NotificationStream) {
    while let Some(item) = notifications.next().await {
        match item {
            Ok(bytes) => shared.dispatch(&bytes),
            Err(TransportError::Disconnected) => break,
            Err(err) => warn!("notification error: {err}"),
        }
    }
    info!("notification stream closed");
    shared.connection_lost();
}

/// Holds a busy flag for as long as it lives.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool, what: &'static str) -> Result<Self, GripError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| GripError::Busy(what))?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A connected grip sensor.
///
/// Notifications are consumed by a background task for the whole life of
/// the handle, so responses to [`write`](Self::write) keep flowing while
/// tests run. Live measurements are available to any number of
/// [`subscribe`](Self::subscribe)rs.
pub struct ForceDevice<T> {
    shared: Arc<Shared<T>>,
    config: DeviceConfig,
    pump: JoinHandle<()>,
    tare_active: AtomicBool,
    test_active: AtomicBool,
    cancel: watch::Sender<u64>,
}

impl<T> Drop for ForceDevice<T> {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl<T: Transport> ForceDevice<T> {
    /// Subscribe to the descriptor's notify characteristic (or to
    /// advertisements) and start routing.
    pub async fn attach(
        transport: Arc<T>,
        descriptor: DeviceDescriptor,
        config: DeviceConfig,
    ) -> Result<Self, GripError> {
        config.validate()?;
        if !transport.is_connected() {
            return Err(GripError::NotConnected);
        }

        let notifications = match &descriptor.notify_channel {
            Some(channel) => {
                let (service, characteristic) = descriptor
                    .resolve(&channel.service, &channel.characteristic)
                    .ok_or_else(|| GripError::UnknownCharacteristic {
                        service: channel.service.clone(),
                        characteristic: channel.characteristic.clone(),
                    })?;
                transport.subscribe(service, characteristic).await?
            }
            None => transport.advertisements().await?,
        };

        info!("attached to {} ({:?})", descriptor.name, descriptor.family);
        let (events, _) = broadcast::channel(config.broadcast_capacity);
        let shared = Arc::new(Shared {
            io: CharacteristicIo::new(transport, descriptor),
            engine: Mutex::new(StreamingEngine::new(config.unit)),
            events,
            battery: watch::Sender::new(None),
            tare_waiter: Mutex::new(None),
            clock: Instant::now(),
        });
        let pump = tokio::spawn(pump(shared.clone(), notifications));

        Ok(Self {
            shared,
            config,
            pump,
            tare_active: AtomicBool::new(false),
            test_active: AtomicBool::new(false),
            cancel: watch::Sender::new(0),
        })
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.shared.io.descriptor()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.io.transport().is_connected()
    }

    /// Live events, including measurements taken while a test runs.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Last battery level pushed by the device.
    pub fn battery(&self) -> Option<u8> {
        *self.shared.battery.borrow()
    }

    pub fn engine_state(&self) -> EngineState {
        self.shared.engine().state()
    }

    pub fn tare_state(&self) -> TareState {
        self.shared.engine().tare_state()
    }

    pub fn set_unit(&self, unit: Unit) {
        self.shared.engine().set_unit(unit);
    }

    pub async fn read(&self, service_id: &str, characteristic_id: &str) -> Result<RawValue, GripError> {
        self.shared.io.read(service_id, characteristic_id).await
    }

    pub async fn write(
        &self,
        service_id: &str,
        characteristic_id: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandResponse, GripError> {
        self.shared
            .io
            .write(service_id, characteristic_id, command, timeout)
            .await
    }

    /// Send `command` on the descriptor's command channel. A non-zero
    /// return code is reported as [`GripError::DeviceError`].
    pub async fn command(&self, command: Command) -> Result<CommandResponse, GripError> {
        let channel = self
            .descriptor()
            .command_channel
            .clone()
            .ok_or(GripError::Unsupported("commands"))?;
        let response = self
            .write(
                &channel.service,
                &channel.characteristic,
                &command,
                self.config.write_timeout(),
            )
            .await?;
        if !response.is_success() {
            return Err(GripError::DeviceError(format!(
                "{command} returned code {}",
                response.return_code
            )));
        }
        Ok(response)
    }

    /// Battery percentage read from the standard battery service.
    pub async fn read_battery_level(&self) -> Result<u8, GripError> {
        match self.read("battery", "level").await? {
            RawValue::Number(level) => {
                let level = level.min(100) as u8;
                self.shared.battery.send_replace(Some(level));
                Ok(level)
            }
            other => Err(GripError::DeviceError(format!("unexpected battery value {other:?}"))),
        }
    }

    fn accepts_commands(&self) -> bool {
        self.descriptor().family != DeviceFamily::Advertisement
    }

    /// Begin streaming measurements to subscribers. `None` or `Some(0)`
    /// streams until [`stop`](Self::stop).
    pub async fn start(&self, duration_ms: Option<u64>) -> Result<(), GripError> {
        self.shared.engine().start(duration_ms);
        if self.accepts_commands() {
            if let Err(err) = self.command(Command::StartWeightMeasurement).await {
                self.shared.engine().stop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop streaming. A no-op if nothing is streaming.
    pub async fn stop(&self) -> Result<(), GripError> {
        let was_streaming = self.shared.engine().stop();
        if !was_streaming {
            return Ok(());
        }
        let _ = self.shared.events.send(StreamEvent::Stopped);
        if self.accepts_commands() && self.is_connected() {
            self.command(Command::StopWeightMeasurement).await?;
        }
        Ok(())
    }

    /// Wait for the next event, skipping over anything this subscriber was
    /// too slow to receive.
    async fn next_event(
        &self,
        events: &mut broadcast::Receiver<StreamEvent>,
    ) -> Result<StreamEvent, GripError> {
        loop {
            match timeout(self.config.sample_timeout(), events.recv()).await {
                Ok(Ok(event)) => return Ok(event),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("slow consumer skipped {skipped} measurements");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(GripError::NotConnected),
                Err(_) => {
                    return Err(GripError::Timeout {
                        timeout_ms: self.config.sample_timeout_ms,
                    })
                }
            }
        }
    }

    /// Stream measurements into `on_measurement` until the duration elapses,
    /// [`stop`](Self::stop) is called, or the connection drops.
    pub async fn stream<F>(&self, mut on_measurement: F, duration_ms: Option<u64>) -> Result<(), GripError>
    where
        F: FnMut(&ForceMeasurement),
    {
        let mut events = self.subscribe();
        self.start(duration_ms).await?;
        loop {
            match self.next_event(&mut events).await {
                Ok(StreamEvent::Measurement(m)) => on_measurement(&m),
                Ok(StreamEvent::Stopped) => break,
                Ok(StreamEvent::Disconnected) => return Err(GripError::NotConnected),
                Err(err) => {
                    self.shared.engine().stop();
                    return Err(err);
                }
            }
        }
        // Duration expiry leaves the device sending.
        if self.accepts_commands() && self.is_connected() {
            self.command(Command::StopWeightMeasurement).await?;
        }
        Ok(())
    }

    /// Zero the scale on the mean of `duration_ms` worth of samples.
    ///
    /// Returns `Cancelled` if [`cancel_tare`](Self::cancel_tare) was called.
    /// Dropping the future also abandons the tare and keeps the previous
    /// offset.
    pub async fn tare(&self, duration_ms: u64) -> Result<TestOutcome<TareState>, GripError> {
        let _busy = BusyGuard::acquire(&self.tare_active, "tare")?;
        let (waiter, done) = oneshot::channel();
        *lock(&self.shared.tare_waiter) = Some(waiter);
        self.shared.engine().begin_tare(duration_ms);
        let _cleanup = TareCleanup(self.shared.as_ref());

        let was_streaming = self.engine_state() == EngineState::Streaming;
        if !was_streaming && self.accepts_commands() {
            self.command(Command::StartWeightMeasurement).await?;
        }

        let limit = Duration::from_millis(duration_ms) + self.config.sample_timeout();
        let outcome = match timeout(limit, done).await {
            Ok(Ok(Some(tare))) => Ok(TestOutcome::Complete(tare)),
            Ok(Ok(None)) => Ok(TestOutcome::Cancelled),
            Ok(Err(_)) => Err(GripError::NotConnected),
            Err(_) => Err(GripError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            }),
        };

        if !was_streaming && self.accepts_commands() && self.is_connected() {
            self.command(Command::StopWeightMeasurement).await?;
        }
        outcome
    }

    /// Abandon a running tare; the previous offset stays in force.
    pub fn cancel_tare(&self) {
        if self.shared.engine().cancel_tare() {
            if let Some(waiter) = lock(&self.shared.tare_waiter).take() {
                let _ = waiter.send(None);
            }
        }
    }

    /// Stop the running test at the next sample boundary.
    pub fn cancel_test(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }

    async fn run_session<S: TestSession>(
        &self,
        session: &mut S,
        name: &'static str,
    ) -> Result<TestOutcome<S::Output>, GripError> {
        let _busy = BusyGuard::acquire(&self.test_active, "test")?;
        let mut cancel = self.cancel.subscribe();
        cancel.borrow_and_update();
        let mut events = self.subscribe();

        let started_here = self.engine_state() != EngineState::Streaming;
        if started_here {
            self.start(None).await?;
        }
        info!("{name} started");

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break Ok(TestOutcome::Cancelled),
                event = self.next_event(&mut events) => match event {
                    Ok(StreamEvent::Measurement(m)) => {
                        if let Step::Complete(result) = session.feed(&m) {
                            break Ok(TestOutcome::Complete(result));
                        }
                    }
                    Ok(StreamEvent::Stopped) | Ok(StreamEvent::Disconnected) => {
                        break Ok(TestOutcome::Cancelled)
                    }
                    Err(err) => break Err(err),
                },
            }
        };

        if !matches!(outcome, Ok(TestOutcome::Complete(_))) {
            session.cancel();
            info!("{name} cancelled");
        } else {
            info!("{name} complete");
        }
        if started_here && self.is_connected() {
            if let Err(err) = self.stop().await {
                warn!("could not stop streaming after {name}: {err}");
            }
        }
        outcome
    }

    /// Report debounced activity changes until the test is cancelled or the
    /// stream stops, then complete with the last confirmed state. A lost
    /// connection ends it as `Cancelled`.
    pub async fn run_activity_monitor<F>(
        &self,
        threshold: f64,
        duration_ms: u64,
        mut on_change: F,
    ) -> Result<TestOutcome<Activity>, GripError>
    where
        F: FnMut(Activity),
    {
        let mut watch = ActivityWatch {
            monitor: ActivityMonitor::new(threshold, duration_ms),
            last: Activity::Inactive,
            on_change: &mut on_change,
        };
        let outcome = self.run_session(&mut watch, "activity monitor").await?;
        Ok(match outcome {
            TestOutcome::Cancelled if self.is_connected() => TestOutcome::Complete(watch.last),
            other => other,
        })
    }

    pub async fn run_rfd(&self, options: RfdOptions) -> Result<TestOutcome<RfdResult>, GripError> {
        self.run_session(&mut RfdSession::new(options), "rfd").await
    }

    pub async fn run_critical_force(
        &self,
        options: CriticalForceOptions,
    ) -> Result<TestOutcome<CriticalForceResult>, GripError> {
        self.run_session(&mut CriticalForceSession::new(options), "critical force")
            .await
    }

    pub async fn run_peak_force_mvc(
        &self,
        options: PeakForceOptions,
    ) -> Result<TestOutcome<PeakForceResult>, GripError> {
        self.run_session(&mut PeakForceSession::new(options), "peak force")
            .await
    }

    /// Close the link. Pending commands, an unfinished tare and any running
    /// test end as they would on a dropped connection.
    pub async fn disconnect(&self) -> Result<(), GripError> {
        self.pump.abort();
        let result = self.shared.io.transport().disconnect().await;
        self.shared.connection_lost();
        result.map_err(GripError::from)
    }
}

/// Abandons an unfinished tare when the waiting future goes away.
struct TareCleanup<'a, T: Transport>(&'a Shared<T>);

impl<T: Transport> Drop for TareCleanup<'_, T> {
    fn drop(&mut self) {
        if self.0.engine().cancel_tare() {
            debug!("tare abandoned");
        }
        lock(&self.0.tare_waiter).take();
    }
}

/// Adapts the activity monitor, which never completes, to the test runner.
struct ActivityWatch<'a, F> {
    monitor: ActivityMonitor,
    last: Activity,
    on_change: &'a mut F,
}

impl<F: FnMut(Activity)> TestSession for ActivityWatch<'_, F> {
    type Output = Activity;

    fn feed(&mut self, measurement: &ForceMeasurement) -> Step<Activity> {
        if let Some(activity) = self.monitor.feed(measurement.timestamp_ms, measurement.current) {
            self.last = activity;
            (self.on_change)(activity);
        }
        Step::Pending
    }

    fn cancel(&mut self) {
        self.monitor.cancel();
    }
}
