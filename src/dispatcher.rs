//! Command dispatcher: the single owner of a [`DeviceSession`].
//!
//! Writes are serialized per characteristic through a fair async mutex,
//! so same-characteristic commands go out strictly in submission order
//! while different characteristics may be in flight together. Decoded
//! measurement records are fanned out on a broadcast channel; each
//! subscriber sees records from the moment it subscribes, with no replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::DispatcherConfig;
use crate::errors::{BluetoothError, DispatchError, DriverError, Result};
use crate::experiment::StagePlan;
use crate::protocol::{
    decode_measurement, encode_button, encode_interval, encode_rate, encode_sync, ButtonCommand,
    Characteristic, MeasurementInterval, MeasurementRecord, PumpRateCommand,
};
use crate::session::{ConnectionState, DeviceSession};
use crate::transport::{GattTransport, NotificationStream};

type WriteResult = std::result::Result<(), DispatchError>;

pub struct Dispatcher {
    transport: Arc<dyn GattTransport>,
    config: DispatcherConfig,
    session: Mutex<DeviceSession>,
    /// One FIFO lane per characteristic, indexed by `Characteristic::index`.
    lanes: [tokio::sync::Mutex<()>; Characteristic::COUNT],
    records: broadcast::Sender<MeasurementRecord>,
    pump: Mutex<Option<JoinHandle<()>>>,
    /// Held by whichever experiment run currently drives this pump.
    run_claimed: AtomicBool,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn GattTransport>, config: DispatcherConfig) -> Arc<Self> {
        let (records, _) = broadcast::channel(config.notification_capacity.max(1));
        Arc::new(Self {
            transport,
            config,
            session: Mutex::new(DeviceSession::new()),
            lanes: Default::default(),
            records,
            pump: Mutex::new(None),
            run_claimed: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Connect the transport and subscribe to measurement notifications.
    ///
    /// A failed subscription drops the link and leaves the session
    /// `Disconnected`, so `connect` can simply be called again.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.session().begin_connect()?;

        if let Err(e) = self.transport.connect().await {
            warn!("transport connect failed: {}", e);
            self.session().link_lost();
            return Err(e.into());
        }
        self.session().mark_ready()?;

        // Subscription is requested once on entering Connected.
        let stream = match self.transport.subscribe(Characteristic::Measurement).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("measurement subscription failed: {}", e);
                if let Err(e) = self.transport.disconnect().await {
                    debug!("disconnect after failed subscription: {}", e);
                }
                self.session().link_lost();
                return Err(e.into());
            }
        };
        self.session().mark_subscribed()?;
        self.spawn_pump(stream);
        Ok(())
    }

    /// Re-establish a dropped link. The remembered plan is untouched.
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        if self.state() != ConnectionState::Disconnected {
            self.link_lost();
        }
        info!("reconnecting");
        self.connect().await
    }

    /// Tear the connection down and forget all session state.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_pump();
        let result = self.transport.disconnect().await;
        self.session().reset();
        result.map_err(DriverError::from)
    }

    /// Record a link loss reported by the transport.
    pub fn link_lost(&self) {
        self.stop_pump();
        self.session().link_lost();
    }

    fn spawn_pump(self: &Arc<Self>, mut stream: NotificationStream) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(bytes) = stream.next().await {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                this.handle_notification(&bytes);
            }
            if let Some(this) = weak.upgrade() {
                info!("measurement notification stream ended");
                this.session().link_lost();
            }
        });
        if let Some(old) = lock(&self.pump).replace(handle) {
            old.abort();
        }
    }

    fn stop_pump(&self) {
        if let Some(handle) = lock(&self.pump).take() {
            handle.abort();
        }
    }

    fn handle_notification(&self, bytes: &[u8]) {
        match decode_measurement(bytes) {
            Ok(record) => {
                self.session().record_measurement(record);
                // No receivers is fine: telemetry is live, not a log.
                let _ = self.records.send(record);
            }
            Err(e) => warn!("dropping notification {:02X?}: {}", bytes, e),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub async fn send_button(&self, cmd: ButtonCommand) -> WriteResult {
        debug!("button press: {}", cmd);
        self.write(Characteristic::ButtonPress, &encode_button(cmd))
            .await
    }

    /// Updates `last_commanded_rate` only once the write is confirmed.
    pub async fn send_rate(&self, rate: PumpRateCommand) -> WriteResult {
        self.write(Characteristic::PumpRate, &encode_rate(rate.ul_min()))
            .await?;
        self.session().record_commanded_rate(rate.ul_min());
        Ok(())
    }

    pub async fn send_interval(&self, interval: MeasurementInterval) -> WriteResult {
        self.write(
            Characteristic::MeasurementInterval,
            &encode_interval(interval.ms()),
        )
        .await
    }

    pub async fn send_sync(&self) -> WriteResult {
        self.write(Characteristic::Sync, encode_sync()).await
    }

    async fn write(&self, characteristic: Characteristic, payload: &[u8]) -> WriteResult {
        // Not connected fails now rather than queueing behind the lane.
        self.session().ensure_writable()?;
        let _lane = self.lanes[characteristic.index()].lock().await;
        // The link may have dropped while we waited our turn.
        self.session().ensure_writable()?;

        debug!("write {}: {:02X?}", characteristic, payload);
        let outcome = tokio::time::timeout(
            self.config.write_timeout,
            self.transport.write(characteristic, payload),
        )
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(BluetoothError::NotConnected(reason))) => {
                warn!("write {} failed, link down: {}", characteristic, reason);
                self.link_lost();
                Err(DispatchError::NotConnected)
            }
            Ok(Err(e)) => {
                warn!("write {} rejected: {}", characteristic, e);
                Err(DispatchError::Rejected(e.to_string()))
            }
            Err(_) => {
                warn!(
                    "write {} timed out after {:?}",
                    characteristic, self.config.write_timeout
                );
                Err(DispatchError::Timeout)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Notifications and state
    // ------------------------------------------------------------------------

    /// Live measurement feed from this point forward.
    ///
    /// The stream only ends when the dispatcher is dropped. A subscriber that
    /// falls more than `notification_capacity` records behind skips ahead.
    pub fn notifications(&self) -> impl Stream<Item = MeasurementRecord> + Send + 'static {
        BroadcastStream::new(self.records.subscribe()).filter_map(|item| async move {
            match item {
                Ok(record) => Some(record),
                Err(BroadcastStreamRecvError::Lagged(n)) => {
                    warn!("notification subscriber lagged, skipped {} records", n);
                    None
                }
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state()
    }

    pub fn last_measurement(&self) -> Option<MeasurementRecord> {
        self.session().last_measurement()
    }

    pub fn last_commanded_rate(&self) -> Option<u16> {
        self.session().last_commanded_rate()
    }

    pub fn clock_resyncs(&self) -> u64 {
        self.session().clock_resyncs()
    }

    pub fn remember_plan(&self, plan: StagePlan) {
        self.session().remember_plan(plan);
    }

    /// Reserve the pump for one experiment run and remember its plan.
    ///
    /// Fails with `RunInProgress` while another run holds the claim.
    pub(crate) fn claim_run(&self, plan: StagePlan) -> Result<()> {
        if self
            .run_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DriverError::RunInProgress);
        }
        self.remember_plan(plan);
        Ok(())
    }

    pub(crate) fn release_run(&self) {
        self.run_claimed.store(false, Ordering::Release);
    }

    /// True while an experiment run is driving this pump.
    pub fn run_active(&self) -> bool {
        self.run_claimed.load(Ordering::Acquire)
    }

    /// The last plan started on this session, kept across link loss.
    pub fn remembered_plan(&self) -> Option<StagePlan> {
        self.session().last_plan().cloned()
    }

    fn session(&self) -> MutexGuard<'_, DeviceSession> {
        lock(&self.session)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::time::sleep;

    use super::*;
    use crate::protocol::encode_measurement;
    use crate::transport::fake::{FakeTransport, Scripted};

    fn record(ts: u32, rate: u16) -> MeasurementRecord {
        MeasurementRecord {
            timestamp_ms: ts,
            psi_raw: 250,
            motor_current_raw: 40,
            pump_rate_ul_min: rate,
        }
    }

    async fn connected(transport: Arc<FakeTransport>) -> Arc<Dispatcher> {
        let dispatcher = Dispatcher::new(transport, DispatcherConfig::default());
        dispatcher.connect().await.unwrap();
        dispatcher
    }

    #[tokio::test(start_paused = true)]
    async fn connect_walks_the_state_machine() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default());
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        dispatcher.connect().await.unwrap();
        assert_eq!(dispatcher.state(), ConnectionState::Subscribed);
        assert!(dispatcher.connect().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_returns_to_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        transport.refuse_connect(true);
        let dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default());
        assert!(matches!(
            dispatcher.connect().await,
            Err(DriverError::Bluetooth(_))
        ));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);

        transport.refuse_connect(false);
        dispatcher.connect().await.unwrap();
        assert_eq!(dispatcher.state(), ConnectionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_subscription_returns_to_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        transport.refuse_subscribe(true);
        let dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default());
        assert!(matches!(
            dispatcher.connect().await,
            Err(DriverError::Bluetooth(_))
        ));
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert_eq!(
            dispatcher.send_rate(PumpRateCommand::new(500).unwrap()).await,
            Err(DispatchError::NotConnected)
        );

        transport.refuse_subscribe(false);
        dispatcher.connect().await.unwrap();
        assert_eq!(dispatcher.state(), ConnectionState::Subscribed);
    }

    #[test]
    fn run_claim_is_exclusive() {
        let dispatcher = Dispatcher::new(
            Arc::new(FakeTransport::new()),
            DispatcherConfig::default(),
        );
        let plan = StagePlan::new(vec![crate::experiment::ExperimentStage::hold(300, 5)]).unwrap();
        dispatcher.claim_run(plan.clone()).unwrap();
        assert!(dispatcher.run_active());
        assert!(matches!(
            dispatcher.claim_run(plan.clone()),
            Err(DriverError::RunInProgress)
        ));
        dispatcher.release_run();
        assert!(!dispatcher.run_active());
        dispatcher.claim_run(plan.clone()).unwrap();
        assert_eq!(dispatcher.remembered_plan(), Some(plan));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_fail_fast_when_disconnected() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = Dispatcher::new(transport.clone(), DispatcherConfig::default());
        let rate = PumpRateCommand::new(500).unwrap();
        assert_eq!(
            dispatcher.send_rate(rate).await,
            Err(DispatchError::NotConnected)
        );
        assert_eq!(
            dispatcher.send_button(ButtonCommand::RunStop).await,
            Err(DispatchError::NotConnected)
        );
        assert!(transport.writes().is_empty());
        assert_eq!(dispatcher.last_commanded_rate(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn encodes_every_command() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;

        dispatcher.send_button(ButtonCommand::Edit).await.unwrap();
        dispatcher
            .send_rate(PumpRateCommand::new(1000).unwrap())
            .await
            .unwrap();
        dispatcher
            .send_interval(MeasurementInterval::new(1000).unwrap())
            .await
            .unwrap();
        dispatcher.send_sync().await.unwrap();

        let writes: Vec<(Characteristic, Vec<u8>)> = transport
            .writes()
            .into_iter()
            .map(|w| (w.characteristic, w.payload))
            .collect();
        assert_eq!(
            writes,
            vec![
                (Characteristic::ButtonPress, vec![0x02, 0x01]),
                (Characteristic::PumpRate, vec![0xE8, 0x03]),
                (Characteristic::MeasurementInterval, vec![0xE8, 0x03]),
                (Characteristic::Sync, b"SYNC".to_vec()),
            ]
        );
        assert_eq!(dispatcher.last_commanded_rate(), Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn same_characteristic_writes_never_overlap() {
        let transport = Arc::new(FakeTransport::with_write_delay(Duration::from_millis(100)));
        let dispatcher = connected(transport.clone()).await;

        let first = PumpRateCommand::new(100).unwrap();
        let second = PumpRateCommand::new(200).unwrap();
        let (a, b) = tokio::join!(dispatcher.send_rate(first), dispatcher.send_rate(second));
        a.unwrap();
        b.unwrap();

        let writes = transport.writes_to(Characteristic::PumpRate);
        assert_eq!(writes.len(), 2);
        assert_eq!(transport.rates(), vec![100, 200]);
        assert!(writes[1].started >= writes[0].finished);
        assert_eq!(dispatcher.last_commanded_rate(), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn different_characteristics_may_overlap() {
        let transport = Arc::new(FakeTransport::with_write_delay(Duration::from_millis(100)));
        let dispatcher = connected(transport.clone()).await;

        let (a, b) = tokio::join!(
            dispatcher.send_rate(PumpRateCommand::new(300).unwrap()),
            dispatcher.send_button(ButtonCommand::RunStop)
        );
        a.unwrap();
        b.unwrap();

        let rate = &transport.writes_to(Characteristic::PumpRate)[0];
        let button = &transport.writes_to(Characteristic::ButtonPress)[0];
        assert!(button.started < rate.finished);
        assert!(rate.started < button.finished);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_not_retried() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;

        transport.script(Scripted::Fail(BluetoothError::Gatt("busy".into())));
        let rate = PumpRateCommand::new(700).unwrap();
        assert!(matches!(
            dispatcher.send_rate(rate).await,
            Err(DispatchError::Rejected(_))
        ));
        assert!(transport.writes().is_empty());
        assert_eq!(dispatcher.last_commanded_rate(), None);

        transport.script(Scripted::Hang);
        assert_eq!(dispatcher.send_rate(rate).await, Err(DispatchError::Timeout));
        assert_eq!(dispatcher.last_commanded_rate(), None);

        dispatcher.send_rate(rate).await.unwrap();
        assert_eq!(dispatcher.last_commanded_rate(), Some(700));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_link_down_on_write_disconnects() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;

        transport.script(Scripted::Fail(BluetoothError::NotConnected("gone".into())));
        assert_eq!(
            dispatcher.send_sync().await,
            Err(DispatchError::NotConnected)
        );
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_fan_out_without_replay() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;

        let mut early = Box::pin(dispatcher.notifications());
        transport.push_notification(encode_measurement(&record(1, 10)).to_vec());
        // Give the pump task a chance to forward it.
        sleep(Duration::from_millis(1)).await;

        let mut late = Box::pin(dispatcher.notifications());
        transport.push_notification(encode_measurement(&record(2, 20)).to_vec());
        transport.push_notification(encode_measurement(&record(2, 20)).to_vec());

        assert_eq!(early.next().await, Some(record(1, 10)));
        assert_eq!(early.next().await, Some(record(2, 20)));
        assert_eq!(early.next().await, Some(record(2, 20)));
        assert_eq!(late.next().await, Some(record(2, 20)));
        assert_eq!(late.next().await, Some(record(2, 20)));
        assert_eq!(dispatcher.last_measurement(), Some(record(2, 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_notifications_are_skipped() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;
        let mut feed = Box::pin(dispatcher.notifications());

        transport.push_notification(vec![0x01, 0x02, 0x03]);
        transport.push_notification(encode_measurement(&record(9, 90)).to_vec());

        assert_eq!(feed.next().await, Some(record(9, 90)));
        assert_eq!(dispatcher.state(), ConnectionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_is_link_loss_and_plan_survives() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;
        let plan = StagePlan::new(vec![crate::experiment::ExperimentStage::hold(400, 30)]).unwrap();
        dispatcher.remember_plan(plan.clone());

        transport.push_notification(encode_measurement(&record(5, 50)).to_vec());
        sleep(Duration::from_millis(1)).await;
        assert!(dispatcher.last_measurement().is_some());

        transport.drop_link();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert_eq!(dispatcher.last_measurement(), None);
        assert_eq!(dispatcher.remembered_plan(), Some(plan.clone()));

        dispatcher.reconnect().await.unwrap();
        assert_eq!(dispatcher.state(), ConnectionState::Subscribed);
        assert_eq!(dispatcher.remembered_plan(), Some(plan));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_session() {
        let transport = Arc::new(FakeTransport::new());
        let dispatcher = connected(transport.clone()).await;
        dispatcher
            .send_rate(PumpRateCommand::new(100).unwrap())
            .await
            .unwrap();
        dispatcher.disconnect().await.unwrap();
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
        assert_eq!(dispatcher.last_commanded_rate(), None);
    }
}
