use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::{const_mutex, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use super::Transport;
use crate::command::Command;
use crate::config::BleConfig;
use crate::device::{Device, TransportKind};
use crate::mapping::ChannelMapping;
use crate::packet::{self, DecodedFrame, Frame};
use crate::{ConnectError, Error, Result};

/// Addresses with a live session in this process
static LIVE_SESSIONS: Mutex<BTreeSet<String>> = const_mutex(BTreeSet::new());

/// Holds a device address in [`LIVE_SESSIONS`] until dropped
#[derive(Debug)]
struct SessionGuard {
    address: String,
}

impl SessionGuard {
    fn claim(address: &str) -> std::result::Result<Self, ConnectError> {
        let address = address.to_lowercase();
        if !LIVE_SESSIONS.lock().insert(address.clone()) {
            return Err(ConnectError::AlreadyConnected(address));
        }
        Ok(Self { address })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        LIVE_SESSIONS.lock().remove(&self.address);
    }
}

/// Gets the default Bluetooth adapter
#[instrument(skip(manager))]
async fn get_central(manager: &Manager) -> Result<Adapter> {
    debug!("Getting default Bluetooth adapter");
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            error!("No Bluetooth adapters found");
            ConnectError::NoAdapter
        })?;
    debug!("Using Bluetooth adapter");
    Ok(adapter)
}

/// Bound on cleanup calls made after a failed or abandoned connect
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs a connect step until `deadline`, mapping expiry to [`ConnectError::Timeout`]
async fn with_deadline<T>(
    deadline: Instant,
    timeout: Duration,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    match time::timeout_at(deadline, step).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(timeout).into()),
    }
}

/// Like [`with_deadline`], then runs `cleanup` whatever the outcome
async fn with_cleanup<T>(
    deadline: Instant,
    timeout: Duration,
    step: impl Future<Output = Result<T>>,
    cleanup: impl Future<Output = ()>,
) -> Result<T> {
    let result = with_deadline(deadline, timeout, step).await;
    cleanup.await;
    result
}

/// Like [`with_deadline`], running `release` only if the step fails or expires
async fn or_release<T>(
    deadline: Instant,
    timeout: Duration,
    step: impl Future<Output = Result<T>>,
    release: impl Future<Output = ()>,
) -> Result<T> {
    let result = with_deadline(deadline, timeout, step).await;
    if result.is_err() {
        release.await;
    }
    result
}

/// Aborts the notification task and finishes `unlink` on the current runtime
fn release_in_background(
    notify_task: Option<JoinHandle<()>>,
    unlink: impl Future<Output = ()> + Send + 'static,
) {
    if let Some(task) = notify_task {
        task.abort();
    }
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(unlink);
        }
        Err(_) => warn!("No runtime left to disconnect on, the link may stay up"),
    }
}

async fn disconnect_quietly(peripheral: Peripheral) {
    match time::timeout(CLEANUP_TIMEOUT, peripheral.disconnect()).await {
        Ok(Ok(())) => debug!("Released BLE link"),
        Ok(Err(e)) => debug!("Disconnect after failure: {}", e),
        Err(_) => warn!("Disconnect did not finish within {:?}", CLEANUP_TIMEOUT),
    }
}

fn ble_error(e: btleplug::Error) -> Error {
    ConnectError::Ble(e.to_string()).into()
}

/// An open GATT connection
struct BleSession {
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    notify_characteristic: Option<Characteristic>,
    notify_task: Option<JoinHandle<()>>,
    guard: Option<SessionGuard>,
    closed: bool,
}

impl Drop for BleSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!("Session dropped while connected, disconnecting in the background");
        let peripheral = self.peripheral.clone();
        // The address stays claimed until the link is down
        let guard = self.guard.take();
        release_in_background(self.notify_task.take(), async move {
            disconnect_quietly(peripheral).await;
            drop(guard);
        });
    }
}

/// Bluetooth LE transport for a single bulb
pub struct BleTransport {
    device: Device,
    config: BleConfig,
    session: Option<BleSession>,
}

impl BleTransport {
    pub fn new(device: Device, config: BleConfig) -> Self {
        Self {
            device,
            config,
            session: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Scans for nearby devices whose advertised name matches the config.
    ///
    /// Returns whatever was found when `timeout` elapses, possibly nothing.
    #[instrument(skip(config))]
    pub async fn scan(config: &BleConfig, timeout: Duration) -> Result<Vec<Device>> {
        let manager = Manager::new().await?;
        let central = get_central(&manager).await?;

        info!("Scanning for Govee BLE devices...");
        central.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + timeout;
        let mut found: Vec<Device> = Vec::new();

        loop {
            for p in central.peripherals().await? {
                let Ok(Some(props)) = p.properties().await else {
                    continue;
                };
                let Some(name) = props.local_name else {
                    continue;
                };
                if !config.matches_name(&name) {
                    trace!("Ignoring device: {}", name);
                    continue;
                }

                let address = p.address().to_string();
                if found.iter().any(|d| d.address() == address) {
                    continue;
                }
                info!("Found device: {} | {} | RSSI: {:?}", name, address, props.rssi);
                found.push(Device::ble(address, name));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            time::sleep(config.scan_poll_interval.min(deadline - now)).await;
        }

        central.stop_scan().await?;
        info!("Scan finished, {} device(s) found", found.len());
        Ok(found)
    }

    /// Scans until the target device shows up, then connects and resolves
    /// characteristics, all before `timeout` runs out.
    ///
    /// Scanning is stopped on every exit path, and a link that came up before
    /// a later step failed is disconnected again.
    #[instrument(skip(self, guard), fields(device = %self.device))]
    async fn open_session(&self, guard: SessionGuard, timeout: Duration) -> Result<BleSession> {
        let deadline = Instant::now() + timeout;
        let central = with_deadline(deadline, timeout, async {
            let manager = Manager::new().await.map_err(ble_error)?;
            get_central(&manager).await
        })
        .await?;

        debug!("Scanning for {}", self.device.address());
        let peripheral = with_cleanup(
            deadline,
            timeout,
            async {
                central
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(ble_error)?;
                self.find_peripheral(&central).await
            },
            async {
                match time::timeout(CLEANUP_TIMEOUT, central.stop_scan()).await {
                    Ok(Ok(())) => trace!("Scan stopped"),
                    Ok(Err(e)) => warn!("Failed to stop scan: {}", e),
                    Err(_) => warn!("Stopping the scan did not finish within {:?}", CLEANUP_TIMEOUT),
                }
            },
        )
        .await?;

        info!("Connecting to device...");
        let (write_characteristic, notify_characteristic) = or_release(
            deadline,
            timeout,
            self.attach(&peripheral),
            disconnect_quietly(peripheral.clone()),
        )
        .await?;

        Ok(BleSession {
            peripheral,
            write_characteristic,
            notify_characteristic,
            notify_task: None,
            guard: Some(guard),
            closed: false,
        })
    }

    /// Polls the adapter until the target address shows up
    async fn find_peripheral(&self, central: &Adapter) -> Result<Peripheral> {
        let target = self.device.address().to_lowercase();
        loop {
            let peripherals = central.peripherals().await.map_err(ble_error)?;
            trace!("Found {} BLE peripherals so far", peripherals.len());

            let matched = peripherals.into_iter().find(|p| {
                p.address().to_string().to_lowercase() == target
                    || p.id().to_string().to_lowercase() == target
            });
            if let Some(p) = matched {
                return Ok(p);
            }
            time::sleep(self.config.scan_poll_interval).await;
        }
    }

    /// Connects and looks up the write and notify characteristics
    async fn attach(
        &self,
        peripheral: &Peripheral,
    ) -> Result<(Characteristic, Option<Characteristic>)> {
        if !peripheral.is_connected().await.map_err(ble_error)? {
            peripheral.connect().await.map_err(ble_error)?;
        }

        debug!("Discovering services...");
        peripheral.discover_services().await.map_err(ble_error)?;

        let characteristics = peripheral.characteristics();
        let write_characteristic = characteristics
            .iter()
            .find(|c| c.uuid == self.config.write_uuid)
            .cloned()
            .ok_or(ConnectError::CharacteristicNotFound(self.config.write_uuid))?;
        debug!("Found write characteristic: {}", write_characteristic.uuid);

        let notify_characteristic = characteristics
            .iter()
            .find(|c| c.uuid == self.config.notify_uuid)
            .cloned();
        if notify_characteristic.is_none() {
            debug!("Notify characteristic not found, but this is optional");
        }

        Ok((write_characteristic, notify_characteristic))
    }

    async fn write_frame(&self, frame: &Frame) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NotConnected)?;
        trace!("Writing frame {}", frame);

        // No retry here, the caller decides whether to resend
        session
            .peripheral
            .write(
                &session.write_characteristic,
                frame.as_bytes(),
                WriteType::WithoutResponse,
            )
            .await
            .map_err(|e| {
                warn!("Write failed: {}", e);
                Error::Send(e.to_string())
            })
    }

    /// Subscribes to the notify characteristic.
    ///
    /// `handler` is called from a background task with every notification that
    /// decodes as a frame. Fails with [`Error::NotSupported`] when the device has
    /// no notify characteristic or refuses the subscription.
    #[instrument(skip(self, handler), fields(device = %self.device))]
    pub async fn subscribe<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(DecodedFrame) + Send + 'static,
    {
        let notify_uuid = self.config.notify_uuid;
        let session = self.session.as_mut().ok_or(Error::NotConnected)?;
        let characteristic = session
            .notify_characteristic
            .clone()
            .ok_or_else(|| Error::NotSupported(format!("notify characteristic {notify_uuid}")))?;

        if let Err(e) = session.peripheral.subscribe(&characteristic).await {
            warn!("Device rejected notify subscription: {}", e);
            return Err(Error::NotSupported(format!("notify subscription: {e}")));
        }
        let mut notifications = session.peripheral.notifications().await?;

        if let Some(previous) = session.notify_task.take() {
            previous.abort();
        }
        session.notify_task = Some(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != notify_uuid {
                    continue;
                }
                match packet::decode(&notification.value) {
                    Ok(frame) => {
                        trace!("Notification: opcode={:#04x}", frame.opcode);
                        handler(frame);
                    }
                    Err(e) => debug!("Ignoring notification: {}", e),
                }
            }
            debug!("Notification stream ended");
        }));

        info!("Subscribed to {}", notify_uuid);
        Ok(())
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn device(&self) -> &Device {
        &self.device
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if self.device.kind() != TransportKind::Ble {
            return Err(ConnectError::WrongTransport(self.device.address().to_string()).into());
        }
        if self.session.is_some() {
            return Err(ConnectError::AlreadyConnected(self.device.address().to_string()).into());
        }

        let guard = SessionGuard::claim(self.device.address())?;
        let session = self
            .open_session(guard, timeout)
            .await
            .inspect_err(|e| error!("Failed to connect: {}", e))?;
        self.session = Some(session);

        info!("Connected to {}", self.device);
        Ok(())
    }

    #[instrument(skip(self, mapping), fields(device = %self.device))]
    async fn send(&mut self, command: &Command, mapping: ChannelMapping) -> Result<()> {
        let frame = command.to_frame(&mapping)?;
        debug!("Sending {}", command);
        self.write_frame(&frame).await
    }

    #[instrument(skip(self, payload), fields(device = %self.device))]
    async fn send_raw(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        let frame = packet::encode(opcode, payload)?;
        debug!("Sending raw frame {}", frame);
        self.write_frame(&frame).await
    }

    #[instrument(skip(self), fields(device = %self.device))]
    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Some(task) = session.notify_task.take() {
            task.abort();
        }
        let result = session.peripheral.disconnect().await;
        session.closed = true;
        result?;
        info!("Disconnected from {}", self.device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn sessions_are_exclusive_per_address() {
        let first = SessionGuard::claim("AA:BB:CC:00:00:01").unwrap();
        assert_eq!(
            SessionGuard::claim("aa:bb:cc:00:00:01").unwrap_err(),
            ConnectError::AlreadyConnected("aa:bb:cc:00:00:01".into())
        );
        let other = SessionGuard::claim("AA:BB:CC:00:00:02");
        assert!(other.is_ok());

        drop(first);
        assert!(SessionGuard::claim("AA:BB:CC:00:00:01").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_times_out() {
        let timeout = Duration::from_secs(10);
        let result: Result<()> =
            with_deadline(Instant::now() + timeout, timeout, std::future::pending()).await;
        assert!(matches!(
            result,
            Err(Error::Connect(ConnectError::Timeout(d))) if d == Duration::from_secs(10)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scan_is_stopped_when_the_deadline_expires() {
        let timeout = Duration::from_secs(5);
        let stopped = AtomicBool::new(false);

        let result: Result<()> = with_cleanup(
            Instant::now() + timeout,
            timeout,
            std::future::pending(),
            async { stopped.store(true, Ordering::SeqCst) },
        )
        .await;

        assert!(matches!(result, Err(Error::Connect(ConnectError::Timeout(_)))));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn link_is_released_only_after_a_failed_attach() {
        let timeout = Duration::from_secs(5);
        let released = AtomicBool::new(false);

        let attached = or_release(
            Instant::now() + timeout,
            timeout,
            async { Ok(7) },
            async { released.store(true, Ordering::SeqCst) },
        )
        .await;
        assert_eq!(attached.unwrap(), 7);
        assert!(!released.load(Ordering::SeqCst));

        // Connected, then stuck in service discovery past the deadline
        let stuck: Result<()> = or_release(
            Instant::now() + timeout,
            timeout,
            std::future::pending(),
            async { released.store(true, Ordering::SeqCst) },
        )
        .await;
        assert!(stuck.is_err());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_session_disconnects_before_freeing_the_address() {
        let (alive_tx, alive_rx) = oneshot::channel::<()>();
        let notify_task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await
        });
        let guard = SessionGuard::claim("AA:BB:CC:00:00:0A").unwrap();
        let (unlinked_tx, unlinked_rx) = oneshot::channel::<()>();
        let (freed_tx, freed_rx) = oneshot::channel::<()>();

        release_in_background(Some(notify_task), async move {
            unlinked_rx.await.unwrap();
            drop(guard);
            freed_tx.send(()).unwrap();
        });

        // Aborting the task drops its end of the channel
        assert!(alive_rx.await.is_err());
        assert!(SessionGuard::claim("AA:BB:CC:00:00:0A").is_err());

        unlinked_tx.send(()).unwrap();
        freed_rx.await.unwrap();
        assert!(SessionGuard::claim("AA:BB:CC:00:00:0A").is_ok());
    }

    #[test]
    fn release_without_runtime_does_not_panic() {
        let guard = SessionGuard::claim("AA:BB:CC:00:00:0B").unwrap();
        release_in_background(None, async move { drop(guard) });
        // The unlink future was dropped with its guard
        assert!(SessionGuard::claim("AA:BB:CC:00:00:0B").is_ok());
    }

    #[tokio::test]
    async fn rejects_lan_descriptor() {
        let device = Device::lan("lan-1", IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        let mut transport = BleTransport::new(device, BleConfig::default());
        assert!(matches!(
            transport.connect(Duration::from_secs(1)).await,
            Err(Error::Connect(ConnectError::WrongTransport(_)))
        ));
    }

    #[tokio::test]
    async fn requires_session() {
        let device = Device::ble("AA:BB:CC:00:00:09", "ihoment_H6008_0009");
        let mut transport = BleTransport::new(device, BleConfig::default());

        assert!(matches!(
            transport.send(&Command::PowerOn, ChannelMapping::identity()).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            transport.subscribe(|_| {}).await,
            Err(Error::NotConnected)
        ));
        assert!(transport.disconnect().await.is_ok());
    }
}
