use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{ROLE_CHARACTERISTIC, SHIO_SERVICE_UUID};
use crate::types::{CharacteristicKind, DeviceId, LinkCommand, ShioEvent};

type PeripheralMap = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId(id.to_string())
}

// ── ShioClientConfig ──────────────────────────────────────────────────────────

/// Configuration for [`ShioClient`].
#[derive(Debug, Clone)]
pub struct ShioClientConfig {
    /// Scan duration used by [`ShioHandle::scan`].  Default: `10`.
    pub scan_timeout_secs: u64,
    /// Only accept devices whose advertised name starts with this string.
    /// Default: `None` (the service UUID filter alone decides).
    pub name_prefix: Option<String>,
    /// Service UUID used as the scan filter and to select the notify
    /// characteristics to subscribe to.  Default: [`SHIO_SERVICE_UUID`].
    pub service_uuid: Uuid,
    /// Capacity of the event channel handed to the session.  Default: `1024`.
    pub event_capacity: usize,
}

impl Default for ShioClientConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 10,
            name_prefix: None,
            service_uuid: SHIO_SERVICE_UUID,
            event_capacity: 1024,
        }
    }
}

// ── ShioClient ────────────────────────────────────────────────────────────────

/// BLE transport for shio sensors.
///
/// [`ShioClient::start`] opens the first Bluetooth adapter and returns:
///
/// * an event receiver carrying [`ShioEvent`]s for the session,
/// * a [`ShioHandle`] for scanning and (dis)connecting every device, and
/// * a sender through which the session issues [`LinkCommand`]s
///   (subscribe, unsubscribe, role writes).
///
/// Discovered devices are remembered for the lifetime of the client; a
/// disconnect never removes a device, so reconnecting reuses its channel.
pub struct ShioClient {
    config: ShioClientConfig,
}

impl ShioClient {
    pub fn new(config: ShioClientConfig) -> Self {
        Self { config }
    }

    pub async fn start(
        &self,
    ) -> Result<(mpsc::Receiver<ShioEvent>, ShioHandle, mpsc::Sender<LinkCommand>)> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

        // ── macOS: wait for the CoreBluetooth manager to reach poweredOn ─────
        // Scanning before CBCentralManager is ready is a silent no-op.
        #[cfg(target_os = "macos")]
        {
            use btleplug::api::CentralState;

            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        let (tx, rx) = mpsc::channel::<ShioEvent>(self.config.event_capacity);
        let (link_tx, link_rx) = mpsc::channel::<LinkCommand>(64);
        let peripherals: PeripheralMap = Arc::default();

        spawn_adapter_watcher(
            adapter.clone(),
            self.config.clone(),
            Arc::clone(&peripherals),
            tx.clone(),
        )
        .await?;

        let worker = LinkWorker {
            peripherals: Arc::clone(&peripherals),
            events: tx.clone(),
            service_uuid: self.config.service_uuid,
            forwarders: HashMap::new(),
        };
        tokio::spawn(worker.run(link_rx));

        let handle = ShioHandle {
            adapter,
            peripherals,
            events: tx,
            config: self.config.clone(),
        };
        Ok((rx, handle, link_tx))
    }
}

// ── Adapter watcher ───────────────────────────────────────────────────────────

/// Turn adapter events into [`ShioEvent::Discovered`] and
/// [`ShioEvent::Disconnected`].
///
/// Connections are reported by [`ShioHandle::connect_all`] itself, once the
/// link is up, so a device is never announced as connected twice.
async fn spawn_adapter_watcher(
    adapter: Adapter,
    config: ShioClientConfig,
    peripherals: PeripheralMap,
    tx: mpsc::Sender<ShioEvent>,
) -> Result<()> {
    let mut events = adapter.events().await?;
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                    let id = device_id(&pid);
                    if peripherals.lock().await.contains_key(&id) {
                        continue;
                    }
                    let Ok(p) = adapter.peripheral(&pid).await else {
                        continue;
                    };
                    if !is_shio(&p, &config).await {
                        continue;
                    }
                    peripherals.lock().await.insert(id.clone(), p);
                    info!("discovered shio device {id}");
                    if tx.send(ShioEvent::Discovered(id)).await.is_err() {
                        break;
                    }
                }
                CentralEvent::DeviceDisconnected(pid) => {
                    let id = device_id(&pid);
                    if peripherals.lock().await.contains_key(&id) {
                        info!("Disconnect watcher: device {id} disconnected.");
                        if tx.send(ShioEvent::Disconnected(id)).await.is_err() {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
        debug!("adapter event stream ended");
    });
    Ok(())
}

/// A peripheral counts as a shio device when it advertises the service UUID
/// (or the scan filter already guaranteed it) and matches the name prefix.
async fn is_shio(p: &Peripheral, config: &ShioClientConfig) -> bool {
    let Ok(Some(props)) = p.properties().await else {
        return false;
    };
    if !props.services.is_empty() && !props.services.contains(&config.service_uuid) {
        return false;
    }
    match (&config.name_prefix, &props.local_name) {
        (None, _) => true,
        (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
        (Some(_), None) => false,
    }
}

// ── ShioHandle ────────────────────────────────────────────────────────────────

/// Scan and connection control over every discovered shio device.
pub struct ShioHandle {
    adapter: Adapter,
    peripherals: PeripheralMap,
    events: mpsc::Sender<ShioEvent>,
    config: ShioClientConfig,
}

impl ShioHandle {
    /// Start scanning for shio devices.  Runs until [`ShioHandle::stop_scan`]
    /// or [`ShioHandle::connect_all`].
    pub async fn start_scan(&self) -> Result<()> {
        info!("scanning for shio devices …");
        self.adapter
            .start_scan(ScanFilter {
                services: vec![self.config.service_uuid],
            })
            .await?;
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    /// Scan for `scan_timeout_secs` and return every device known so far.
    pub async fn scan(&self) -> Result<Vec<DeviceId>> {
        self.start_scan().await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        self.adapter.stop_scan().await.ok();
        let devices = self.devices().await;
        info!("scan: {} device(s) found", devices.len());
        Ok(devices)
    }

    pub async fn devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.peripherals.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop scanning and connect every discovered device.
    ///
    /// Returns the number of devices connected.  A device that fails to
    /// connect is logged and skipped.
    pub async fn connect_all(&self) -> Result<usize> {
        self.adapter.stop_scan().await.ok();
        let targets: Vec<(DeviceId, Peripheral)> = self
            .peripherals
            .lock()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();

        let mut connected = 0;
        for (id, p) in targets {
            if p.is_connected().await.unwrap_or(false) {
                debug!("{id}: already connected");
                continue;
            }
            // BlueZ's Connect can block forever when the device is out of
            // range; a BLE connection normally takes well under 2 s.
            match tokio::time::timeout(Duration::from_secs(10), p.connect()).await {
                Ok(Ok(())) => {
                    connected += 1;
                    self.events.send(ShioEvent::Connected(id)).await?;
                }
                Ok(Err(e)) => warn!("{id}: connect failed: {e}"),
                Err(_) => warn!("{id}: connect timed out after 10 s"),
            }
        }
        Ok(connected)
    }

    /// Disconnect every discovered device.  Devices stay known.
    pub async fn disconnect_all(&self) -> Result<()> {
        let targets: Vec<Peripheral> = self.peripherals.lock().await.values().cloned().collect();
        for p in targets {
            if let Err(e) = p.disconnect().await {
                warn!("{}: disconnect failed: {e}", device_id(&p.id()));
            }
        }
        Ok(())
    }
}

// ── Link worker ───────────────────────────────────────────────────────────────

/// Executes [`LinkCommand`]s from the session against the BLE stack.
struct LinkWorker {
    peripherals: PeripheralMap,
    events: mpsc::Sender<ShioEvent>,
    service_uuid: Uuid,
    /// One notification forwarding task per subscribed device.
    forwarders: HashMap<DeviceId, JoinHandle<()>>,
}

impl LinkWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<LinkCommand>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                LinkCommand::Subscribe(id) => {
                    if let Err(e) = self.subscribe(&id).await {
                        warn!("{id}: subscribe failed: {e}");
                    }
                }
                LinkCommand::Unsubscribe(id) => {
                    if let Err(e) = self.unsubscribe(&id).await {
                        debug!("{id}: unsubscribe failed: {e}");
                    }
                }
                LinkCommand::WriteRole { device, byte } => {
                    if let Err(e) = self.write_role(&device, byte).await {
                        warn!("{device}: role write failed: {e}");
                        let _ = self
                            .events
                            .send(ShioEvent::RoleWriteFailed {
                                device,
                                reason: e.to_string(),
                            })
                            .await;
                    }
                }
            }
        }
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
    }

    async fn peripheral(&self, id: &DeviceId) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("device {id} is not known to the adapter"))
    }

    async fn service_characteristics(&self, p: &Peripheral) -> Result<BTreeSet<Characteristic>> {
        if p.characteristics().is_empty() {
            // BlueZ reports the connection before the GATT cache is filled.
            #[cfg(target_os = "linux")]
            tokio::time::sleep(Duration::from_millis(600)).await;

            tokio::time::timeout(Duration::from_secs(15), p.discover_services())
                .await
                .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;
        }
        Ok(p.characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == self.service_uuid)
            .collect())
    }

    /// Subscribe to every notify characteristic of the shio service and
    /// forward notifications to the session.
    async fn subscribe(&mut self, id: &DeviceId) -> Result<()> {
        let p = self.peripheral(id).await?;
        let chars = self.service_characteristics(&p).await?;

        let mut subscribed = 0;
        for c in chars.iter().filter(|c| c.properties.contains(CharPropFlags::NOTIFY)) {
            p.subscribe(c).await?;
            subscribed += 1;
            info!("{id}: notifications on {}", c.uuid);
        }
        if subscribed == 0 {
            return Err(anyhow!("no notify characteristic in service {}", self.service_uuid));
        }

        let mut notifications = p.notifications().await?;
        let tx = self.events.clone();
        let device = id.clone();
        let task = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(n) = notifications.next().await {
                count += 1;
                if count <= 3 || count % 500 == 0 {
                    info!("{device}: notif #{count} uuid={} len={}", n.uuid, n.value.len());
                }
                let event = ShioEvent::Packet {
                    device: device.clone(),
                    kind: CharacteristicKind::from_uuid(n.uuid),
                    data: n.value,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            info!("{device}: notification stream ended");
        });

        if let Some(old) = self.forwarders.insert(id.clone(), task) {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, id: &DeviceId) -> Result<()> {
        if let Some(task) = self.forwarders.remove(id) {
            task.abort();
        }
        let p = self.peripheral(id).await?;
        for c in p
            .characteristics()
            .iter()
            .filter(|c| c.service_uuid == self.service_uuid)
            .filter(|c| c.properties.contains(CharPropFlags::NOTIFY))
        {
            p.unsubscribe(c).await?;
        }
        Ok(())
    }

    /// Write one role byte.  Devices without a role characteristic are
    /// skipped.
    async fn write_role(&self, id: &DeviceId, byte: u8) -> Result<()> {
        let p = self.peripheral(id).await?;
        let chars = self.service_characteristics(&p).await?;
        let Some(role_char) = chars.iter().find(|c| c.uuid == ROLE_CHARACTERISTIC) else {
            debug!("{id}: no role characteristic, skipped");
            return Ok(());
        };
        p.write(role_char, &[byte], WriteType::WithResponse).await?;
        info!("{id}: role byte 0x{byte:02x} written");
        Ok(())
    }
}
