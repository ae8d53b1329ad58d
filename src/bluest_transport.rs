//! [`Transport`] over the platform Bluetooth stack via `bluest`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use bluest::error::ErrorKind;
use bluest::{Adapter, AdvertisingDevice, Characteristic, Device, DeviceId, Uuid};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::descriptor::{DeviceDescriptor, DeviceFamily, DeviceFilter};
use crate::transport::{relay, NotificationStream, Transport, TransportError};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRIES: u32 = 2;

fn transport_error(err: bluest::Error) -> TransportError {
    match err.kind() {
        ErrorKind::NotConnected => TransportError::Disconnected,
        _ => TransportError::Io(err.to_string()),
    }
}

/// Forward `items` into a `'static` stream. `bluest` streams borrow the
/// characteristic or adapter they came from, so a task owns those instead.
fn forward(mut items: mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>) -> NotificationStream {
    Box::pin(futures_util::stream::poll_fn(move |cx| items.poll_recv(cx)))
}

pub struct BluestTransport {
    adapter: Adapter,
    device: Device,
    device_id: DeviceId,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    /// Cleared by `disconnect` and by the link dropping under a subscription.
    connected: Arc<AtomicBool>,
}

impl BluestTransport {
    /// Scan for the first device matching `descriptor`, connect to it and
    /// discover every characteristic the descriptor names.
    ///
    /// Advertisement-only devices are never connected; their advertisements
    /// are listened to instead.
    pub async fn connect(descriptor: &DeviceDescriptor) -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;

        let found = timeout(DISCOVERY_TIMEOUT, Self::discover_device(descriptor, &adapter))
            .await
            .map_err(|_| anyhow!("{} not found", descriptor.name))??;
        let device = found.device;
        info!("found {}", device.name().unwrap_or_default());

        let transport = Self {
            device_id: device.id(),
            adapter,
            device,
            characteristics: HashMap::new(),
            connected: Arc::new(AtomicBool::new(true)),
        };
        if descriptor.family == DeviceFamily::Advertisement {
            return Ok(transport);
        }

        transport.try_connect().await?;
        transport.discover_characteristics(descriptor).await
    }

    async fn discover_device(
        descriptor: &DeviceDescriptor,
        adapter: &Adapter,
    ) -> anyhow::Result<AdvertisingDevice> {
        let required_services: Vec<Uuid> = descriptor
            .filters
            .iter()
            .filter_map(|f| match f {
                DeviceFilter::Service(uuid) => Some(*uuid),
                DeviceFilter::NamePrefix(_) => None,
            })
            .collect();
        // Name-prefix filters need an unfiltered scan.
        let has_name_filter = descriptor
            .filters
            .iter()
            .any(|f| matches!(f, DeviceFilter::NamePrefix(_)));
        let scan_services: &[Uuid] = if has_name_filter { &[] } else { &required_services };

        let mut adapter_events = adapter.scan(scan_services).await?;
        while let Some(device) = adapter_events.next().await {
            let name = device
                .adv_data
                .local_name
                .clone()
                .or_else(|| device.device.name().ok())
                .unwrap_or_default();
            debug!("scan result {name:?}");
            if descriptor.matches(&name, &device.adv_data.services) {
                return Ok(device);
            }
        }

        Err(anyhow!("{} not found", descriptor.name))
    }

    async fn discover_characteristics(mut self, descriptor: &DeviceDescriptor) -> anyhow::Result<Self> {
        for service in &descriptor.services {
            let Some(gatt_service) = self
                .device
                .discover_services_with_uuid(service.uuid)
                .await?
                .first()
                .cloned()
            else {
                warn!("{} does not offer the {} service", descriptor.name, service.id);
                continue;
            };
            for characteristic in &service.characteristics {
                match gatt_service
                    .discover_characteristics_with_uuid(characteristic.uuid)
                    .await?
                    .first()
                {
                    Some(found) => {
                        self.characteristics
                            .insert((service.uuid, characteristic.uuid), found.clone());
                    }
                    None => warn!("missing characteristic {}/{}", service.id, characteristic.id),
                }
            }
        }
        Ok(self)
    }

    async fn try_connect(&self) -> anyhow::Result<()> {
        if self.device.is_connected().await {
            return Ok(());
        }
        let mut retries = CONNECT_RETRIES;
        loop {
            match self.adapter.connect_device(&self.device).await {
                Ok(()) => return Ok(()),
                Err(err) if retries > 0 => {
                    warn!("failed to connect: {err}");
                    retries -= 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<&Characteristic, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.characteristics
            .get(&(service, characteristic))
            .ok_or(TransportError::NotFound(characteristic))
    }
}

impl Transport for BluestTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        self.characteristic(service, characteristic)?
            .read()
            .await
            .map_err(transport_error)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        self.characteristic(service, characteristic)?
            .write(data)
            .await
            .map_err(transport_error)
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream, TransportError> {
        let characteristic = self.characteristic(service, characteristic)?.clone();
        let connected = self.connected.clone();
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let notifications = match characteristic.notify().await {
                Ok(notifications) => notifications,
                Err(err) => {
                    let _ = sender.send(Err(transport_error(err)));
                    return;
                }
            };
            let items = notifications.map(|item| item.map_err(transport_error));
            relay(items, &connected, &sender).await;
        });
        Ok(forward(receiver))
    }

    async fn advertisements(&self) -> Result<NotificationStream, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let adapter = self.adapter.clone();
        let device_id = self.device_id.clone();
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut scan = match adapter.scan(&[]).await {
                Ok(scan) => scan,
                Err(err) => {
                    let _ = sender.send(Err(transport_error(err)));
                    return;
                }
            };
            while let Some(advertisement) = scan.next().await {
                if advertisement.device.id() != device_id {
                    continue;
                }
                let data = advertisement
                    .adv_data
                    .manufacturer_data
                    .map(|m| m.data)
                    .unwrap_or_default();
                if sender.send(Ok(data)).is_err() {
                    break;
                }
            }
        });
        Ok(forward(receiver))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        if self.device.is_connected().await {
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }
}
