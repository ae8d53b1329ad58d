//! Static descriptions of the supported device families.

use serde::Serialize;
use uuid::Uuid;

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb | ((short as u128) << 96))
}

pub const BATTERY_SERVICE: Uuid = bluetooth_uuid(0x180f);
pub const BATTERY_LEVEL: Uuid = bluetooth_uuid(0x2a19);
pub const DEVICE_INFORMATION_SERVICE: Uuid = bluetooth_uuid(0x180a);
pub const MANUFACTURER_NAME: Uuid = bluetooth_uuid(0x2a29);
pub const FIRMWARE_REVISION: Uuid = bluetooth_uuid(0x2a26);

pub const PROGRESSOR_SERVICE: Uuid = Uuid::from_u128(0x7e4e1701_1ea6_40c9_9dcc_13d34ffead57);
pub const PROGRESSOR_RX: Uuid = Uuid::from_u128(0x7e4e1702_1ea6_40c9_9dcc_13d34ffead57);
pub const PROGRESSOR_TX: Uuid = Uuid::from_u128(0x7e4e1703_1ea6_40c9_9dcc_13d34ffead57);

pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const NORDIC_UART_WRITE: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const NORDIC_UART_NOTIFY: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Which codec speaks to a device. Selected by the descriptor rather than by
/// a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceFamily {
    /// `[opcode][length][payload]` frames with acknowledged commands.
    BinaryCommand,
    /// Weight carried in advertisement manufacturer data, no GATT session.
    Advertisement,
    /// ASCII commands over a UART bridge, text samples back.
    TextCommand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFilter {
    NamePrefix(String),
    Service(Uuid),
}

impl DeviceFilter {
    fn matches(&self, name: &str, services: &[Uuid]) -> bool {
        match self {
            DeviceFilter::NamePrefix(prefix) => name.starts_with(prefix.as_str()),
            DeviceFilter::Service(uuid) => services.contains(uuid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub id: String,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub id: String,
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// A `(service id, characteristic id)` pair naming one logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: String,
    pub characteristic: String,
}

impl CharacteristicRef {
    pub fn new(service: &str, characteristic: &str) -> Self {
        Self {
            service: service.to_string(),
            characteristic: characteristic.to_string(),
        }
    }
}

impl std::fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub family: DeviceFamily,
    pub filters: Vec<DeviceFilter>,
    pub services: Vec<ServiceDescriptor>,
    /// Characteristic commands are written to.
    pub command_channel: Option<CharacteristicRef>,
    /// Characteristic that carries samples and responses.
    pub notify_channel: Option<CharacteristicRef>,
}

impl DeviceDescriptor {
    /// True if a scan result with this advertised name and service list
    /// satisfies any of the descriptor's filters.
    pub fn matches(&self, name: &str, services: &[Uuid]) -> bool {
        self.filters.iter().any(|f| f.matches(name, services))
    }

    pub fn service(&self, service_id: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.id == service_id)
    }

    /// Resolve logical ids to `(service uuid, characteristic uuid)`.
    pub fn resolve(&self, service_id: &str, characteristic_id: &str) -> Option<(Uuid, Uuid)> {
        let service = self.service(service_id)?;
        let characteristic = service
            .characteristics
            .iter()
            .find(|c| c.id == characteristic_id)?;
        Some((service.uuid, characteristic.uuid))
    }
}

fn characteristic(id: &str, uuid: Uuid) -> CharacteristicDescriptor {
    CharacteristicDescriptor {
        id: id.to_string(),
        uuid,
    }
}

fn battery_service() -> ServiceDescriptor {
    ServiceDescriptor {
        id: "battery".to_string(),
        uuid: BATTERY_SERVICE,
        characteristics: vec![characteristic("level", BATTERY_LEVEL)],
    }
}

fn device_information_service() -> ServiceDescriptor {
    ServiceDescriptor {
        id: "device".to_string(),
        uuid: DEVICE_INFORMATION_SERVICE,
        characteristics: vec![
            characteristic("manufacturer", MANUFACTURER_NAME),
            characteristic("firmware", FIRMWARE_REVISION),
        ],
    }
}

/// Force dynamometer speaking the binary opcode protocol.
pub fn progressor() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "Progressor".to_string(),
        family: DeviceFamily::BinaryCommand,
        filters: vec![DeviceFilter::NamePrefix("Progressor".to_string())],
        services: vec![
            ServiceDescriptor {
                id: "progressor".to_string(),
                uuid: PROGRESSOR_SERVICE,
                characteristics: vec![
                    characteristic("rx", PROGRESSOR_RX),
                    characteristic("tx", PROGRESSOR_TX),
                ],
            },
            battery_service(),
        ],
        command_channel: Some(CharacteristicRef::new("progressor", "tx")),
        notify_channel: Some(CharacteristicRef::new("progressor", "rx")),
    }
}

/// Multi-cell hangboard behind a Nordic UART bridge.
pub fn uart_bridge() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "Motherboard".to_string(),
        family: DeviceFamily::TextCommand,
        filters: vec![
            DeviceFilter::NamePrefix("Motherboard".to_string()),
            DeviceFilter::Service(NORDIC_UART_SERVICE),
        ],
        services: vec![
            ServiceDescriptor {
                id: "uart".to_string(),
                uuid: NORDIC_UART_SERVICE,
                characteristics: vec![
                    characteristic("tx", NORDIC_UART_WRITE),
                    characteristic("rx", NORDIC_UART_NOTIFY),
                ],
            },
            battery_service(),
            device_information_service(),
        ],
        command_channel: Some(CharacteristicRef::new("uart", "tx")),
        notify_channel: Some(CharacteristicRef::new("uart", "rx")),
    }
}

/// Scale-style hand dynamometer that only advertises.
pub fn passive_scale() -> DeviceDescriptor {
    DeviceDescriptor {
        name: "WH-C06".to_string(),
        family: DeviceFamily::Advertisement,
        filters: vec![DeviceFilter::NamePrefix("IF_B7".to_string())],
        services: Vec::new(),
        command_channel: None,
        notify_channel: None,
    }
}
