//! Talk to Bluetooth Low Energy grip-strength sensors (hangboard load cells,
//! dynamometers and weighing scales) and run strength tests on their force
//! stream.
//!
//! Three device families are supported, each selected by a
//! [`DeviceDescriptor`](descriptor::DeviceDescriptor):
//!
//! - Binary command devices: framed opcodes on a GATT characteristic,
//!   acknowledged commands, batches of timestamped samples.
//! - Advertisement scales: weight carried in advertisement manufacturer data.
//!   No connection, no commands.
//! - Text command devices: ASCII commands over a UART bridge, one sample per
//!   line, optionally split across left, center and right load cells.
//!
//! On top of the sample stream a [`ForceDevice`] offers unit conversion,
//! tare, and the activity, rate of force development, critical force and peak
//! force protocols.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use gripsense::mock_transport::MockTransport;
//! # use gripsense::{descriptor, DeviceConfig, ForceDevice};
//! # #[tokio::main]
//! # pub async fn main(){
//!     let transport = Arc::new(MockTransport::new());
//!     let device = ForceDevice::attach(transport, descriptor::progressor(), DeviceConfig::default())
//!         .await
//!         .unwrap();
//!     device
//!         .stream(|m| println!("{:.1} {}", m.current, m.unit), Some(10_000))
//!         .await
//!         .unwrap();
//! # }
//! ```
//!
//! With the `bluest` feature, `BluestTransport::connect` finds and connects
//! a real device instead.

#[cfg(feature = "bluest")]
mod bluest_transport;
mod characteristic_io;
mod config;
pub mod decoder;
pub mod descriptor;
mod device;
mod error;
mod mailbox;
mod measurement;
pub mod mock_transport;
pub mod protocol;
mod stream;
pub mod transport;

#[cfg(feature = "bluest")]
pub use bluest_transport::BluestTransport;
pub use characteristic_io::CharacteristicIo;
pub use config::DeviceConfig;
pub use device::{ForceDevice, StreamEvent};
pub use error::GripError;
pub use mailbox::{Mailbox, SlotState, Ticket};
pub use measurement::{
    Channel, ChannelStats, Distribution, ForceMeasurement, ForceSample, RunningStats, Unit,
};
pub use protocol::{TestOutcome, TestResult};
pub use stream::{EngineState, Ingested, StreamingEngine, TareState};
