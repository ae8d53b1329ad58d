//! The seam between this crate and a platform Bluetooth stack.
//!
//! A [`Transport`] is an already-connected device. Discovery and connection
//! happen in the implementation's constructor (see `BluestTransport::connect`
//! behind the `bluest` feature, or [`crate::mock_transport::MockTransport`]).

use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Failures reported by the platform stack.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("device disconnected")]
    Disconnected,

    #[error("service or characteristic {0} not found on the device")]
    NotFound(Uuid),

    #[error("i/o failure: {0}")]
    Io(String),
}

/// A stream of raw payloads. For GATT subscriptions each item is one
/// notification; for advertisement listeners each item is the
/// manufacturer-specific data of one advertisement.
pub type NotificationStream =
    Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send + 'static>>;

pub trait Transport: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn read(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<NotificationStream, TransportError>> + Send;

    /// Manufacturer data of advertisements from the connected device, for
    /// families that never open a GATT subscription.
    fn advertisements(
        &self,
    ) -> impl Future<Output = Result<NotificationStream, TransportError>> + Send;

    fn disconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Pump `items` into `sender` until either end goes away. The source ending
/// or reporting a disconnect clears `connected`; the receiver being dropped
/// does not.
#[cfg_attr(not(feature = "bluest"), allow(dead_code))]
pub(crate) async fn relay<S>(
    items: S,
    connected: &AtomicBool,
    sender: &mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
) where
    S: Stream<Item = Result<Vec<u8>, TransportError>>,
{
    let mut items = pin!(items);
    loop {
        let Some(item) = items.next().await else {
            connected.store(false, Ordering::SeqCst);
            info!("notification stream ended, link lost");
            return;
        };
        if matches!(item, Err(TransportError::Disconnected)) {
            connected.store(false, Ordering::SeqCst);
        }
        if sender.send(item).is_err() {
            debug!("notification receiver dropped");
            return;
        }
    }
}
