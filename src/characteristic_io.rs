use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::decoder::{Command, CommandResponse, DecodedEvent, DeviceCodec, RawValue};
use crate::descriptor::{CharacteristicRef, DeviceDescriptor};
use crate::error::GripError;
use crate::mailbox::Mailbox;
use crate::transport::Transport;

/// Read/write access to a connected device through its descriptor's
/// logical ids, with writes correlated to their response notification.
pub struct CharacteristicIo<T> {
    transport: Arc<T>,
    descriptor: DeviceDescriptor,
    codec: Mutex<DeviceCodec>,
    mailbox: Mailbox,
}

/// Clears a mailbox slot when a write finishes or its future is dropped.
struct SlotGuard<'a> {
    mailbox: &'a Mailbox,
    channel: &'a CharacteristicRef,
    command_id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.mailbox.clear(self.channel, self.command_id) {
            trace!("cleared pending command #{} on {}", self.command_id, self.channel);
        }
    }
}

impl<T: Transport> CharacteristicIo<T> {
    pub fn new(transport: Arc<T>, descriptor: DeviceDescriptor) -> Self {
        let codec = DeviceCodec::for_family(descriptor.family);
        Self {
            transport,
            descriptor,
            codec: Mutex::new(codec),
            mailbox: Mailbox::new(),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn codec(&self) -> MutexGuard<'_, DeviceCodec> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, service_id: &str, characteristic_id: &str) -> Result<(Uuid, Uuid), GripError> {
        if !self.transport.is_connected() {
            return Err(GripError::NotConnected);
        }
        self.descriptor
            .resolve(service_id, characteristic_id)
            .ok_or_else(|| GripError::UnknownCharacteristic {
                service: service_id.to_string(),
                characteristic: characteristic_id.to_string(),
            })
    }

    pub async fn read(&self, service_id: &str, characteristic_id: &str) -> Result<RawValue, GripError> {
        let (service, characteristic) = self.resolve(service_id, characteristic_id)?;
        let bytes = self.transport.read(service, characteristic).await?;
        trace!("read {service_id}/{characteristic_id}: {}", hex::encode(&bytes));
        let value = self.codec().decode_read(characteristic_id, &bytes);
        Ok(value)
    }

    /// Send `command` and wait up to `timeout` for its response.
    ///
    /// Families without response framing resolve with an empty response as
    /// soon as the transport accepts the write.
    pub async fn write(
        &self,
        service_id: &str,
        characteristic_id: &str,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandResponse, GripError> {
        let (service, characteristic) = self.resolve(service_id, characteristic_id)?;
        let bytes = self.codec().encode(command)?;
        let acknowledged = self.codec().acknowledges_commands();
        trace!("TX {command} on {service_id}/{characteristic_id}: {}", hex::encode(&bytes));

        if !acknowledged {
            self.transport.write(service, characteristic, &bytes).await?;
            self.codec().command_sent(command);
            return Ok(CommandResponse::default());
        }

        let channel = CharacteristicRef::new(service_id, characteristic_id);
        let ticket = self.mailbox.arm(&channel, command.name(), timeout)?;
        let _guard = SlotGuard {
            mailbox: &self.mailbox,
            channel: &channel,
            command_id: ticket.command_id,
        };

        self.transport.write(service, characteristic, &bytes).await?;
        self.codec().command_sent(command);

        match tokio::time::timeout(timeout, ticket.response).await {
            Ok(Ok(reply)) => {
                debug!("{command} answered with {reply:?}");
                reply.answer(command)
            }
            Ok(Err(_)) => Err(GripError::NotConnected),
            Err(_) => {
                warn!("{command} on {channel} timed out after {timeout:?}");
                Err(GripError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Decode one inbound notification. Responses are handed to the oldest
    /// pending command; every other event is returned in arrival order.
    pub fn route(&self, bytes: &[u8], received_at_ms: u64) -> Vec<DecodedEvent> {
        let events = self.codec().decode(bytes, received_at_ms);
        events
            .into_iter()
            .filter_map(|event| {
                let Some(reply) = event.as_reply() else {
                    return Some(event);
                };
                match self.mailbox.resolve_oldest(reply) {
                    Ok(()) => None,
                    Err(reply) => {
                        debug!("response with no pending command: {reply:?}");
                        Some(event)
                    }
                }
            })
            .collect()
    }
}
