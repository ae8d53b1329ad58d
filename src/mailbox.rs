//! One-slot command/response correlation.
//!
//! Each write characteristic owns a single slot. A command arms the slot,
//! the next response-class notification resolves it, and a second command
//! while the slot is armed is refused instead of queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::decoder::Reply;
use crate::descriptor::CharacteristicRef;
use crate::error::GripError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    AwaitingResponse,
}

#[derive(Debug)]
struct PendingCommand {
    command_id: u64,
    command: &'static str,
    issued_at: Instant,
    timeout: Duration,
    responder: oneshot::Sender<Reply>,
}

/// Handed to the writer when a slot is armed.
#[derive(Debug)]
pub struct Ticket {
    pub command_id: u64,
    pub response: oneshot::Receiver<Reply>,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    slots: Mutex<HashMap<CharacteristicRef, PendingCommand>>,
    next_id: AtomicU64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CharacteristicRef, PendingCommand>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, channel: &CharacteristicRef) -> SlotState {
        if self.slots().contains_key(channel) {
            SlotState::AwaitingResponse
        } else {
            SlotState::Idle
        }
    }

    /// Arm the slot for `channel`, failing fast if it is already armed.
    pub fn arm(
        &self,
        channel: &CharacteristicRef,
        command: &'static str,
        timeout: Duration,
    ) -> Result<Ticket, GripError> {
        let mut slots = self.slots();
        if let Some(pending) = slots.get(channel) {
            debug!(
                "refusing {command} on {channel}: {} (#{}) still pending",
                pending.command, pending.command_id
            );
            return Err(GripError::CommandInFlight(channel.to_string()));
        }

        let command_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (responder, response) = oneshot::channel();
        slots.insert(
            channel.clone(),
            PendingCommand {
                command_id,
                command,
                issued_at: Instant::now(),
                timeout,
                responder,
            },
        );
        Ok(Ticket {
            command_id,
            response,
        })
    }

    /// Hand `response` to the oldest armed slot. Gives the response back if
    /// nothing is waiting.
    pub fn resolve_oldest(&self, response: Reply) -> Result<(), Reply> {
        let mut slots = self.slots();
        let oldest = slots
            .iter()
            .min_by_key(|(_, p)| (p.issued_at, p.command_id))
            .map(|(channel, _)| channel.clone());
        let Some(channel) = oldest else {
            return Err(response);
        };
        let Some(pending) = slots.remove(&channel) else {
            return Err(response);
        };

        debug!(
            "{} (#{}) on {channel} answered after {:?} (limit {:?})",
            pending.command,
            pending.command_id,
            pending.issued_at.elapsed(),
            pending.timeout
        );
        // The writer may have given up in the meantime; the response is
        // consumed either way.
        let _ = pending.responder.send(response);
        Ok(())
    }

    /// Empty the slot if it still belongs to `command_id`.
    pub fn clear(&self, channel: &CharacteristicRef, command_id: u64) -> bool {
        let mut slots = self.slots();
        match slots.get(channel) {
            Some(pending) if pending.command_id == command_id => {
                slots.remove(channel);
                true
            }
            _ => false,
        }
    }

    /// Drop every pending command. Waiting writers observe a closed channel.
    pub fn clear_all(&self) {
        self.slots().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::CommandResponse;

    fn tx() -> CharacteristicRef {
        CharacteristicRef::new("progressor", "tx")
    }

    fn ack(code: u8) -> Reply {
        Reply::Ack(CommandResponse {
            return_code: code,
            payload: vec![],
        })
    }

    #[tokio::test]
    async fn test_second_command_fails_fast() {
        let mailbox = Mailbox::new();
        let _ticket = mailbox.arm(&tx(), "GET_BATTERY", Duration::from_secs(5)).unwrap();
        assert_eq!(mailbox.state(&tx()), SlotState::AwaitingResponse);
        assert_eq!(
            mailbox.arm(&tx(), "TARE_SCALE", Duration::from_secs(5)).unwrap_err(),
            GripError::CommandInFlight("progressor/tx".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_frees_slot() {
        let mailbox = Mailbox::new();
        let ticket = mailbox.arm(&tx(), "GET_BATTERY", Duration::from_secs(5)).unwrap();
        mailbox.resolve_oldest(ack(0)).unwrap();
        assert_eq!(ticket.response.await.unwrap(), ack(0));
        assert_eq!(mailbox.state(&tx()), SlotState::Idle);
        assert_eq!(mailbox.resolve_oldest(ack(1)), Err(ack(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_slot_wins() {
        let mailbox = Mailbox::new();
        let other = CharacteristicRef::new("uart", "tx");
        let first = mailbox.arm(&tx(), "GET_BATTERY", Duration::from_secs(5)).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        let second = mailbox.arm(&other, "GET_APP_VERSION", Duration::from_secs(5)).unwrap();

        mailbox.resolve_oldest(ack(7)).unwrap();
        assert_eq!(first.response.await.unwrap(), ack(7));
        assert_eq!(mailbox.state(&other), SlotState::AwaitingResponse);
        mailbox.resolve_oldest(ack(8)).unwrap();
        assert_eq!(second.response.await.unwrap(), ack(8));
    }

    #[tokio::test]
    async fn test_clear_only_own_command() {
        let mailbox = Mailbox::new();
        let ticket = mailbox.arm(&tx(), "GET_BATTERY", Duration::from_secs(5)).unwrap();
        assert!(!mailbox.clear(&tx(), ticket.command_id + 1));
        assert!(mailbox.clear(&tx(), ticket.command_id));
        assert_eq!(mailbox.state(&tx()), SlotState::Idle);
        assert!(ticket.response.await.is_err());
    }
}
