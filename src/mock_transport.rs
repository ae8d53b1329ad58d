//! An in-memory [`Transport`] for tests and offline demos.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::transport::{NotificationStream, Transport, TransportError};

type Pipe = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

#[derive(Debug, Default)]
struct MockState {
    reads: HashMap<Uuid, Vec<u8>>,
    writes: Vec<(Uuid, Vec<u8>)>,
    replies: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    sender: Option<Pipe>,
    receiver: Option<mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>>,
}

/// Scripted transport. Notifications are pushed by the test with
/// [`MockTransport::push`], or sent automatically when a write matches a
/// reply registered with [`MockTransport::reply_to`].
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    fail_writes: AtomicBool,
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            state: Mutex::new(MockState {
                sender: Some(sender),
                receiver: Some(receiver),
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Value returned by reads of `characteristic`.
    pub fn set_read(&self, characteristic: Uuid, value: &[u8]) {
        self.state().reads.insert(characteristic, value.to_vec());
    }

    /// Notifications to emit whenever exactly `written` is written.
    pub fn reply_to(&self, written: &[u8], notifications: Vec<Vec<u8>>) {
        self.state().replies.insert(written.to_vec(), notifications);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Deliver one notification (or advertisement payload).
    pub fn push(&self, bytes: &[u8]) {
        if let Some(sender) = &self.state().sender {
            let _ = sender.send(Ok(bytes.to_vec()));
        }
    }

    /// Deliver a transport error on the notification stream.
    pub fn push_error(&self, err: TransportError) {
        if let Some(sender) = &self.state().sender {
            let _ = sender.send(Err(err));
        }
    }

    /// Everything written so far, oldest first.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state().writes.clone()
    }

    /// Simulate the link dropping: the notification stream ends.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.state().sender = None;
    }

    fn take_stream(&self) -> Result<NotificationStream, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let receiver = self
            .state()
            .receiver
            .take()
            .ok_or_else(|| TransportError::Io("already subscribed".to_string()))?;
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(Box::pin(stream))
    }
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, _service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.state()
            .reads
            .get(&characteristic)
            .cloned()
            .ok_or(TransportError::NotFound(characteristic))
    }

    async fn write(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("write rejected".to_string()));
        }
        let mut state = self.state();
        state.writes.push((characteristic, data.to_vec()));
        if let (Some(replies), Some(sender)) = (state.replies.get(data), &state.sender) {
            for reply in replies {
                let _ = sender.send(Ok(reply.clone()));
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream, TransportError> {
        self.take_stream()
    }

    async fn advertisements(&self) -> Result<NotificationStream, TransportError> {
        self.take_stream()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.drop_connection();
        Ok(())
    }
}
