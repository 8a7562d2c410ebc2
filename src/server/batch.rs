use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use uuid::Uuid;

use crate::domain::Event;
use crate::server::codec::ProtocolVersion;

/// Unacknowledged batches allowed in flight between handlers and the consumer.
pub const HANDOFF_CAPACITY: usize = 16;

/// One-shot acknowledgment for a [`Batch`].
///
/// Consumed by [`Acker::ack`], so a batch can be acknowledged at most once.
/// Dropping it unacknowledged abandons the batch.
#[derive(Debug)]
pub struct Acker {
    tx: oneshot::Sender<()>,
    /// Handoff slot, released on drop.
    _slot: Option<OwnedSemaphorePermit>,
}

impl Acker {
    /// Returns `false` if the connection that sent the batch is already gone.
    pub fn ack(self) -> bool {
        self.tx.send(()).is_ok()
    }
}

/// Receiving half of an [`Acker`], held by the connection handler.
pub type AckReceiver = oneshot::Receiver<()>;

pub fn ack_pair() -> (Acker, AckReceiver) {
    let (tx, rx) = oneshot::channel();
    (Acker { tx, _slot: None }, rx)
}

/// An ordered group of events received in one window, acknowledged as a unit.
#[derive(Debug)]
pub struct Batch {
    id: Uuid,
    events: Vec<Event>,
    peer: Option<SocketAddr>,
    version: ProtocolVersion,
    received_at: DateTime<Utc>,
    acker: Acker,
}

impl Batch {
    pub fn new(
        events: Vec<Event>,
        peer: Option<SocketAddr>,
        version: ProtocolVersion,
        acker: Acker,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            events,
            peer,
            version,
            received_at: Utc::now(),
            acker,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Tell the sender this batch is done. Returns `false` if nobody is listening.
    pub fn ack(self) -> bool {
        self.acker.ack()
    }

    /// Split off the events while keeping the right to acknowledge them.
    pub fn into_parts(self) -> (Vec<Event>, Acker) {
        (self.events, self.acker)
    }
}

/// Producer side of the handoff queue, cloned into every connection handler.
#[derive(Debug, Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Batch>,
    slots: Arc<Semaphore>,
}

/// Consumer side of the handoff queue.
#[derive(Debug)]
pub struct BatchReceiver {
    rx: mpsc::Receiver<Batch>,
    slots: Arc<Semaphore>,
}

/// Bounded queue of batches. A slot is held from `push` until the batch is
/// acknowledged or dropped, so an idle consumer stalls every producer.
pub fn handoff_queue(capacity: usize) -> (BatchSender, BatchReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let slots = Arc::new(Semaphore::new(capacity));
    (
        BatchSender {
            tx,
            slots: Arc::clone(&slots),
        },
        BatchReceiver { rx, slots },
    )
}

impl BatchSender {
    /// Waits for a free slot, then enqueues. Gives the batch back if the
    /// queue has been closed.
    pub async fn push(&self, mut batch: Batch) -> Result<(), Batch> {
        let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
            return Err(batch);
        };
        batch.acker._slot = Some(permit);
        self.tx.send(batch).await.map_err(|e| {
            let mut batch = e.0;
            batch.acker._slot = None;
            batch
        })
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

impl BatchReceiver {
    pub async fn recv(&mut self) -> Option<Batch> {
        self.rx.recv().await
    }

    /// Refuse further pushes and wake any producer waiting for a slot.
    pub fn close(&mut self) {
        self.slots.close();
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}
