//! Conversation id bookkeeping.
//!
//! [`ConversationTable`] owns three pieces of shared state behind one mutex:
//! the set of locked ids, the continuation attached to each in-flight id, and
//! replies parked for a locked id nobody is waiting on yet. Every
//! read-modify-write goes through that mutex, so the read loop delivering a
//! reply and a task attaching a continuation can never interleave.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::frame::ConversationId;
use crate::error::{ProtocolError, Result};

/// Random draws `allocate_id` makes before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: usize = 20;

/// Callback invoked once with the reply to a conversation.
pub type Callback = Box<dyn FnOnce(ConversationId, Vec<u8>) + Send + 'static>;

/// Receiving half of a [`Continuation::Blocker`]. `None` means the wait was
/// cancelled because the connection closed.
pub type ReplyReceiver = oneshot::Receiver<Option<Vec<u8>>>;

/// What happens when a reply arrives for a conversation.
pub enum Continuation {
    Callback(Callback),
    Blocker(oneshot::Sender<Option<Vec<u8>>>),
}

impl Continuation {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(ConversationId, Vec<u8>) + Send + 'static,
    {
        Continuation::Callback(Box::new(f))
    }

    /// A blocker plus the receiver its owner awaits.
    pub fn blocker() -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        (Continuation::Blocker(tx), rx)
    }

    /// Hand the reply over. A panicking callback is caught and reported as
    /// an error so the caller's loop survives it.
    pub fn resume(self, id: ConversationId, payload: Vec<u8>) -> Result<()> {
        match self {
            Continuation::Callback(callback) => {
                catch_unwind(AssertUnwindSafe(move || callback(id, payload))).map_err(|_| {
                    ProtocolError::Custom(format!("Continuation for conversation {id} panicked"))
                })
            }
            Continuation::Blocker(tx) => {
                if tx.send(Some(payload)).is_err() {
                    debug!(%id, "Reply arrived after the waiter gave up");
                }
                Ok(())
            }
        }
    }

    /// Wake a blocker with a cancelled result; drop a callback.
    pub fn cancel(self) {
        if let Continuation::Blocker(tx) = self {
            let _ = tx.send(None);
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Callback(_) => f.write_str("Callback"),
            Continuation::Blocker(_) => f.write_str("Blocker"),
        }
    }
}

/// Where an inbound reply should go.
#[derive(Debug)]
pub enum Delivery {
    /// A continuation was attached; it has been detached and must be resumed.
    Resume(Continuation, Vec<u8>),
    /// The id is locked but nobody waits yet; the payload was parked.
    Parked,
    /// Nothing claims this id; route the payload through prefix actions.
    Unsolicited(Vec<u8>),
}

#[derive(Default)]
struct TableState {
    locked: HashSet<i8>,
    attached: HashMap<i8, Continuation>,
    pending: HashMap<i8, Vec<u8>>,
    closed: bool,
}

#[derive(Default)]
pub struct ConversationTable {
    state: Mutex<TableState>,
}

impl ConversationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free id, or [`ConversationId::NONE`] when every draw collided.
    pub fn allocate_id(&self) -> ConversationId {
        self.allocate_id_with(&mut rand::rng())
    }

    pub fn allocate_id_with<R: Rng + ?Sized>(&self, rng: &mut R) -> ConversationId {
        let mut state = self.state.lock();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let raw: i8 = rng.random();
            if raw != 0 && state.locked.insert(raw) {
                return ConversationId::new(raw);
            }
        }
        ConversationId::NONE
    }

    /// Mark `id` as owned by an in-flight exchange.
    pub fn lock(&self, id: ConversationId) {
        if !id.is_none() {
            self.state.lock().locked.insert(id.get());
        }
    }

    pub fn is_locked(&self, id: ConversationId) -> bool {
        self.state.lock().locked.contains(&id.get())
    }

    /// Free `id` for reuse, dropping whatever still hangs off it.
    pub fn release(&self, id: ConversationId) {
        let mut state = self.state.lock();
        state.locked.remove(&id.get());
        state.pending.remove(&id.get());
        if let Some(continuation) = state.attached.remove(&id.get()) {
            debug!(%id, "Released conversation with a continuation still attached");
            continuation.cancel();
        }
    }

    /// Lock `id` and attach `continuation` to it. Id 0 is refused.
    ///
    /// If a reply is already parked for `id`, the continuation is handed
    /// back together with it instead of being attached. An id that already
    /// holds a continuation keeps it; the new one is dropped.
    pub fn attach(
        &self,
        id: ConversationId,
        continuation: Continuation,
    ) -> Result<Option<(Continuation, Vec<u8>)>> {
        if id.is_none() {
            return Err(ProtocolError::NotLocked(id.get()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(ProtocolError::Cancelled);
        }
        if state.attached.contains_key(&id.get()) {
            warn!(%id, "Conversation already has a continuation attached");
            return Err(ProtocolError::AlreadyAttached(id.get()));
        }
        state.locked.insert(id.get());
        if let Some(payload) = state.pending.remove(&id.get()) {
            return Ok(Some((continuation, payload)));
        }
        state.attached.insert(id.get(), continuation);
        Ok(None)
    }

    /// Remove the continuation attached to `id`, if any.
    pub fn detach(&self, id: ConversationId) -> Option<Continuation> {
        self.state.lock().attached.remove(&id.get())
    }

    /// Decide where an inbound payload for `id` goes.
    pub fn deliver(&self, id: ConversationId, payload: Vec<u8>) -> Delivery {
        if id.is_none() {
            return Delivery::Unsolicited(payload);
        }
        let mut state = self.state.lock();
        if let Some(continuation) = state.attached.remove(&id.get()) {
            return Delivery::Resume(continuation, payload);
        }
        if state.locked.contains(&id.get()) {
            state.pending.insert(id.get(), payload);
            return Delivery::Parked;
        }
        Delivery::Unsolicited(payload)
    }

    /// Cancel every attachment and refuse new ones. Returns how many
    /// continuations were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Continuation> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.locked.clear();
            state.pending.clear();
            state.attached.drain().map(|(_, c)| c).collect()
        };
        let count = drained.len();
        for continuation in drained {
            continuation.cancel();
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn locked_count(&self) -> usize {
        self.state.lock().locked.len()
    }
}

impl fmt::Debug for ConversationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConversationTable")
            .field("locked", &state.locked.len())
            .field("attached", &state.attached.len())
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Always draws the same byte.
    struct Stuck(u32);

    impl rand::RngCore for Stuck {
        fn next_u32(&mut self) -> u32 {
            self.0
        }
        fn next_u64(&mut self) -> u64 {
            self.0 as u64
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0 as u8);
        }
    }

    #[test]
    fn test_attach_refuses_reserved_id() {
        let table = ConversationTable::new();
        let (blocker, _rx) = Continuation::blocker();
        assert!(matches!(
            table.attach(ConversationId::NONE, blocker),
            Err(ProtocolError::NotLocked(0))
        ));
        assert!(!table.is_locked(ConversationId::NONE));
        assert_eq!(table.locked_count(), 0);
    }

    #[test]
    fn test_allocate_locks_the_id() {
        let table = ConversationTable::new();
        let id = table.allocate_id_with(&mut Stuck(7));
        assert_eq!(id.get(), 7);
        assert!(table.is_locked(id));
    }

    #[test]
    fn test_allocate_exhaustion_returns_none() {
        let table = ConversationTable::new();
        table.lock(ConversationId::new(7));
        assert!(table.allocate_id_with(&mut Stuck(7)).is_none());
        // Zero is never handed out.
        assert!(table.allocate_id_with(&mut Stuck(0)).is_none());
    }

    #[test]
    fn test_allocate_never_returns_locked_id() {
        let table = ConversationTable::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = table.allocate_id();
            if !id.is_none() {
                assert!(seen.insert(id.get()), "id {id} handed out twice");
            }
        }
    }

    #[test]
    fn test_second_attach_fails_and_first_still_delivers() {
        let table = ConversationTable::new();
        let id = ConversationId::new(5);
        let hits = Arc::new(AtomicUsize::new(0));

        let first = hits.clone();
        table
            .attach(
                id,
                Continuation::callback(move |_, payload| {
                    assert_eq!(payload, b"reply");
                    first.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        let second = table.attach(id, Continuation::callback(|_, _| panic!("wrong continuation")));
        assert!(matches!(second, Err(ProtocolError::AlreadyAttached(5))));

        match table.deliver(id, b"reply".to_vec()) {
            Delivery::Resume(c, payload) => c.resume(id, payload).unwrap(),
            other => panic!("unexpected delivery {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reply_before_attach_is_parked() {
        let table = ConversationTable::new();
        let id = ConversationId::new(9);
        table.lock(id);
        assert!(matches!(table.deliver(id, b"early".to_vec()), Delivery::Parked));

        let (blocker, _rx) = Continuation::blocker();
        let (_, payload) = table.attach(id, blocker).unwrap().unwrap();
        assert_eq!(payload, b"early");
    }

    #[test]
    fn test_unlocked_and_zero_ids_are_unsolicited() {
        let table = ConversationTable::new();
        assert!(matches!(
            table.deliver(ConversationId::new(3), b"x".to_vec()),
            Delivery::Unsolicited(_)
        ));
        table.lock(ConversationId::NONE);
        assert!(matches!(
            table.deliver(ConversationId::NONE, b"x".to_vec()),
            Delivery::Unsolicited(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_blockers() {
        let table = ConversationTable::new();
        let (blocker, rx) = Continuation::blocker();
        table.attach(ConversationId::new(1), blocker).unwrap();

        assert_eq!(table.cancel_all(), 1);
        assert_eq!(rx.await.unwrap(), None);

        let (late, _rx) = Continuation::blocker();
        assert!(matches!(
            table.attach(ConversationId::new(2), late),
            Err(ProtocolError::Cancelled)
        ));
    }

    #[test]
    fn test_panicking_callback_is_caught() {
        let callback = Continuation::callback(|_, _| panic!("handler bug"));
        assert!(callback.resume(ConversationId::new(1), vec![]).is_err());
    }
}
