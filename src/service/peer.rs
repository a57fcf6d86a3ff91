//! Server-side view of one connected client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::frame::ConversationId;
use crate::error::Result;
use crate::protocol::conversation::Continuation;
use crate::protocol::multiplexer::Multiplexer;

pub struct Peer {
    id: u64,
    addr: String,
    mux: Arc<Multiplexer>,
    identity: Mutex<Option<String>>,
}

impl Peer {
    pub fn new(id: u64, mux: Arc<Multiplexer>) -> Self {
        Self {
            id,
            addr: mux.peer(),
            mux,
            identity: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Identity established by login, if any.
    pub fn identity(&self) -> Option<String> {
        self.identity.lock().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.identity.lock().is_some()
    }

    pub(crate) fn set_identity(&self, identity: String) {
        *self.identity.lock() = Some(identity);
    }

    /// Answer a request on the conversation it arrived on.
    pub async fn reply(&self, id: ConversationId, payload: &[u8]) -> Result<()> {
        self.mux.send(payload, id, None).await
    }

    pub async fn send(
        &self,
        payload: &[u8],
        id: ConversationId,
        continuation: Option<Continuation>,
    ) -> Result<()> {
        self.mux.send(payload, id, continuation).await
    }

    /// Server-initiated request on a fresh conversation.
    pub async fn request(&self, payload: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.mux.request(payload, timeout).await
    }

    pub async fn close(&self) {
        self.mux.close().await
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("identity", &self.identity())
            .finish()
    }
}
