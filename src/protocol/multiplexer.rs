//! Conversation multiplexer.
//!
//! Many request/response exchanges share one channel. Every outbound frame
//! is `id || payload`, encoded with the negotiated codec; the read loop
//! decodes inbound frames and hands each one to the continuation attached
//! to its id, parks it for a pending `await_reply`, or passes it on as an
//! unsolicited message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};

use crate::core::codec::MAX_FRAME_SIZE;
use crate::core::frame::{prepend, split, ConversationId};
use crate::error::{ProtocolError, Result};
use crate::protocol::codec::Codec;
use crate::protocol::conversation::{Continuation, ConversationTable, Delivery, ReplyReceiver};
use crate::protocol::dispatcher::PrefixActions;
use crate::transport::Channel;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::maybe_timeout;

/// One decoded inbound frame after conversation bookkeeping.
#[derive(Debug)]
pub enum Inbound {
    /// Reply claimed by a continuation that must now run.
    Reply {
        id: ConversationId,
        continuation: Continuation,
        payload: Vec<u8>,
    },
    /// Message nobody was waiting for.
    Unsolicited { id: ConversationId, payload: Vec<u8> },
}

pub struct Multiplexer {
    channel: Arc<dyn Channel>,
    codec: Mutex<Box<dyn Codec>>,
    // Encode and write must happen in the same order on the wire as in the
    // codec's nonce sequence.
    send_lock: tokio::sync::Mutex<()>,
    // Set once the outbound codec state may no longer match the peer's.
    broken: AtomicBool,
    conversations: ConversationTable,
    metrics: Arc<Metrics>,
}

/// Marks the connection broken if a write is abandoned after encoding.
struct WriteGuard<'a> {
    mux: &'a Multiplexer,
    armed: bool,
}

impl WriteGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.mux.broken.store(true, Ordering::Release);
            let cancelled = self.mux.conversations.cancel_all();
            warn!(peer = %self.mux.peer(), cancelled, "Write abandoned after encoding, connection unusable");
        }
    }
}

impl Multiplexer {
    pub fn new(channel: Arc<dyn Channel>, codec: Box<dyn Codec>, metrics: Arc<Metrics>) -> Self {
        Self {
            channel,
            codec: Mutex::new(codec),
            send_lock: tokio::sync::Mutex::new(()),
            broken: AtomicBool::new(false),
            conversations: ConversationTable::new(),
            metrics,
        }
    }

    pub fn conversations(&self) -> &ConversationTable {
        &self.conversations
    }

    pub fn codec_name(&self) -> String {
        self.codec.lock().name().to_string()
    }

    pub fn peer(&self) -> String {
        self.channel.peer()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed() || self.broken.load(Ordering::Acquire)
    }

    /// Claim a free conversation id. [`ConversationId::NONE`] means none is available.
    pub fn allocate_id(&self) -> ConversationId {
        let id = self.conversations.allocate_id();
        if id.is_none() {
            warn!(peer = %self.peer(), "No free conversation id");
            self.metrics.conversation_exhausted();
        } else {
            self.metrics.conversation_allocated();
        }
        id
    }

    pub fn release(&self, id: ConversationId) {
        self.conversations.release(id);
    }

    /// Send `payload` on conversation `id`, optionally attaching a continuation first.
    pub async fn send(
        &self,
        payload: &[u8],
        id: ConversationId,
        continuation: Option<Continuation>,
    ) -> Result<()> {
        match continuation {
            Some(_) if id.is_none() => {
                warn!("Ignoring continuation on conversation 0");
            }
            Some(continuation) => match self.conversations.attach(id, continuation) {
                Ok(None) => {}
                Ok(Some((continuation, payload))) => {
                    if let Err(e) = continuation.resume(id, payload) {
                        self.metrics.handler_fault();
                        error!(%id, error = %e, "Continuation failed");
                    }
                }
                Err(ProtocolError::Cancelled) => return Err(ProtocolError::ConnectionClosed),
                Err(e) => warn!(%id, error = %e, "Could not attach continuation"),
            },
            None => {}
        }
        self.write(id, payload).await
    }

    /// Encode and write one frame.
    ///
    /// A frame too large for the channel is refused before the codec sees
    /// it. Once encoding has happened, any failure closes the connection:
    /// the peer's codec would otherwise fall out of step with ours.
    async fn write(&self, id: ConversationId, payload: &[u8]) -> Result<()> {
        if self.broken.load(Ordering::Acquire) {
            self.close().await;
            return Err(ProtocolError::ConnectionClosed);
        }
        let _ordered = self.send_lock.lock().await;

        let framed = {
            let codec = self.codec.lock();
            1 + payload.len() + codec.overhead()
        };
        if framed > MAX_FRAME_SIZE {
            warn!(%id, bytes = framed, "Refusing oversized frame");
            return Err(ProtocolError::OversizedPacket(framed));
        }

        let guard = WriteGuard {
            mux: self,
            armed: true,
        };
        let outcome = self.encode_and_send(id, payload).await;
        guard.disarm();

        if let Err(e) = &outcome {
            error!(%id, error = %e, "Frame write failed, closing connection");
            self.close().await;
        }
        outcome
    }

    async fn encode_and_send(&self, id: ConversationId, payload: &[u8]) -> Result<()> {
        let encoded = self.codec.lock().encode(&prepend(id, payload))?;
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::OversizedPacket(encoded.len()));
        }
        self.channel.send(&encoded).await?;
        self.metrics.frame_sent(encoded.len() as u64);
        trace!(%id, bytes = encoded.len(), "Frame sent");
        Ok(())
    }

    /// Wait for the reply on a locked conversation.
    ///
    /// `timeout` of `None` waits until the reply arrives or the connection
    /// closes. On expiry the waiter is detached and `Timeout` returned; the
    /// id stays locked until released.
    pub async fn await_reply(&self, id: ConversationId, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if id.is_none() || !self.conversations.is_locked(id) {
            return Err(ProtocolError::NotLocked(id.get()));
        }
        let (blocker, rx) = Continuation::blocker();
        if let Some((_, parked)) = self.conversations.attach(id, blocker)? {
            return Ok(parked);
        }
        self.wait(id, rx, timeout).await
    }

    async fn wait(
        &self,
        id: ConversationId,
        rx: ReplyReceiver,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let outcome = maybe_timeout(
            async {
                match rx.await {
                    Ok(Some(payload)) => Ok(payload),
                    Ok(None) | Err(_) => Err(ProtocolError::Cancelled),
                }
            },
            timeout,
        )
        .await;

        match &outcome {
            Err(ProtocolError::Timeout) => {
                self.conversations.detach(id);
                debug!(%id, "Gave up waiting for reply");
            }
            Err(ProtocolError::Cancelled) => self.metrics.wait_cancelled(),
            _ => {}
        }
        outcome
    }

    /// Send a request on a fresh conversation and wait for its reply.
    #[instrument(skip(self, payload), fields(peer = %self.peer()))]
    pub async fn request(&self, payload: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let id = self.allocate_id();
        if id.is_none() {
            return Err(ProtocolError::NoConversationId);
        }
        let outcome = self.exchange(id, payload, timeout).await;
        self.release(id);
        outcome
    }

    async fn exchange(
        &self,
        id: ConversationId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let (blocker, rx) = Continuation::blocker();
        if self.conversations.attach(id, blocker)?.is_some() {
            // A fresh id cannot have a parked reply.
            return Err(ProtocolError::UnexpectedMessage);
        }
        self.write(id, payload).await?;
        self.wait(id, rx, timeout).await
    }

    /// Read and decode the next frame. `Ok(None)` is end-of-stream.
    pub async fn receive(&self) -> Result<Option<(ConversationId, Vec<u8>)>> {
        let Some(wire) = self.channel.read().await? else {
            return Ok(None);
        };
        self.metrics.frame_received(wire.len() as u64);
        let plain = self.codec.lock().decode(&wire)?;
        split(plain).map(Some)
    }

    /// Read loop: runs until end-of-stream or a read/decode failure, then
    /// closes the channel and cancels every waiter.
    pub async fn run<F>(self: Arc<Self>, mut sink: F)
    where
        F: FnMut(Inbound) + Send,
    {
        loop {
            match self.receive().await {
                Ok(Some((id, payload))) => match self.conversations.deliver(id, payload) {
                    Delivery::Resume(continuation, payload) => sink(Inbound::Reply {
                        id,
                        continuation,
                        payload,
                    }),
                    Delivery::Parked => trace!(%id, "Reply parked"),
                    Delivery::Unsolicited(payload) => sink(Inbound::Unsolicited { id, payload }),
                },
                Ok(None) => {
                    debug!(peer = %self.peer(), "Read loop reached end of stream");
                    break;
                }
                Err(e) => {
                    self.metrics.protocol_error();
                    error!(peer = %self.peer(), error = %e, "Read loop failed");
                    break;
                }
            }
        }
        self.close().await;
    }

    /// Spawn the client-side read loop: replies resume their continuation
    /// inline, unsolicited messages go through `actions` on their own task.
    pub fn spawn_reader(self: &Arc<Self>, actions: Arc<PrefixActions<Arc<Multiplexer>>>) -> JoinHandle<()> {
        let mux = self.clone();
        tokio::spawn(async move {
            let context = mux.clone();
            mux.run(move |inbound| match inbound {
                Inbound::Reply {
                    id,
                    continuation,
                    payload,
                } => {
                    if let Err(e) = continuation.resume(id, payload) {
                        context.metrics.handler_fault();
                        error!(%id, error = %e, "Continuation failed");
                    }
                }
                Inbound::Unsolicited { id, payload } => {
                    let actions = actions.clone();
                    let context = context.clone();
                    tokio::spawn(async move {
                        match actions.route(context.clone(), id, &payload).await {
                            Ok(report) if report.faults > 0 => {
                                for _ in 0..report.faults {
                                    context.metrics.handler_fault();
                                }
                            }
                            Ok(_) => {}
                            Err(e) => error!(%id, error = %e, "Prefix dispatch failed"),
                        }
                    });
                }
            })
            .await
        })
    }

    /// Close the channel and resume every waiter with a cancelled result.
    pub async fn close(&self) {
        self.channel.close().await;
        let cancelled = self.conversations.cancel_all();
        if cancelled > 0 {
            debug!(peer = %self.peer(), cancelled, "Cancelled waiting conversations");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::codec::{Side, StdCodec, STD_SECRET_LEN};
    use crate::protocol::dispatcher::CLIENT_SEPARATOR;
    use crate::transport::SessionChannel;
    use crate::utils::crypto::TAG_LEN;

    fn codec(side: Side) -> Box<dyn Codec> {
        let mut codec = StdCodec::new();
        assert!(codec.init(&[9u8; STD_SECRET_LEN], side));
        Box::new(codec)
    }

    fn pair() -> (Arc<Multiplexer>, Arc<Multiplexer>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let metrics = Arc::new(Metrics::new());
        let client = Multiplexer::new(
            Arc::new(SessionChannel::new(a, "server")),
            codec(Side::Client),
            metrics.clone(),
        );
        let server = Multiplexer::new(
            Arc::new(SessionChannel::new(b, "client")),
            codec(Side::Server),
            metrics,
        );
        (Arc::new(client), Arc::new(server))
    }

    fn echo_server(server: &Arc<Multiplexer>) -> JoinHandle<()> {
        let actions = Arc::new(PrefixActions::new(CLIENT_SEPARATOR));
        actions
            .register("echo", |mux: Arc<Multiplexer>, id, body| async move {
                mux.send(&body, id, None).await
            })
            .unwrap();
        server.spawn_reader(actions)
    }

    #[tokio::test]
    async fn test_request_gets_reply_on_same_id() {
        let (client, server) = pair();
        client.spawn_reader(Arc::new(PrefixActions::default()));
        echo_server(&server);

        let reply = client.request(b"echo:ping", Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(reply, b"ping");
        assert_eq!(client.conversations().locked_count(), 0);
    }

    #[tokio::test]
    async fn test_await_reply_requires_lock() {
        let (client, _server) = pair();
        let result = client.await_reply(ConversationId::new(3), None).await;
        assert!(matches!(result, Err(ProtocolError::NotLocked(3))));
    }

    #[tokio::test]
    async fn test_await_reply_times_out_and_detaches() {
        let (client, _server) = pair();
        client.spawn_reader(Arc::new(PrefixActions::default()));
        let id = client.allocate_id();

        let result = client.await_reply(id, Some(Duration::from_millis(30))).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
        assert!(client.conversations().detach(id).is_none());
        assert!(client.conversations().is_locked(id));
    }

    #[tokio::test]
    async fn test_close_cancels_waiters() {
        let (client, _server) = pair();
        client.spawn_reader(Arc::new(PrefixActions::default()));
        let id = client.allocate_id();

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.await_reply(id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must resume after close")
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
    }

    #[tokio::test]
    async fn test_oversized_frame_leaves_connection_usable() {
        let (client, server) = pair();
        client.spawn_reader(Arc::new(PrefixActions::default()));
        echo_server(&server);

        let result = client.send(&vec![0u8; 65_530], ConversationId::NONE, None).await;
        assert!(matches!(result, Err(ProtocolError::OversizedPacket(_))));
        assert!(!client.is_closed());

        // The largest frame that fits still goes through.
        let largest = MAX_FRAME_SIZE - 1 - TAG_LEN;
        client.send(&vec![b'x'; largest], ConversationId::NONE, None).await.unwrap();

        let reply = client.request(b"echo:hello", Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(reply, b"hello");
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_failed_write_closes_connection() {
        let (client, _server) = pair();
        client.spawn_reader(Arc::new(PrefixActions::default()));
        let id = client.allocate_id();
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.await_reply(id, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Channel gone underneath the multiplexer.
        client.channel.close().await;
        assert!(client.send(b"late", ConversationId::NONE, None).await.is_err());
        assert!(client.is_closed());

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must resume after a failed write")
            .unwrap();
        assert!(matches!(result, Err(ProtocolError::Cancelled)));
    }

    #[tokio::test]
    async fn test_callback_runs_once() {
        let (client, server) = pair();
        client.spawn_reader(Arc::new(PrefixActions::default()));
        echo_server(&server);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = client.allocate_id();
        client
            .send(
                b"echo:cb",
                id,
                Some(Continuation::callback(move |_, payload| {
                    let _ = tx.send(payload);
                })),
            )
            .await
            .unwrap();
        let payload = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert_eq!(payload, b"cb");
    }
}
