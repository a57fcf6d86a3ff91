//! What a dispatch worker does with one work item.
//!
//! Replies to server-started conversations resume their continuation. All
//! other messages are `prefix;body` requests: before login only `login` and
//! `register` are honored, afterwards the prefix selects the server's
//! prefix actions.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::core::frame::{split_prefix, ConversationId};
use crate::error::Result;
use crate::protocol::dispatcher::{PrefixActions, SERVER_SEPARATOR};
use crate::service::login::{LoginOutcome, LoginPolicy};
use crate::service::peer::Peer;
use crate::service::pool::{WorkHandler, WorkItem};
use crate::utils::metrics::Metrics;

/// Request prefixes and reply tags of the login exchange
pub mod prefixes {
    pub const LOGIN: &str = "login";
    pub const REGISTER: &str = "register";
    pub const FORM: &str = "req";
    pub const LOGGED_IN: &str = "log";
    pub const REGISTERED: &str = "reg";
    pub const ERROR: &str = "err";
}

pub struct Router {
    actions: Arc<PrefixActions<Arc<Peer>>>,
    login: Arc<dyn LoginPolicy>,
    metrics: Arc<Metrics>,
}

#[derive(Clone, Copy)]
enum Gate {
    Login,
    Register,
}

impl Router {
    pub fn new(
        actions: Arc<PrefixActions<Arc<Peer>>>,
        login: Arc<dyn LoginPolicy>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            actions,
            login,
            metrics,
        }
    }

    async fn process(&self, item: WorkItem) -> Result<()> {
        let WorkItem {
            peer,
            id,
            payload,
            continuation,
        } = item;

        if let Some(continuation) = continuation {
            return continuation.resume(id, payload);
        }

        let (prefix, body) = split_prefix(&payload, SERVER_SEPARATOR);
        if peer.is_logged_in() {
            let report = self.actions.dispatch(peer, &prefix, id, body.to_vec()).await?;
            for _ in 0..report.faults {
                self.metrics.handler_fault();
            }
            return Ok(());
        }

        match prefix.as_str() {
            prefixes::LOGIN => self.gate(&peer, id, body, Gate::Login).await,
            prefixes::REGISTER => self.gate(&peer, id, body, Gate::Register).await,
            other => {
                warn!(peer = peer.id(), prefix = %other, "Ignoring request before login");
                Ok(())
            }
        }
    }

    async fn gate(&self, peer: &Peer, id: ConversationId, body: &[u8], gate: Gate) -> Result<()> {
        if body.is_empty() {
            let form = match gate {
                Gate::Login => self.login.login_form(),
                Gate::Register => self.login.register_form(),
            };
            let reply = format!("{}:{form}", prefixes::FORM);
            return peer.reply(id, reply.as_bytes()).await;
        }

        let (outcome, tag) = match gate {
            Gate::Login => (self.login.login(body), prefixes::LOGGED_IN),
            Gate::Register => (self.login.register(body), prefixes::REGISTERED),
        };
        let reply = match outcome {
            LoginOutcome::Accepted(identity) => {
                debug!(peer = peer.id(), %identity, "Peer logged in");
                let reply = format!("{tag}:{identity}");
                peer.set_identity(identity);
                reply
            }
            LoginOutcome::Rejected(message) => format!("{}:{message}", prefixes::ERROR),
        };
        peer.reply(id, reply.as_bytes()).await
    }
}

impl WorkHandler<WorkItem> for Router {
    fn handle(&self, item: WorkItem) -> BoxFuture<'_, Result<()>> {
        self.process(item).boxed()
    }
}
