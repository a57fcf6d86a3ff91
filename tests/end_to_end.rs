//! Client and server talking over real TCP sockets.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use secure_mux::config::{ClientConfig, ServerConfig};
use secure_mux::core::frame::ConversationId;
use secure_mux::error::{ProtocolError, Result};
use secure_mux::protocol::form::FormField;
use secure_mux::protocol::handshake::AcceptFirst;
use secure_mux::protocol::identity::{Issuer, ServerCredentials, TrustAnchor};
use secure_mux::protocol::{Multiplexer, Registry};
use secure_mux::service::{Client, Peer, Server, StaticLogin};
use secure_mux::transport::NameService;
use secure_mux::utils::Metrics;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const KEY_BITS: usize = 1024;
const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    address: String,
    server: Arc<Server>,
    trust: TrustAnchor,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    async fn start(config: ServerConfig) -> Self {
        let issuer = Issuer::generate(KEY_BITS).unwrap();
        let credentials = ServerCredentials::issue(
            &issuer,
            "mux-test",
            "127.0.0.1",
            "https://mux.test",
            "ops@mux.test",
            KEY_BITS,
        )
        .unwrap();
        let login = Arc::new(StaticLogin::new().with_registration().with_user("alice", "secret"));
        let server = Arc::new(Server::new(
            config,
            Registry::with_defaults(),
            credentials,
            login,
            Arc::new(Metrics::new()),
        ));

        server
            .actions()
            .register("echo", |peer: Arc<Peer>, id, body: Vec<u8>| async move {
                peer.reply(id, &body).await
            })
            .unwrap();
        server
            .actions()
            .register("whoami", |peer: Arc<Peer>, id, _body| async move {
                let name = peer.identity().unwrap_or_default();
                peer.reply(id, format!("log:{name}").as_bytes()).await
            })
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (shutdown, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(server.clone().run(listener, shutdown_rx));

        Self {
            address,
            server,
            trust: issuer.trust_anchor(),
            shutdown,
            task,
        }
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            address: self.address.clone(),
            response_timeout: WAIT,
            ..ClientConfig::default()
        }
    }

    async fn connect(&self) -> Client {
        Client::connect(
            self.client_config(),
            &Registry::with_defaults(),
            &self.trust,
            &AcceptFirst,
            Arc::new(Metrics::new()),
        )
        .await
        .expect("client should connect")
    }

    async fn stop(self) {
        self.shutdown.send(()).await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

fn test_server_config() -> ServerConfig {
    ServerConfig {
        workers: 2,
        backlog_capacity: 16,
        shutdown_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_login_on_explicit_conversation() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;
    assert_eq!(client.server_identity().name, "mux-test");
    assert_eq!(client.codec_name(), "std");

    let mux = client.multiplexer();
    let id = ConversationId::new(7);
    mux.conversations().lock(id);
    mux.send(b"login;alice;secret", id, None).await.unwrap();
    let reply = mux.await_reply(id, Some(WAIT)).await.unwrap();
    assert_eq!(reply, b"log:alice");
    mux.release(id);

    let reply = client.request("whoami", b"").await.unwrap();
    assert_eq!(reply, b"log:alice");

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_login_form_and_rejection() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;

    let form = client.login_form().await.unwrap();
    assert_eq!(
        form.fields(),
        &[
            FormField::Text("user".into()),
            FormField::Hidden("password".into())
        ]
    );

    let reply = client.login(&["alice", "wrong"]).await.unwrap();
    assert!(reply.starts_with("err:"), "unexpected reply {reply}");

    let reply = client.register(&["bob", "hunter2"]).await.unwrap();
    assert_eq!(reply, "reg:bob");

    let reply = client.request("echo", b"after registration").await.unwrap();
    assert_eq!(reply, b"after registration");

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_requests_before_login_get_no_answer() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;

    let result = client
        .multiplexer()
        .request(b"echo;hello", Some(Duration::from_millis(300)))
        .await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));

    let reply = client.login(&["alice", "secret"]).await.unwrap();
    assert_eq!(reply, "log:alice");
    let reply = client.request("echo", b"hello").await.unwrap();
    assert_eq!(reply, b"hello");

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_server_initiated_request_reaches_client_actions() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;
    client
        .actions()
        .register("ping", |mux: Arc<Multiplexer>, id, body: Vec<u8>| async move {
            let mut reply = b"pong:".to_vec();
            reply.extend_from_slice(&body);
            mux.send(&reply, id, None).await
        })
        .unwrap();
    assert_eq!(client.login(&["alice", "secret"]).await.unwrap(), "log:alice");

    let peer = harness
        .server
        .peers()
        .into_iter()
        .find(|peer| peer.identity().as_deref() == Some("alice"))
        .expect("logged-in peer");
    let reply = peer.request(b"ping:42", Some(WAIT)).await.unwrap();
    assert_eq!(reply, b"pong:42");

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_close_cancels_pending_wait() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;
    let mux = client.multiplexer().clone();

    let id = ConversationId::new(3);
    mux.conversations().lock(id);
    mux.send(b"nobody;listens", id, None).await.unwrap();
    let waiter = {
        let mux = mux.clone();
        tokio::spawn(async move { mux.await_reply(id, None).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    mux.close().await;
    let outcome = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(ProtocolError::Cancelled)));

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_connect_by_name() {
    let harness = Harness::start(test_server_config()).await;

    let names = NameService::new();
    names.register("home", &harness.address).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let resolver = listener.local_addr().unwrap().to_string();
    let (names_tx, names_rx) = mpsc::channel(1);
    let names_task = {
        let names = names.clone();
        tokio::spawn(async move { names.serve(listener, names_rx).await })
    };

    let config = ClientConfig {
        resolver_address: Some(resolver),
        ..harness.client_config()
    };
    let client = Client::connect_by_name(
        "home",
        config.clone(),
        &Registry::with_defaults(),
        &harness.trust,
        &AcceptFirst,
        Arc::new(Metrics::new()),
    )
    .await
    .unwrap();
    assert_eq!(client.login(&["alice", "secret"]).await.unwrap(), "log:alice");
    client.close().await;

    let missing = Client::connect_by_name(
        "nowhere",
        config,
        &Registry::with_defaults(),
        &harness.trust,
        &AcceptFirst,
        Arc::new(Metrics::new()),
    )
    .await;
    assert!(matches!(missing, Err(ProtocolError::UnknownName(name)) if name == "nowhere"));

    names_tx.send(()).await.unwrap();
    names_task.await.unwrap().unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_connect_by_name_without_resolver() {
    let harness = Harness::start(test_server_config()).await;
    let result = Client::connect_by_name(
        "home",
        harness.client_config(),
        &Registry::with_defaults(),
        &harness.trust,
        &AcceptFirst,
        Arc::new(Metrics::new()),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    harness.stop().await;
}

#[tokio::test]
async fn test_untrusted_server_is_refused() {
    let harness = Harness::start(test_server_config()).await;
    let stranger = Issuer::generate(KEY_BITS).unwrap().trust_anchor();

    let result = Client::connect(
        harness.client_config(),
        &Registry::with_defaults(),
        &stranger,
        &AcceptFirst,
        Arc::new(Metrics::new()),
    )
    .await;
    assert!(matches!(result, Err(ProtocolError::CertificateRejected(_))));
    harness.stop().await;
}

#[tokio::test]
async fn test_pool_cannot_be_resized_while_accepting() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;

    assert!(matches!(
        harness.server.configure_pool(8, 8),
        Err(ProtocolError::PoolRunning)
    ));
    let stats = harness.server.pool_stats();
    assert_eq!(stats.workers, 2);
    assert_eq!(stats.capacity, 16);

    client.close().await;
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let harness = Harness::start(test_server_config()).await;
    let client = harness.connect().await;
    assert_eq!(client.login(&["alice", "secret"]).await.unwrap(), "log:alice");

    harness.stop().await;

    tokio::time::timeout(WAIT, async {
        while !client.is_closed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client should observe the hangup");
    assert!(client.request("echo", b"late").await.is_err());

    tokio::time::timeout(WAIT, async {
        while client.metrics().snapshot().connections_active != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hangup should release the connection gauge");

    let metrics = client.metrics().clone();
    client.close().await;
    assert_eq!(metrics.snapshot().connections_active, 0);
}

#[tokio::test]
async fn test_connection_limit_counts_handshakes_in_progress() {
    let harness = Harness::start(ServerConfig {
        max_connections: 1,
        ..test_server_config()
    })
    .await;

    // Holds the only slot without ever finishing the handshake.
    let stalled = TcpStream::connect(&harness.address).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let refused = Client::connect(
        harness.client_config(),
        &Registry::with_defaults(),
        &harness.trust,
        &AcceptFirst,
        Arc::new(Metrics::new()),
    )
    .await;
    assert!(refused.is_err());

    drop(stalled);
    let client = tokio::time::timeout(WAIT, async {
        loop {
            let attempt = Client::connect(
                harness.client_config(),
                &Registry::with_defaults(),
                &harness.trust,
                &AcceptFirst,
                Arc::new(Metrics::new()),
            )
            .await;
            if let Ok(client) = attempt {
                break client;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("slot should free up once the stalled connection ends");
    assert_eq!(client.login(&["alice", "secret"]).await.unwrap(), "log:alice");

    client.close().await;
    harness.stop().await;
}
