//! In-process SSH jump host and PostgreSQL backend for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use pg_ssh_proxy::protocol::{read_initial_packet, InitialPacket, StartupMessage};

pub fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("generate key")
}

/// OpenSSH PEM encoding of a private key.
pub fn openssh_private(key: &PrivateKey) -> String {
    key.to_openssh(LineEnding::LF).expect("encode key").to_string()
}

/// A known_hosts line for a server listening on `addr`.
pub fn known_hosts_line(addr: SocketAddr, host_key: &PrivateKey) -> String {
    format!(
        "[{}]:{} {}\n",
        addr.ip(),
        addr.port(),
        host_key.public_key().to_openssh().expect("encode public key")
    )
}

/// An address nothing is listening on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Something the jump host observed, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpEvent {
    ChannelEof,
    SessionEnded,
}

/// SSH server that accepts one public key and forwards direct-tcpip channels.
pub struct JumpHost {
    pub addr: SocketAddr,
    pub host_key: PrivateKey,
    events: Arc<Mutex<Vec<JumpEvent>>>,
    sessions: Arc<Mutex<Vec<russh::server::Handle>>>,
}

impl JumpHost {
    pub async fn start(authorized: PublicKey) -> Self {
        let host_key = generate_key();
        let config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key.clone()],
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sessions = Arc::new(Mutex::new(Vec::new()));

        let (accept_events, accept_sessions) = (events.clone(), sessions.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = ForwardingHandler {
                    authorized: authorized.clone(),
                    events: accept_events.clone(),
                };
                let config = config.clone();
                let events = accept_events.clone();
                let sessions = accept_sessions.clone();
                tokio::spawn(async move {
                    if let Ok(session) = russh::server::run_stream(config, stream, handler).await {
                        sessions.lock().unwrap().push(session.handle());
                        let _ = session.await;
                        events.lock().unwrap().push(JumpEvent::SessionEnded);
                    }
                });
            }
        });

        Self {
            addr,
            host_key,
            events,
            sessions,
        }
    }

    pub fn events(&self) -> Vec<JumpEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until `event` has been observed, failing after a few seconds.
    pub async fn wait_for(&self, event: JumpEvent) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.events().contains(&event) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{:?} not observed, saw {:?}", event, self.events()));
    }

    /// Drop every client connection from the server side.
    pub async fn disconnect_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().drain(..).collect();
        for session in sessions {
            let _ = session
                .disconnect(Disconnect::ByApplication, "going away".into(), "en".into())
                .await;
        }
        self.wait_for(JumpEvent::SessionEnded).await;
    }

    pub fn known_hosts(&self) -> String {
        known_hosts_line(self.addr, &self.host_key)
    }
}

struct ForwardingHandler {
    authorized: PublicKey,
    events: Arc<Mutex<Vec<JumpEvent>>>,
}

impl ForwardingHandler {
    fn check(&self, public_key: &PublicKey) -> Auth {
        if public_key.key_data() == self.authorized.key_data() {
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }
}

impl Handler for ForwardingHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check(public_key))
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.check(public_key))
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.events.lock().unwrap().push(JumpEvent::ChannelEof);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(mut target) = TcpStream::connect((host_to_connect, port_to_connect as u16)).await else {
            return Ok(false);
        };

        tokio::spawn(async move {
            let mut stream = Box::pin(channel.into_stream());
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
        });
        Ok(true)
    }
}

/// PostgreSQL stand-in: reports the startup message it receives, then echoes.
pub struct Backend {
    pub addr: SocketAddr,
    pub startup: oneshot::Receiver<StartupMessage>,
}

impl Backend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let packet = match read_initial_packet(&mut stream).await {
                Ok(Some(packet)) => packet,
                _ => return,
            };
            if let Ok(InitialPacket::Startup(startup)) = packet.decode() {
                let _ = tx.send(startup);
            }

            let (mut read, mut write) = stream.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });

        Self { addr, startup: rx }
    }
}

/// Number of entries left in a directory.
pub fn dir_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
