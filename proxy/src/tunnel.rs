//! SSH tunnels to PostgreSQL backends using russh.
//!
//! Handles:
//! - Loading candidate identities (unusable ones are skipped)
//! - Host key verification against a known-hosts source
//! - Opening a direct-tcpip channel to the destination

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelStream, Disconnect};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

use crate::config::{split_host_port, SshEndpoint};
use crate::error::{ProxyError, ProxyResult};
use crate::source::FileSource;

/// Accepts the server only if its key is listed for the host.
///
/// The reason for a rejection is left in `rejection` for the dialer.
pub struct KnownHostsCheck {
    addr: String,
    known: Vec<PublicKey>,
    rejection: Arc<Mutex<Option<String>>>,
}

impl client::Handler for KnownHostsCheck {
    type Error = ProxyError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if self
            .known
            .iter()
            .any(|key| key.key_data() == server_public_key.key_data())
        {
            debug!("Host key verified for {}", self.addr);
            return Ok(true);
        }

        let reason = if self.known.is_empty() {
            "host is not listed in known_hosts"
        } else {
            "host key does not match known_hosts"
        };
        warn!(
            "Rejecting {} key offered by {}: {}",
            server_public_key.algorithm(),
            self.addr,
            reason
        );
        if let Ok(mut slot) = self.rejection.lock() {
            *slot = Some(reason.to_string());
        }
        Ok(false)
    }
}

/// Establishes tunnels. Shared by every session.
pub struct TunnelDialer {
    fs: Arc<dyn FileSource>,
    temp_dir: PathBuf,
    config: Arc<client::Config>,
}

impl TunnelDialer {
    pub fn new(fs: Arc<dyn FileSource>) -> Self {
        Self {
            fs,
            temp_dir: std::env::temp_dir(),
            config: Arc::new(client::Config::default()),
        }
    }

    /// Directory where known-hosts data is materialized while it is parsed.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Connect to `ssh` and open a channel to `destination` through it.
    pub async fn dial(&self, ssh: &SshEndpoint, destination: &str) -> ProxyResult<Tunnel> {
        let (dest_host, dest_port) = split_host_port(destination)?;
        let (ssh_host, ssh_port) = split_host_port(&ssh.addr)?;

        let identities = self.load_identities(&ssh.identities);
        if identities.is_empty() {
            return Err(ProxyError::SshAuthFailed {
                user: ssh.user.clone(),
                addr: ssh.addr.clone(),
                reason: format!("no usable identity among {:?}", ssh.identities),
            });
        }

        let known = self.load_known_hosts(&ssh.known_hosts, &ssh.addr, &ssh_host, ssh_port)?;
        let rejection = Arc::new(Mutex::new(None));
        let check = KnownHostsCheck {
            addr: ssh.addr.clone(),
            known,
            rejection: rejection.clone(),
        };

        debug!("Connecting to SSH server {} as {}", ssh.addr, ssh.user);
        let mut handle = match client::connect(self.config.clone(), ssh.addr.as_str(), check).await {
            Ok(handle) => handle,
            Err(e) => {
                let rejected = rejection.lock().ok().and_then(|mut slot| slot.take());
                return Err(match rejected {
                    Some(reason) => ProxyError::SshHostKeyRejected {
                        addr: ssh.addr.clone(),
                        reason,
                    },
                    None => e,
                });
            }
        };

        if let Err(e) = authenticate(&mut handle, ssh, identities).await {
            abandon(&handle, &ssh.addr).await;
            return Err(e);
        }

        let channel = match handle
            .channel_open_direct_tcpip(dest_host, u32::from(dest_port), "127.0.0.1", 0)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                abandon(&handle, &ssh.addr).await;
                return Err(match e {
                    russh::Error::ChannelOpenFailure(reason) => ProxyError::UpstreamDialFailed {
                        addr: destination.to_string(),
                        reason: format!("{:?}", reason),
                    },
                    other => ProxyError::Ssh(other),
                });
            }
        };

        info!("Tunnel open: {} via {}@{}", destination, ssh.user, ssh.addr);
        Ok(Tunnel {
            stream: Box::pin(channel.into_stream()),
            handle,
        })
    }

    /// Load every identity that can be read and parsed, in order.
    fn load_identities(&self, paths: &[String]) -> Vec<Arc<PrivateKey>> {
        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            let pem = match self.fs.read(path) {
                Ok(pem) => pem,
                Err(e) => {
                    debug!("Skipping identity {}: {}", path, e);
                    continue;
                }
            };
            let key = String::from_utf8(pem)
                .map_err(|e| e.to_string())
                .and_then(|pem| russh::keys::decode_secret_key(&pem, None).map_err(|e| e.to_string()));
            match key {
                Ok(key) => keys.push(Arc::new(key)),
                Err(e) => warn!("Skipping identity {}: {}", path, e),
            }
        }
        keys
    }

    /// Host keys listed for `host:port` in the known-hosts source.
    ///
    /// The source is copied to a private temporary file for the parser and the
    /// file is removed before returning.
    fn load_known_hosts(
        &self,
        source: &str,
        addr: &str,
        host: &str,
        port: u16,
    ) -> ProxyResult<Vec<PublicKey>> {
        let rejected = |reason: String| ProxyError::SshHostKeyRejected {
            addr: addr.to_string(),
            reason,
        };

        let mut src = self
            .fs
            .open(source)
            .map_err(|e| rejected(format!("cannot read known hosts {}: {}", source, e)))?;

        let mut file = tempfile::Builder::new()
            .prefix("known_hosts")
            .tempfile_in(&self.temp_dir)?;
        std::io::copy(&mut src, file.as_file_mut())?;
        file.as_file_mut().flush()?;

        let keys = russh::keys::known_hosts::known_host_keys_path(host, port, file.path())
            .map_err(|e| rejected(format!("cannot parse known hosts {}: {}", source, e)))?;
        file.close()?;

        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }
}

/// Offer each identity until the server accepts one.
async fn authenticate(
    handle: &mut Handle<KnownHostsCheck>,
    ssh: &SshEndpoint,
    identities: Vec<Arc<PrivateKey>>,
) -> ProxyResult<()> {
    let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

    for key in identities {
        let algorithm = key.algorithm();
        let result = handle
            .authenticate_publickey(ssh.user.as_str(), PrivateKeyWithHashAlg::new(key, hash_alg))
            .await?;
        if result.success() {
            debug!("Authenticated to {} as {} with {} key", ssh.addr, ssh.user, algorithm);
            return Ok(());
        }
        debug!("{} rejected {} key for {}", ssh.addr, algorithm, ssh.user);
    }

    Err(ProxyError::SshAuthFailed {
        user: ssh.user.clone(),
        addr: ssh.addr.clone(),
        reason: "no identity was accepted".to_string(),
    })
}

/// Drop a connection that will not become a tunnel.
async fn abandon(handle: &Handle<KnownHostsCheck>, addr: &str) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("Failed to disconnect from {}: {}", addr, e);
    }
}

/// A byte stream to a backend that has to be torn down explicitly.
pub trait Upstream: AsyncRead + AsyncWrite + Unpin + Send {
    fn close(self) -> impl Future<Output = ProxyResult<()>> + Send;
}

/// An SSH connection and the one channel forwarded through it.
pub struct Tunnel {
    stream: Pin<Box<ChannelStream<Msg>>>,
    handle: Handle<KnownHostsCheck>,
}

impl Tunnel {
    /// Close the channel, then the SSH connection.
    ///
    /// Both steps always run; if both fail the error carries both causes.
    pub async fn close(self) -> ProxyResult<()> {
        let Tunnel { mut stream, handle } = self;

        let channel = stream.shutdown().await;
        drop(stream);
        let connection = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;

        match (channel, connection) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) => Err(ProxyError::Io(e)),
            (Ok(()), Err(e)) => Err(ProxyError::Ssh(e)),
            (Err(channel), Err(connection)) => Err(ProxyError::Close {
                channel,
                connection,
            }),
        }
    }

    /// Whether the SSH connection behind this tunnel has ended.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Upstream for Tunnel {
    fn close(self) -> impl Future<Output = ProxyResult<()>> + Send {
        Tunnel::close(self)
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.get_mut().stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.get_mut().stream.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().stream.as_mut().poll_shutdown(cx)
    }
}
