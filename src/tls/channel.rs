//! Secure Channel
//!
//! TLS over TCP between the two endpoints, followed by the password
//! exchange. The responder accepts exactly one peer per session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::cert::TlsIdentity;
use super::verifier::{Fingerprint, PeerCertVerifier};
use crate::auth::{self, PasswordGate};
use crate::error::{Error, Result};

/// Established, authenticated tunnel stream
pub type SecureStream = tokio_rustls::TlsStream<TcpStream>;

/// Default wait for the initiator's password line
pub const PASSWORD_ENTRY_TIMEOUT: Duration = Duration::from_secs(120);

/// Listening side of the tunnel
pub struct Responder {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    password_timeout: Duration,
}

impl Responder {
    /// Bind the tunnel listener
    pub async fn bind(addr: SocketAddr, identity: TlsIdentity, handshake_timeout: Duration) -> Result<Self> {
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(identity.chain, identity.key)?;

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => return Err(Error::BindInUse(addr)),
            Err(e) => return Err(Error::from_os(&format!("Failed to bind {}", addr), e)),
        };
        tracing::info!("Tunnel listener bound on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(Arc::new(config)),
            handshake_timeout,
            password_timeout: PASSWORD_ENTRY_TIMEOUT,
        })
    }

    /// How long to wait for the peer's password once it is asked for
    pub fn with_password_timeout(mut self, timeout: Duration) -> Self {
        self.password_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one peer, run the TLS handshake and the password exchange.
    ///
    /// The listener is closed once the connection is accepted.
    pub async fn accept(self, gate: &PasswordGate) -> Result<(SecureStream, SocketAddr)> {
        let Responder {
            listener,
            acceptor,
            handshake_timeout,
            password_timeout,
        } = self;

        let (socket, peer) = listener.accept().await?;
        drop(listener);
        socket.set_nodelay(true)?;
        tracing::info!("Peer connected from {}", peer);

        let mut tls = tokio::time::timeout(handshake_timeout, acceptor.accept(socket))
            .await
            .map_err(|_| Error::HandshakeFailed(format!("peer {} timed out after {:?}", peer, handshake_timeout)))?
            .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
        tracing::info!("TLS handshake with {} complete", peer);

        auth::respond(&mut tls, gate, password_timeout).await?;
        Ok((SecureStream::from(tls), peer))
    }
}

/// Dialling side of the tunnel
pub struct Initiator {
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl Initiator {
    /// The responder's certificate is checked only against `pin`, if given
    pub fn new(pin: Option<Fingerprint>, handshake_timeout: Duration) -> Self {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PeerCertVerifier::new(pin)))
            .with_no_client_auth();

        Self {
            connector: TlsConnector::from(Arc::new(config)),
            handshake_timeout,
        }
    }

    /// Dial the responder, handshake and authenticate.
    ///
    /// `password` is awaited only if the responder asks for one, and the
    /// wait is not counted against the handshake timeout.
    pub async fn connect<F>(&self, peer: &str, port: u16, password: F) -> Result<SecureStream>
    where
        F: Future<Output = Option<String>>,
    {
        let address = format!("{}:{}", peer, port);
        let server_name = ServerName::try_from(peer.to_string())
            .map_err(|e| Error::Config(format!("invalid peer address '{}': {}", peer, e)))?;

        tracing::info!("Connecting to responder at {}", address);
        let socket = TcpStream::connect((peer, port))
            .await
            .map_err(|e| Error::PeerUnreachable {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        socket.set_nodelay(true)?;

        let timed_out = || Error::HandshakeFailed(format!("{} timed out after {:?}", address, self.handshake_timeout));

        let establish = async {
            let mut tls = self
                .connector
                .connect(server_name, socket)
                .await
                .map_err(|e| Error::HandshakeFailed(e.to_string()))?;
            tracing::info!("TLS handshake with {} complete", address);
            let required = auth::challenge(&mut tls).await?;
            Ok::<_, Error>((tls, required))
        };
        let (mut tls, required) = tokio::time::timeout(self.handshake_timeout, establish)
            .await
            .map_err(|_| timed_out())??;

        if required {
            let password = password.await;
            tokio::time::timeout(self.handshake_timeout, auth::answer(&mut tls, password))
                .await
                .map_err(|_| timed_out())??;
        }

        Ok(SecureStream::from(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PasswordRecord;
    use crate::tls::cert::{generate_self_signed, CertificateMaterial, CertificateStore};
    use std::sync::OnceLock;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn material() -> &'static CertificateMaterial {
        static MATERIAL: OnceLock<CertificateMaterial> = OnceLock::new();
        MATERIAL.get_or_init(|| generate_self_signed().unwrap())
    }

    fn store() -> (TempDir, CertificateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path().join("cert.pem"), dir.path().join("key.pem"));
        std::fs::write(store.cert_path(), &material().certificate_pem).unwrap();
        std::fs::write(store.key_path(), &material().private_key_pem).unwrap();
        (dir, store)
    }

    async fn responder(store: &CertificateStore) -> (Responder, u16) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let responder = Responder::bind(addr, store.load().unwrap(), TIMEOUT).await.unwrap();
        let port = responder.local_addr().unwrap().port();
        (responder, port)
    }

    #[tokio::test]
    async fn test_tunnel_established_with_password() {
        let (_dir, store) = store();
        let (responder, port) = responder(&store).await;
        let gate = PasswordGate::Required(PasswordRecord::create("correct").unwrap());

        let server = tokio::spawn(async move {
            let (mut stream, _peer) = responder.accept(&gate).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let initiator = Initiator::new(None, TIMEOUT);
        let mut stream = initiator
            .connect("127.0.0.1", port, async { Some("correct".to_string()) })
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (_dir, store) = store();
        let (responder, port) = responder(&store).await;
        let gate = PasswordGate::Required(PasswordRecord::create("correct").unwrap());

        let server = tokio::spawn(async move { responder.accept(&gate).await.map(|_| ()) });

        let result = Initiator::new(None, TIMEOUT)
            .connect("127.0.0.1", port, async { Some("wrong".to_string()) })
            .await;
        assert!(matches!(result, Err(Error::AuthRejected(_))));
        assert!(matches!(server.await.unwrap(), Err(Error::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_pinned_fingerprint() {
        let (_dir, store) = store();
        let expected = store.load().unwrap().fingerprint().unwrap();

        let (first, port) = responder(&store).await;
        let server = tokio::spawn(async move { first.accept(&PasswordGate::Open).await.map(|_| ()) });
        Initiator::new(Some(expected), TIMEOUT)
            .connect("127.0.0.1", port, async { None::<String> })
            .await
            .unwrap();
        server.await.unwrap().unwrap();

        let (second, port) = responder(&store).await;
        let server = tokio::spawn(async move { second.accept(&PasswordGate::Open).await.map(|_| ()) });
        let result = Initiator::new(Some(Fingerprint::of(b"someone else")), TIMEOUT)
            .connect("127.0.0.1", port, async { None::<String> })
            .await;
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
        assert!(matches!(server.await.unwrap(), Err(Error::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_slow_password_entry_not_counted_as_handshake() {
        let (_dir, store) = store();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Responder::bind(addr, store.load().unwrap(), Duration::from_secs(1))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let gate = PasswordGate::Required(PasswordRecord::create("correct").unwrap());

        let server = tokio::spawn(async move { listener.accept(&gate).await.map(|_| ()) });

        let typed = async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            Some("correct".to_string())
        };
        Initiator::new(None, Duration::from_secs(1))
            .connect("127.0.0.1", port, typed)
            .await
            .unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_password_entry_deadline_rejects_both_sides() {
        let (_dir, store) = store();
        let (listener, port) = responder(&store).await;
        let listener = listener.with_password_timeout(Duration::from_millis(200));
        let gate = PasswordGate::Required(PasswordRecord::create("correct").unwrap());

        let server = tokio::spawn(async move { listener.accept(&gate).await.map(|_| ()) });

        let typed = async {
            tokio::time::sleep(Duration::from_millis(600)).await;
            Some("correct".to_string())
        };
        let result = Initiator::new(None, TIMEOUT).connect("127.0.0.1", port, typed).await;
        assert!(result.is_err());
        assert!(matches!(server.await.unwrap(), Err(Error::AuthRejected(_))));
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let (_dir, store) = store();
        let (_first, port) = responder(&store).await;
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let second = Responder::bind(addr, store.load().unwrap(), TIMEOUT).await;
        assert!(matches!(second, Err(Error::BindInUse(a)) if a == addr));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Bind then drop to find a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = Initiator::new(None, TIMEOUT).connect("127.0.0.1", port, async { None::<String> }).await;
        assert!(matches!(result, Err(Error::PeerUnreachable { .. })));
    }
}
