//! TLS termination: certificate loading with hot reload.
//!
//! The certificate/key pair lives behind a shared/exclusive lock and is
//! re-read when the files change on disk. A broken replacement keeps the
//! old pair serving, so a botched rotation never takes the listener down.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use axum::{
    extract::connect_info::Connected,
    serve::{IncomingStream, Listener},
};
use eyre::{Context, Result};
use futures_util::{Stream, StreamExt};
use notify::{RecursiveMode, Watcher};
use rustls::{
    crypto::ring::sign::any_supported_type,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use rustls_pemfile::{certs, private_key};
use tokio::io::{AsyncRead, AsyncWrite};

pub struct CertLoader {
    cert_path: PathBuf,
    key_path: PathBuf,
    current: RwLock<Arc<CertifiedKey>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl CertLoader {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        let certified = load_certified_key(&cert_path, &key_path)?;
        Ok(Arc::new(Self {
            cert_path,
            key_path,
            current: RwLock::new(Arc::new(certified)),
            watcher: Mutex::new(None),
        }))
    }

    /// Re-read the pair from disk; on failure the old pair stays live.
    pub fn reload(&self) -> Result<()> {
        let certified = load_certified_key(&self.cert_path, &self.key_path)?;
        *self.current.write().expect("cert lock poisoned") = Arc::new(certified);
        tracing::info!(cert = %self.cert_path.display(), "TLS certificate reloaded");
        Ok(())
    }

    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.current.read().expect("cert lock poisoned"))
    }

    /// Watch the certificate files and reload on change.
    pub fn watch(self: &Arc<Self>) {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(4);

        let cert_name = self.cert_path.file_name().map(|n| n.to_owned());
        let key_name = self.key_path.file_name().map(|n| n.to_owned());
        let watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let relevant = (event.kind.is_modify() || event.kind.is_create())
                        && event.paths.iter().any(|p| {
                            p.file_name() == cert_name.as_deref()
                                || p.file_name() == key_name.as_deref()
                        });
                    if relevant {
                        let _ = tx.try_send(());
                    }
                }
            },
        );

        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::error!(error = %e, "failed to create certificate watcher");
                return;
            }
        };

        let watch_dir = self
            .cert_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            tracing::error!(error = %e, "failed to watch certificate directory");
            return;
        }
        *self.watcher.lock().expect("watcher slot poisoned") = Some(watcher);

        let loader = Arc::clone(self);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = loader.reload() {
                    tracing::error!(error = %e, "certificate reload failed, keeping old pair");
                }
            }
        });
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("opening certificate {}", cert_path.display()))?;
    let chain: Vec<_> = certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .context("parsing certificate chain")?;
    if chain.is_empty() {
        eyre::bail!("no certificates found in {}", cert_path.display());
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("opening private key {}", key_path.display()))?;
    let key = private_key(&mut std::io::BufReader::new(key_file))
        .context("parsing private key")?
        .ok_or_else(|| eyre::eyre!("no private key found in {}", key_path.display()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| eyre::eyre!("unsupported private key type: {e}"))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Serves the loader's current pair on every handshake.
#[derive(Debug)]
pub struct CertResolver(pub Arc<CertLoader>);

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.certified_key())
    }
}

impl std::fmt::Debug for CertLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertLoader")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish()
    }
}

/// Build the rustls server config for the listener.
pub fn server_config(loader: Arc<CertLoader>, min_version: &str) -> Result<rustls::ServerConfig> {
    let versions: &[&'static rustls::SupportedProtocolVersion] = if min_version == "1.3" {
        &[&rustls::version::TLS13]
    } else {
        &[&rustls::version::TLS12, &rustls::version::TLS13]
    };

    let mut config = rustls::ServerConfig::builder_with_protocol_versions(versions)
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertResolver(loader)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// The client socket address, extracted via axum's `ConnectInfo`.
///
/// A local newtype is required (rather than using `SocketAddr` directly)
/// so that [`Connected`] can be implemented for the TLS listener stream
/// without violating the orphan rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

impl std::ops::Deref for ClientAddr {
    type Target = SocketAddr;

    fn deref(&self) -> &SocketAddr {
        &self.0
    }
}

impl std::fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SocketAddr> for ClientAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl Connected<IncomingStream<'_, tokio::net::TcpListener>> for ClientAddr {
    fn connect_info(stream: IncomingStream<'_, tokio::net::TcpListener>) -> Self {
        Self(*stream.remote_addr())
    }
}

/// Adapts a TLS accept stream to axum's listener interface.
pub struct StreamListener<S> {
    pub stream: S,
    pub local_addr: SocketAddr,
}

impl<S, I, E> Listener for StreamListener<S>
where
    S: Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!(error = %e, "TLS accept error"),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

impl<S, I, E> Connected<IncomingStream<'_, StreamListener<S>>> for ClientAddr
where
    S: Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    fn connect_info(stream: IncomingStream<'_, StreamListener<S>>) -> Self {
        Self(*stream.remote_addr())
    }
}
