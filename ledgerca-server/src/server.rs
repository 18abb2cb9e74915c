//! Server lifecycle.
//!
//! `init` prepares everything that must exist before the first request: CA
//! key material, database, registry, bootstrap data and the signer. `start`
//! binds the listener and serves; `stop` aborts the accept loop and every
//! open connection.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use crate::bootstrap::{self, BootstrapError};
use crate::ca::{
    ensure_key_material, CaKeyMaterial, CertSigner, EnrollmentEngine, KeyMaterialError, SignError,
};
use crate::certdb::CertStore;
use crate::config::{ConfigError, ServerConfig};
use crate::db::{Database, DbError};
use crate::registry::{DirectoryRegistry, LdapDirectory, Registry, RegistryError, SqlRegistry};
use crate::tls::{self, TlsConfigError, TLS_HANDSHAKE_TIMEOUT};

/// Errors from server initialization and lifecycle. All are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    KeyMaterial(#[from] KeyMaterialError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("registry initialization failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("signer initialization failed: {0}")]
    Signer(#[from] SignError),
    #[error(transparent)]
    Tls(#[from] TlsConfigError),
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server is already started")]
    AlreadyStarted,
    #[error("server is not started")]
    NotStarted,
}

/// Process-wide handles shared by every request.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: Arc<dyn Registry>,
    pub certs: CertStore,
    pub engine: EnrollmentEngine,
    pub ca: Arc<CaKeyMaterial>,
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("registry", &self.registry.backend())
            .field("ca", &self.ca)
            .finish_non_exhaustive()
    }
}

pub struct Server {
    config: ServerConfig,
    home: PathBuf,
    ctx: Option<Arc<ServerContext>>,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a server rooted at `home`. Relative file names in `config`
    /// are resolved against it.
    pub fn new(mut config: ServerConfig, home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        config.make_paths_absolute(&home);
        Self {
            config,
            home,
            ctx: None,
            task: None,
            local_addr: None,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared context, once initialized.
    pub fn context(&self) -> Option<&Arc<ServerContext>> {
        self.ctx.as_ref()
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Prepare CA key material, storage and bootstrap data.
    ///
    /// With `renew`, a new CA key and certificate replace existing ones.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` on any failure; nothing is served.
    pub async fn init(&mut self, renew: bool) -> Result<(), ServerError> {
        self.config.validate()?;
        std::fs::create_dir_all(&self.home).map_err(|source| ConfigError::Read {
            path: self.home.clone(),
            source,
        })?;

        ensure_key_material(&self.config.ca, &self.config.csr, renew)?;
        let ca = Arc::new(CaKeyMaterial::load(&self.config.ca)?);
        tracing::info!(
            certfile = %self.config.ca.certfile,
            fingerprint = %ca.fingerprint(),
            "Loaded CA key material"
        );

        let db = Database::connect(&self.config.db).await?;
        let registry: Arc<dyn Registry> = if self.config.ldap.enabled {
            let directory = LdapDirectory::connect(&self.config.ldap).await?;
            Arc::new(DirectoryRegistry::new(directory, db.clone()))
        } else {
            Arc::new(SqlRegistry::new(db.clone()))
        };
        tracing::info!(backend = registry.backend(), "Registry ready");

        bootstrap::run(registry.as_ref(), &self.config).await?;

        let signer = CertSigner::new(ca.clone(), &self.config.signing, self.config.remote.as_deref())?;
        let certs = CertStore::new(db);
        let engine = EnrollmentEngine::new(
            registry.clone(),
            certs.clone(),
            signer,
            ca.cert_pem().to_string(),
            self.config.registry.max_enrollments,
        );

        self.ctx = Some(Arc::new(ServerContext {
            config: self.config.clone(),
            registry,
            certs,
            engine,
            ca,
        }));
        Ok(())
    }

    /// The HTTP router. Initializes the server first if needed.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if initialization fails.
    pub async fn router(&mut self) -> Result<Router, ServerError> {
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => {
                self.init(false).await?;
                self.ctx.clone().ok_or(ServerError::NotStarted)?
            }
        };
        Ok(crate::api::router(ctx))
    }

    /// Bind the listener and serve.
    ///
    /// In blocking mode this returns only if the accept loop ends. Otherwise
    /// it returns once the listener is bound and serving continues on a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::AlreadyStarted` on a second call, or any
    /// initialization, TLS or bind failure.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.task.is_some() {
            return Err(ServerError::AlreadyStarted);
        }
        let router = self.router().await?;

        let acceptor = if self.config.tls.enabled {
            Some(TlsAcceptor::from(tls::server_config(&self.config.tls)?))
        } else {
            None
        };

        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
        self.local_addr = Some(local_addr);
        tracing::info!(
            addr = %local_addr,
            tls = acceptor.is_some(),
            blocking = self.config.blocking,
            "Listening"
        );

        let serving = accept_loop(listener, router, acceptor);
        if self.config.blocking {
            serving.await;
        } else {
            self.task = Some(tokio::spawn(serving));
        }
        Ok(())
    }

    /// Stop serving. Open connections are dropped, not drained.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::NotStarted` if there is no background accept
    /// loop to stop.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        let task = self.task.take().ok_or(ServerError::NotStarted)?;
        task.abort();
        self.local_addr = None;
        tracing::info!("Server stopped");
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Accept connections until aborted. Each connection runs on its own task
/// owned by the loop, so aborting the loop drops them all.
async fn accept_loop(listener: TcpListener, router: Router, acceptor: Option<TlsAcceptor>) {
    let mut connections = JoinSet::new();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept failed");
                continue;
            }
        };
        while connections.try_join_next().is_some() {}

        let router = router.clone();
        let acceptor = acceptor.clone();
        connections.spawn(async move {
            match acceptor {
                None => serve_connection(TokioIo::new(stream), router, peer).await,
                Some(acceptor) => {
                    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
                    {
                        Ok(Ok(tls_stream)) => {
                            tracing::debug!(%peer, "TLS handshake successful");
                            serve_connection(TokioIo::new(tls_stream), router, peer).await;
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(%peer, error = %e, "TLS handshake failed");
                        }
                        Err(_) => {
                            tracing::warn!(
                                %peer,
                                timeout_secs = ?TLS_HANDSHAKE_TIMEOUT,
                                "TLS handshake timed out"
                            );
                        }
                    }
                }
            }
        });
    }
}

async fn serve_connection<I>(io: TokioIo<I>, router: Router, peer: SocketAddr)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(router);
    let builder = auto::Builder::new(TokioExecutor::new());
    if let Err(e) = builder.serve_connection(io, service).await {
        tracing::debug!(%peer, error = %e, "Connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.address = "127.0.0.1".into();
        config.port = 0;
        config.blocking = false;
        config
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let home = tempfile::tempdir().unwrap();
        let mut first = Server::new(config(), home.path());
        first.init(false).await.unwrap();
        let cert = std::fs::read(&first.config().ca.certfile).unwrap();
        drop(first);

        let mut second = Server::new(config(), home.path());
        second.init(false).await.unwrap();

        assert_eq!(std::fs::read(&second.config().ca.certfile).unwrap(), cert);
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let home = tempfile::tempdir().unwrap();
        let mut server = Server::new(config(), home.path());

        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
        assert!(matches!(server.start().await, Err(ServerError::AlreadyStarted)));

        server.stop().unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
        assert!(matches!(server.stop(), Err(ServerError::NotStarted)));
    }

    #[tokio::test]
    async fn invalid_backend_is_fatal() {
        let home = tempfile::tempdir().unwrap();
        let mut config = config();
        config.db.db_type = "oracle".into();
        let mut server = Server::new(config, home.path());

        assert!(matches!(
            server.init(false).await,
            Err(ServerError::Config(ConfigError::InvalidBackend(_)))
        ));
    }

    #[tokio::test]
    async fn tls_without_files_is_fatal() {
        let home = tempfile::tempdir().unwrap();
        let mut config = config();
        config.tls.enabled = true;
        let mut server = Server::new(config, home.path());

        assert!(matches!(server.start().await, Err(ServerError::Tls(_))));
    }
}
