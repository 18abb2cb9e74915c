//! Test harnesses for enrollment E2E tests.
//!
//! Requests go straight into the router with `oneshot` (no network).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use ledgerca_auth::{decode_certificate, AuthToken, BasicCredentials, PrivateKey};
use ledgerca_server::bootstrap;
use ledgerca_server::ca::{ensure_key_material, CaKeyMaterial, CertSigner, EnrollmentEngine};
use ledgerca_server::certdb::CertStore;
use ledgerca_server::config::IdentityConfig;
use ledgerca_server::db::Database;
use ledgerca_server::registry::{Directory, DirectoryEntry, DirectoryRegistry, Registry, RegistryError};
use ledgerca_server::{Server, ServerConfig, ServerContext};
use rcgen::{CertificateParams, KeyPair};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const ADMIN: &str = "admin";
pub const ADMIN_SECRET: &str = "adminpw";

/// Configuration with a bootstrap registrar and the given registry maximum.
pub fn config(registry_max: i64) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.address = "127.0.0.1".into();
    config.port = 0;
    config.blocking = false;
    config.registry.max_enrollments = registry_max;
    config
        .add_bootstrap_identity(ADMIN, ADMIN_SECRET, "")
        .expect("bootstrap identity");
    config
}

pub fn identity(id: &str, secret: &str, affiliation: &str, max_enrollments: i64) -> IdentityConfig {
    IdentityConfig {
        id: id.into(),
        pass: secret.into(),
        affiliation: affiliation.into(),
        max_enrollments,
        ..IdentityConfig::default()
    }
}

/// Decoded JSON reply.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
}

impl Reply {
    pub fn result(&self) -> &Value {
        &self.body["result"]
    }

    pub fn error_code(&self) -> Option<u64> {
        self.body["errors"][0]["code"].as_u64()
    }
}

/// An initialized server driven through its router.
pub struct TestServer {
    pub router: Router,
    pub ctx: Arc<ServerContext>,
    pub server: Option<Server>,
    _home: TempDir,
}

impl TestServer {
    /// Initialize a SQL-backed server in a fresh home directory.
    pub async fn new(config: ServerConfig) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let mut server = Server::new(config, home.path());
        let router = server.router().await.expect("server init");
        let ctx = server.context().expect("context").clone();
        Self {
            router,
            ctx,
            server: Some(server),
            _home: home,
        }
    }

    /// Assemble a server whose registry is backed by `directory`.
    pub async fn with_directory<D: Directory + 'static>(directory: D, registry_max: i64) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let mut config = config(registry_max);
        config.make_paths_absolute(home.path());

        ensure_key_material(&config.ca, &config.csr, false).expect("key material");
        let ca = Arc::new(CaKeyMaterial::load(&config.ca).expect("load CA"));
        let db = Database::connect(&config.db).await.expect("database");
        let registry: Arc<dyn Registry> = Arc::new(DirectoryRegistry::new(directory, db.clone()));
        bootstrap::run(registry.as_ref(), &config)
            .await
            .expect("bootstrap");

        let signer = CertSigner::new(ca.clone(), &config.signing, None).expect("signer");
        let certs = CertStore::new(db);
        let engine = EnrollmentEngine::new(
            registry.clone(),
            certs.clone(),
            signer,
            ca.cert_pem().to_string(),
            registry_max,
        );
        let ctx = Arc::new(ServerContext {
            config,
            registry,
            certs,
            engine,
            ca,
        });

        Self {
            router: ledgerca_server::api::router(ctx.clone()),
            ctx,
            server: None,
            _home: home,
        }
    }

    /// POST `body` to `/api/v1/<endpoint>` with an optional Authorization
    /// header.
    pub async fn post(&self, endpoint: &str, body: &[u8], auth: Option<String>) -> Reply {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/{endpoint}"))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        let request = builder.body(Body::from(body.to_vec())).expect("request");

        let response = self.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("JSON body")
        };
        Reply { status, body }
    }

    /// Enroll with an enrollment secret.
    pub async fn enroll(&self, id: &str, secret: &str) -> Result<Enrolled, Reply> {
        let (key, csr) = csr();
        let body = serde_json::json!({ "certificate_request": csr }).to_string();
        let auth = BasicCredentials::new(id, secret).encode();
        let reply = self.post("enroll", body.as_bytes(), Some(auth)).await;
        if reply.status != StatusCode::OK {
            return Err(reply);
        }
        Ok(Enrolled::from_reply(id, key, &reply))
    }

    /// Send `body` signed by `caller`'s certificate.
    pub async fn post_signed(&self, endpoint: &str, caller: &Enrolled, body: &Value) -> Reply {
        let body = body.to_string();
        let token = caller.token(body.as_bytes());
        self.post(endpoint, body.as_bytes(), Some(token)).await
    }

    /// Enroll the bootstrap registrar.
    pub async fn admin(&self) -> Enrolled {
        self.enroll(ADMIN, ADMIN_SECRET)
            .await
            .expect("admin enrollment")
    }

    pub async fn certificate_count(&self, id: &str) -> i64 {
        self.ctx.certs.count_by_owner(id).await.expect("count")
    }
}

/// An identity holding an issued certificate and its key.
pub struct Enrolled {
    pub id: String,
    pub key: PrivateKey,
    pub cert_der: Vec<u8>,
    pub cert_pem: String,
}

impl Enrolled {
    fn from_reply(id: &str, key: PrivateKey, reply: &Reply) -> Self {
        let cert_pem = reply.result()["cert"]
            .as_str()
            .expect("cert in reply")
            .to_string();
        let cert_der = decode_certificate(cert_pem.as_bytes()).expect("decode cert");
        Self {
            id: id.to_string(),
            key,
            cert_der,
            cert_pem,
        }
    }

    pub fn token(&self, body: &[u8]) -> String {
        AuthToken::create(&self.cert_der, body, &self.key)
            .expect("token")
            .encode()
    }
}

/// A fresh key and a PEM CSR for it.
pub fn csr() -> (PrivateKey, String) {
    let key = PrivateKey::generate();
    let pkcs8 = key.to_pkcs8_der().expect("pkcs8");
    let key_pair = KeyPair::try_from(pkcs8.as_bytes()).expect("key pair");
    let request = CertificateParams::new(Vec::<String>::new())
        .expect("params")
        .serialize_request(&key_pair)
        .expect("csr");
    (key, request.pem().expect("csr pem"))
}

/// Directory that answers from a fixed table of users.
#[derive(Default)]
pub struct StaticDirectory {
    users: HashMap<String, (DirectoryEntry, String)>,
}

impl StaticDirectory {
    pub fn with_user(mut self, id: &str, secret: &str) -> Self {
        let entry = DirectoryEntry {
            dn: format!("uid={id},ou=people,dc=example,dc=com"),
            attributes: BTreeMap::new(),
        };
        self.users.insert(id.to_string(), (entry, secret.to_string()));
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(
        &self,
        id: &str,
        _attrs: &[&str],
    ) -> Result<Option<DirectoryEntry>, RegistryError> {
        Ok(self.users.get(id).map(|(entry, _)| entry.clone()))
    }

    async fn bind(&self, dn: &str, secret: &str) -> Result<bool, RegistryError> {
        Ok(self
            .users
            .values()
            .any(|(entry, s)| entry.dn == dn && s == secret))
    }
}
