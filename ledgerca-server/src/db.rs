//! Relational store shared by the registry and the certificate store.
//!
//! Uses sqlx's `Any` driver so SQLite, PostgreSQL and MySQL are a matter of
//! configuration. Queries are written once with `?` placeholders and
//! rebound for PostgreSQL.

use std::path::Path;

use sqlx::any::{AnyPoolOptions, install_default_drivers};
use sqlx::AnyPool;

use crate::config::{DbConfig, DbKind};

/// Tables are created at startup; the DDL is valid on all three engines.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS affiliations (
        name VARCHAR(255) NOT NULL PRIMARY KEY,
        parent_id VARCHAR(255)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id VARCHAR(255) NOT NULL PRIMARY KEY,
        token VARCHAR(255) NOT NULL,
        type VARCHAR(64),
        affiliation VARCHAR(255),
        attributes TEXT,
        state BIGINT NOT NULL,
        max_enrollments BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS certificates (
        id VARCHAR(255) NOT NULL,
        serial_number VARCHAR(128) NOT NULL,
        authority_key_identifier VARCHAR(128) NOT NULL,
        status VARCHAR(32) NOT NULL,
        reason BIGINT NOT NULL,
        expiry BIGINT NOT NULL,
        revoked_at BIGINT NOT NULL,
        pem TEXT NOT NULL,
        PRIMARY KEY (serial_number, authority_key_identifier)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS directory_enrollments (
        id VARCHAR(255) NOT NULL PRIMARY KEY,
        state BIGINT NOT NULL
    )
    "#,
];

/// Errors opening the database.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// A pooled connection to the configured engine.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    kind: DbKind,
}

impl Database {
    /// Connect using the configured engine and create missing tables.
    ///
    /// # Errors
    ///
    /// Fails if the connection cannot be established or the schema cannot be
    /// created. Both are fatal at startup.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let kind = config
            .kind()
            .map_err(|e| sqlx::Error::Configuration(e.to_string().into()))?;

        if kind == DbKind::Sqlite {
            if let Some(parent) = sqlite_parent(&config.datasource) {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = connection_url(kind, config);
        tracing::debug!(engine = ?kind, "Connecting to database");
        Self::open(kind, &url).await
    }

    /// Connect to an explicit URL.
    ///
    /// # Errors
    ///
    /// Fails if the connection or schema creation fails.
    pub async fn open(kind: DbKind, url: &str) -> Result<Self, DbError> {
        install_default_drivers();

        let max_connections = match kind {
            // SQLite performs best with a single writer
            DbKind::Sqlite => 1,
            DbKind::Postgres | DbKind::MySql => 10,
        };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }

        Ok(Self { pool, kind })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    /// Rewrite `?` placeholders for the engine in use.
    pub fn sql(&self, query: &str) -> String {
        rebind(self.kind, query)
    }
}

fn rebind(kind: DbKind, query: &str) -> String {
    if kind != DbKind::Postgres {
        return query.to_string();
    }
    let mut out = String::with_capacity(query.len() + 8);
    let mut n = 0;
    for ch in query.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

fn sqlite_parent(datasource: &str) -> Option<&Path> {
    if datasource.contains(':') {
        return None;
    }
    Path::new(datasource)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
}

/// Build the driver URL, appending TLS parameters when enabled.
fn connection_url(kind: DbKind, config: &DbConfig) -> String {
    let datasource = config.datasource.trim();
    match kind {
        DbKind::Sqlite => {
            if datasource.starts_with("sqlite:") {
                datasource.to_string()
            } else {
                format!("sqlite://{datasource}?mode=rwc")
            }
        }
        DbKind::Postgres | DbKind::MySql => {
            if !config.tls.enabled {
                return datasource.to_string();
            }
            let mut params: Vec<String> = Vec::new();
            let (mode, ca, cert, key) = match kind {
                DbKind::Postgres => ("sslmode=verify-full", "sslrootcert", "sslcert", "sslkey"),
                _ => ("ssl-mode=VERIFY_IDENTITY", "ssl-ca", "ssl-cert", "ssl-key"),
            };
            params.push(mode.to_string());
            if let Some(root) = config.tls.certfiles.first() {
                params.push(format!("{ca}={root}"));
            }
            if !config.tls.client.certfile.is_empty() {
                params.push(format!("{cert}={}", config.tls.client.certfile));
            }
            if !config.tls.client.keyfile.is_empty() {
                params.push(format!("{key}={}", config.tls.client.keyfile));
            }
            let sep = if datasource.contains('?') { '&' } else { '?' };
            format!("{datasource}{sep}{}", params.join("&"))
        }
    }
}

/// Whether an error is a primary/unique key violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(e) if e.is_unique_violation())
}

#[cfg(test)]
pub(crate) async fn test_database() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let db = Database::open(DbKind::Sqlite, &url).await.unwrap();
    (db, dir)
}
