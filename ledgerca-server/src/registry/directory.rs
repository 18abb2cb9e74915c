//! Directory-service registry backend.
//!
//! The directory decides who exists and whose secret is right. Affiliations
//! and enrollment counters live in the local relational store because the
//! directory carries no hierarchy.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, Scope, SearchEntry};
use ledgerca_core::identity::DEFAULT_IDENTITY_TYPE;
use ledgerca_core::quota::INHERIT;
use ledgerca_core::{Attributes, Identity, NewIdentity};
use sqlx::Row;

use super::{Insertion, Registry, RegistryError, SqlRegistry};
use crate::config::LdapConfig;
use crate::db::{is_unique_violation, Database};

/// A directory entry found by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// The two calls the registry needs from a directory service.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Find the entry for `id`, fetching the named attributes.
    async fn lookup(
        &self,
        id: &str,
        attrs: &[&str],
    ) -> Result<Option<DirectoryEntry>, RegistryError>;

    /// Whether `secret` is the password of `dn`.
    async fn bind(&self, dn: &str, secret: &str) -> Result<bool, RegistryError>;
}

/// Registry backed by a [`Directory`] plus local tables.
pub struct DirectoryRegistry<D> {
    directory: D,
    local: SqlRegistry,
    db: Database,
}

impl<D: Directory> DirectoryRegistry<D> {
    pub fn new(directory: D, db: Database) -> Self {
        Self {
            directory,
            local: SqlRegistry::new(db.clone()),
            db,
        }
    }

    async fn enrollments(&self, id: &str) -> Result<i64, RegistryError> {
        let sql = self
            .db
            .sql("SELECT state FROM directory_enrollments WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        match row {
            Some(row) => Ok(row.try_get("state")?),
            None => Ok(0),
        }
    }

    async fn ensure_counter(&self, id: &str) -> Result<(), RegistryError> {
        let sql = self
            .db
            .sql("INSERT INTO directory_enrollments (id, state) VALUES (?, ?)");
        match sqlx::query(&sql)
            .bind(id)
            .bind(0_i64)
            .execute(self.db.pool())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn identity(
        &self,
        id: &str,
        entry: DirectoryEntry,
        attr_names: &[&str],
    ) -> Result<Identity, RegistryError> {
        let attributes: Attributes = entry
            .attributes
            .into_iter()
            .filter(|(name, _)| attr_names.contains(&name.as_str()))
            .map(|(name, values)| (name, values.join(",")))
            .collect();

        Ok(Identity {
            id: id.to_string(),
            identity_type: DEFAULT_IDENTITY_TYPE.to_string(),
            affiliation: String::new(),
            attributes,
            max_enrollments: INHERIT,
            enrollments: self.enrollments(id).await?,
        })
    }
}

#[async_trait]
impl<D: Directory> Registry for DirectoryRegistry<D> {
    fn backend(&self) -> &'static str {
        "directory"
    }

    fn supports_insert(&self) -> bool {
        false
    }

    async fn get_user(&self, id: &str, attr_names: &[&str]) -> Result<Identity, RegistryError> {
        let entry = self
            .directory
            .lookup(id, attr_names)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.identity(id, entry, attr_names).await
    }

    async fn insert_user(&self, _identity: &NewIdentity) -> Result<(), RegistryError> {
        Err(RegistryError::Unsupported(self.backend()))
    }

    async fn insert_group(&self, path: &str, parent: &str) -> Result<Insertion, RegistryError> {
        self.local.insert_group(path, parent).await
    }

    async fn affiliation_exists(&self, path: &str) -> Result<bool, RegistryError> {
        self.local.affiliation_exists(path).await
    }

    async fn verify_secret(&self, id: &str, secret: &str) -> Result<Identity, RegistryError> {
        let entry = self
            .directory
            .lookup(id, &[])
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if secret.is_empty() || !self.directory.bind(&entry.dn, secret).await? {
            return Err(RegistryError::InvalidCredentials(id.to_string()));
        }
        self.identity(id, entry, &[]).await
    }

    async fn record_enrollment(&self, id: &str, cap: i64) -> Result<i64, RegistryError> {
        self.ensure_counter(id).await?;
        let sql = self.db.sql(
            "UPDATE directory_enrollments SET state = state + 1 \
             WHERE id = ? AND (? = 0 OR state < ?)",
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(cap)
            .bind(cap)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::QuotaExceeded {
                id: id.to_string(),
                cap,
            });
        }
        self.enrollments(id).await
    }

    async fn release_enrollment(&self, id: &str) -> Result<(), RegistryError> {
        let sql = self
            .db
            .sql("UPDATE directory_enrollments SET state = state - 1 WHERE id = ? AND state > 0");
        sqlx::query(&sql).bind(id).execute(self.db.pool()).await?;
        Ok(())
    }
}

/// LDAP implementation of [`Directory`].
pub struct LdapDirectory {
    config: LdapConfig,
}

fn ldap_err(e: ldap3::LdapError) -> RegistryError {
    RegistryError::Directory(e.to_string())
}

impl LdapDirectory {
    /// Connect once to prove the directory is reachable.
    ///
    /// # Errors
    ///
    /// Fails if the server cannot be reached or the service bind is refused;
    /// both are fatal at startup.
    pub async fn connect(config: &LdapConfig) -> Result<Self, RegistryError> {
        let directory = Self {
            config: config.clone(),
        };
        let mut ldap = directory.session().await?;
        let _ = ldap.unbind().await;
        tracing::info!(url = %config.url, base_dn = %config.base_dn, "Connected to LDAP directory");
        Ok(directory)
    }

    async fn open(&self) -> Result<Ldap, RegistryError> {
        let (conn, ldap) = LdapConnAsync::new(&self.config.url)
            .await
            .map_err(ldap_err)?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(error = %e, "LDAP connection error");
            }
        });
        Ok(ldap)
    }

    /// Open a connection bound as the service account (if configured).
    async fn session(&self) -> Result<Ldap, RegistryError> {
        let mut ldap = self.open().await?;

        if let (Some(dn), Some(password)) = (&self.config.bind_dn, &self.config.bind_password) {
            ldap.simple_bind(dn, password)
                .await
                .map_err(ldap_err)?
                .success()
                .map_err(ldap_err)?;
        }
        Ok(ldap)
    }

    fn filter(&self, id: &str) -> String {
        self.config.user_filter.replace("{id}", &ldap_escape(id))
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    async fn lookup(
        &self,
        id: &str,
        attrs: &[&str],
    ) -> Result<Option<DirectoryEntry>, RegistryError> {
        let mut ldap = self.session().await?;
        // "1.1" asks for no attributes
        let requested: Vec<&str> = if attrs.is_empty() { vec!["1.1"] } else { attrs.to_vec() };

        let (entries, _) = ldap
            .search(&self.config.base_dn, Scope::Subtree, &self.filter(id), requested)
            .await
            .map_err(ldap_err)?
            .success()
            .map_err(ldap_err)?;
        let _ = ldap.unbind().await;

        Ok(entries.into_iter().next().map(|entry| {
            let entry = SearchEntry::construct(entry);
            DirectoryEntry {
                dn: entry.dn,
                attributes: entry.attrs.into_iter().collect(),
            }
        }))
    }

    async fn bind(&self, dn: &str, secret: &str) -> Result<bool, RegistryError> {
        let mut ldap = self.open().await?;

        let result = ldap.simple_bind(dn, secret).await.map_err(ldap_err)?;
        let _ = ldap.unbind().await;
        Ok(result.rc == 0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use super::*;

    /// In-memory directory keyed by id.
    #[derive(Default)]
    pub struct MemoryDirectory {
        pub entries: HashMap<String, (DirectoryEntry, String)>,
    }

    impl MemoryDirectory {
        pub fn with_user(mut self, id: &str, secret: &str, attrs: &[(&str, &str)]) -> Self {
            let entry = DirectoryEntry {
                dn: format!("uid={id},ou=people,dc=example,dc=com"),
                attributes: attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
                    .collect(),
            };
            self.entries.insert(id.to_string(), (entry, secret.to_string()));
            self
        }
    }

    #[async_trait]
    impl Directory for MemoryDirectory {
        async fn lookup(
            &self,
            id: &str,
            _attrs: &[&str],
        ) -> Result<Option<DirectoryEntry>, RegistryError> {
            Ok(self.entries.get(id).map(|(entry, _)| entry.clone()))
        }

        async fn bind(&self, dn: &str, secret: &str) -> Result<bool, RegistryError> {
            Ok(self
                .entries
                .values()
                .any(|(entry, s)| entry.dn == dn && s == secret))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryDirectory;
    use super::*;
    use crate::db::test_database;

    async fn registry() -> (DirectoryRegistry<MemoryDirectory>, tempfile::TempDir) {
        let (db, dir) = test_database().await;
        let directory = MemoryDirectory::default().with_user(
            "carol",
            "carolpw",
            &[("mail", "carol@example.com")],
        );
        (DirectoryRegistry::new(directory, db), dir)
    }

    #[tokio::test]
    async fn directory_user_defaults() {
        let (registry, _dir) = registry().await;

        let carol = registry.get_user("carol", &["mail"]).await.unwrap();

        assert_eq!(carol.identity_type, "user");
        assert_eq!(carol.affiliation, "");
        assert_eq!(carol.max_enrollments, -1);
        assert_eq!(carol.attribute("mail"), Some("carol@example.com"));
        assert!(registry.get_user("carol", &[]).await.unwrap().attributes.is_empty());
    }

    #[tokio::test]
    async fn directory_insert_unsupported() {
        let (registry, _dir) = registry().await;
        let identity = NewIdentity {
            id: "dave".into(),
            secret: "davepw".into(),
            identity_type: "user".into(),
            affiliation: String::new(),
            attributes: Attributes::new(),
            max_enrollments: -1,
        };

        assert!(!registry.supports_insert());
        assert!(matches!(
            registry.insert_user(&identity).await,
            Err(RegistryError::Unsupported("directory"))
        ));
    }

    #[tokio::test]
    async fn directory_bind_checks_secret() {
        let (registry, _dir) = registry().await;

        assert!(registry.verify_secret("carol", "carolpw").await.is_ok());
        assert!(matches!(
            registry.verify_secret("carol", "nope").await,
            Err(RegistryError::InvalidCredentials(_))
        ));
        assert!(matches!(
            registry.verify_secret("nobody", "x").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn directory_counters_are_local() {
        let (registry, _dir) = registry().await;

        assert_eq!(registry.record_enrollment("carol", 1).await.unwrap(), 1);
        assert!(matches!(
            registry.record_enrollment("carol", 1).await,
            Err(RegistryError::QuotaExceeded { cap: 1, .. })
        ));
        assert_eq!(registry.get_user("carol", &[]).await.unwrap().enrollments, 1);
    }

    #[tokio::test]
    async fn directory_affiliations_are_local() {
        let (registry, _dir) = registry().await;

        assert_eq!(
            registry.insert_group("org1", "").await.unwrap(),
            Insertion::Created
        );
        assert!(registry.affiliation_exists("org1").await.unwrap());
    }
}
