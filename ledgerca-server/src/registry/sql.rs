//! Relational registry backend.

use async_trait::async_trait;
use ledgerca_core::{Attributes, Identity, NewIdentity};
use sqlx::any::AnyRow;
use sqlx::Row;

use super::{hash_secret, secret_matches, Insertion, Registry, RegistryError};
use crate::db::{is_unique_violation, Database};

/// Identities, affiliations and enrollment counters in SQL tables.
#[derive(Clone)]
pub struct SqlRegistry {
    db: Database,
}

impl SqlRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn fetch_user(&self, id: &str) -> Result<Option<AnyRow>, RegistryError> {
        let sql = self.db.sql(
            "SELECT id, token, type, affiliation, attributes, state, max_enrollments \
             FROM users WHERE id = ?",
        );
        Ok(sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?)
    }
}

fn identity_from_row(row: &AnyRow, attr_names: &[&str]) -> Result<Identity, RegistryError> {
    let id: String = row.try_get("id")?;
    let raw_attrs: Option<String> = row.try_get("attributes")?;
    let all: Attributes = match raw_attrs.as_deref() {
        None | Some("") => Attributes::new(),
        Some(json) => serde_json::from_str(json).map_err(|_| RegistryError::Corrupt(id.clone()))?,
    };
    let attributes = all
        .into_iter()
        .filter(|(name, _)| attr_names.contains(&name.as_str()))
        .collect();

    Ok(Identity {
        identity_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
        affiliation: row
            .try_get::<Option<String>, _>("affiliation")?
            .unwrap_or_default(),
        attributes,
        max_enrollments: row.try_get("max_enrollments")?,
        enrollments: row.try_get("state")?,
        id,
    })
}

#[async_trait]
impl Registry for SqlRegistry {
    fn backend(&self) -> &'static str {
        "sql"
    }

    async fn get_user(&self, id: &str, attr_names: &[&str]) -> Result<Identity, RegistryError> {
        let row = self
            .fetch_user(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        identity_from_row(&row, attr_names)
    }

    async fn insert_user(&self, identity: &NewIdentity) -> Result<(), RegistryError> {
        let attributes = serde_json::to_string(&identity.attributes)
            .map_err(|_| RegistryError::Corrupt(identity.id.clone()))?;

        let mut tx = self.db.pool().begin().await?;

        if !identity.affiliation.is_empty() {
            let sql = self.db.sql("SELECT name FROM affiliations WHERE name = ?");
            let found = sqlx::query(&sql)
                .bind(&identity.affiliation)
                .fetch_optional(&mut *tx)
                .await?;
            if found.is_none() {
                return Err(RegistryError::MissingAffiliation(identity.affiliation.clone()));
            }
        }

        let sql = self.db.sql(
            "INSERT INTO users (id, token, type, affiliation, attributes, state, max_enrollments) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        );
        let result = sqlx::query(&sql)
            .bind(&identity.id)
            .bind(hash_secret(&identity.secret))
            .bind(&identity.identity_type)
            .bind(&identity.affiliation)
            .bind(attributes)
            .bind(0_i64)
            .bind(identity.max_enrollments)
            .execute(&mut *tx)
            .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(RegistryError::DuplicateId(identity.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_group(&self, path: &str, parent: &str) -> Result<Insertion, RegistryError> {
        if path.is_empty() {
            return Ok(Insertion::AlreadyPresent);
        }
        if !parent.is_empty() && !self.affiliation_exists(parent).await? {
            return Err(RegistryError::MissingParent {
                path: path.to_string(),
                parent: parent.to_string(),
            });
        }

        let sql = self
            .db
            .sql("INSERT INTO affiliations (name, parent_id) VALUES (?, ?)");
        let result = sqlx::query(&sql)
            .bind(path)
            .bind(if parent.is_empty() { None } else { Some(parent) })
            .execute(self.db.pool())
            .await;

        match result {
            Ok(_) => Ok(Insertion::Created),
            Err(e) if is_unique_violation(&e) => Ok(Insertion::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }

    async fn affiliation_exists(&self, path: &str) -> Result<bool, RegistryError> {
        if path.is_empty() {
            return Ok(true);
        }
        let sql = self.db.sql("SELECT name FROM affiliations WHERE name = ?");
        let row = sqlx::query(&sql)
            .bind(path)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    async fn verify_secret(&self, id: &str, secret: &str) -> Result<Identity, RegistryError> {
        let row = self
            .fetch_user(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let stored: String = row.try_get("token")?;
        if !secret_matches(&stored, secret) {
            return Err(RegistryError::InvalidCredentials(id.to_string()));
        }
        identity_from_row(&row, &[])
    }

    async fn record_enrollment(&self, id: &str, cap: i64) -> Result<i64, RegistryError> {
        // Single guarded UPDATE: concurrent enrollments cannot overshoot the cap
        let sql = self.db.sql(
            "UPDATE users SET state = state + 1 WHERE id = ? AND (? = 0 OR state < ?)",
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(cap)
            .bind(cap)
            .execute(self.db.pool())
            .await?;

        let row = self
            .fetch_user(id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::QuotaExceeded {
                id: id.to_string(),
                cap,
            });
        }
        Ok(row.try_get("state")?)
    }

    async fn release_enrollment(&self, id: &str) -> Result<(), RegistryError> {
        let sql = self
            .db
            .sql("UPDATE users SET state = state - 1 WHERE id = ? AND state > 0");
        sqlx::query(&sql).bind(id).execute(self.db.pool()).await?;
        Ok(())
    }
}
