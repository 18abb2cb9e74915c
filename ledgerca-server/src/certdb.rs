//! Issued-certificate store.
//!
//! One row per signed certificate, keyed by `(serial, aki)`. Rows are never
//! deleted; revocation is the only update.

use ledgerca_core::{CertStatus, CertificateRecord};
use sqlx::any::AnyRow;
use sqlx::Row;

use crate::db::{is_unique_violation, Database};

/// Errors from certificate store operations.
#[derive(Debug, thiserror::Error)]
pub enum CertStoreError {
    #[error("certificate {serial}/{aki} is already recorded")]
    Duplicate { serial: String, aki: String },
    #[error("corrupt certificate record {serial}/{aki}")]
    Corrupt { serial: String, aki: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

const COLUMNS: &str =
    "id, serial_number, authority_key_identifier, status, reason, expiry, revoked_at, pem";

#[derive(Clone)]
pub struct CertStore {
    db: Database,
}

impl CertStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a freshly signed certificate.
    pub async fn insert(&self, record: &CertificateRecord) -> Result<(), CertStoreError> {
        let sql = self.db.sql(&format!(
            "INSERT INTO certificates ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ));
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.serial)
            .bind(&record.aki)
            .bind(record.status.as_str())
            .bind(record.reason)
            .bind(record.expiry)
            .bind(record.revoked_at)
            .bind(&record.pem)
            .execute(self.db.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CertStoreError::Duplicate {
                serial: record.serial.clone(),
                aki: record.aki.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(
        &self,
        serial: &str,
        aki: &str,
    ) -> Result<Option<CertificateRecord>, CertStoreError> {
        let sql = self.db.sql(&format!(
            "SELECT {COLUMNS} FROM certificates \
             WHERE serial_number = ? AND authority_key_identifier = ?"
        ));
        let row = sqlx::query(&sql)
            .bind(serial)
            .bind(aki)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All certificates issued to `id`, oldest first.
    pub async fn list_by_owner(&self, id: &str) -> Result<Vec<CertificateRecord>, CertStoreError> {
        let sql = self.db.sql(&format!(
            "SELECT {COLUMNS} FROM certificates WHERE id = ? ORDER BY expiry"
        ));
        let rows = sqlx::query(&sql)
            .bind(id)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Mark a valid certificate revoked. Returns false if it was not valid.
    pub async fn revoke(
        &self,
        serial: &str,
        aki: &str,
        reason: i64,
        revoked_at: i64,
    ) -> Result<bool, CertStoreError> {
        let sql = self.db.sql(
            "UPDATE certificates SET status = ?, reason = ?, revoked_at = ? \
             WHERE serial_number = ? AND authority_key_identifier = ? AND status = ?",
        );
        let result = sqlx::query(&sql)
            .bind(CertStatus::Revoked.as_str())
            .bind(reason)
            .bind(revoked_at)
            .bind(serial)
            .bind(aki)
            .bind(CertStatus::Valid.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_by_owner(&self, id: &str) -> Result<i64, CertStoreError> {
        let sql = self.db.sql("SELECT COUNT(*) AS n FROM certificates WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn record_from_row(row: &AnyRow) -> Result<CertificateRecord, CertStoreError> {
    let serial: String = row.try_get("serial_number")?;
    let aki: String = row.try_get("authority_key_identifier")?;
    let raw_status: String = row.try_get("status")?;
    let Some(status) = CertStatus::parse(&raw_status) else {
        return Err(CertStoreError::Corrupt { serial, aki });
    };

    Ok(CertificateRecord {
        id: row.try_get("id")?,
        status,
        reason: row.try_get("reason")?,
        expiry: row.try_get("expiry")?,
        revoked_at: row.try_get("revoked_at")?,
        pem: row.try_get("pem")?,
        serial,
        aki,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_database;

    fn record(id: &str, serial: &str) -> CertificateRecord {
        CertificateRecord {
            id: id.into(),
            serial: serial.into(),
            aki: "a1b2".into(),
            status: CertStatus::Valid,
            reason: 0,
            expiry: 1_900_000_000,
            revoked_at: 0,
            pem: "-----BEGIN CERTIFICATE-----".into(),
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let (db, _dir) = test_database().await;
        let store = CertStore::new(db);
        store.insert(&record("alice", "1001")).await.unwrap();

        let found = store.get("1001", "a1b2").await.unwrap().unwrap();

        assert_eq!(found, record("alice", "1001"));
        assert!(store.get("1001", "ffff").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_serial_and_aki_rejected() {
        let (db, _dir) = test_database().await;
        let store = CertStore::new(db);
        store.insert(&record("alice", "1001")).await.unwrap();

        let result = store.insert(&record("bob", "1001")).await;

        assert!(matches!(result, Err(CertStoreError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn revoke_only_once() {
        let (db, _dir) = test_database().await;
        let store = CertStore::new(db);
        store.insert(&record("alice", "1001")).await.unwrap();

        assert!(store.revoke("1001", "a1b2", 1, 1_800_000_000).await.unwrap());
        assert!(!store.revoke("1001", "a1b2", 1, 1_800_000_001).await.unwrap());

        let found = store.get("1001", "a1b2").await.unwrap().unwrap();
        assert_eq!(found.status, CertStatus::Revoked);
        assert_eq!(found.reason, 1);
        assert_eq!(found.revoked_at, 1_800_000_000);
    }

    #[tokio::test]
    async fn list_and_count_by_owner() {
        let (db, _dir) = test_database().await;
        let store = CertStore::new(db);
        store.insert(&record("alice", "1")).await.unwrap();
        store.insert(&record("alice", "2")).await.unwrap();
        store.insert(&record("bob", "3")).await.unwrap();

        assert_eq!(store.list_by_owner("alice").await.unwrap().len(), 2);
        assert_eq!(store.count_by_owner("alice").await.unwrap(), 2);
        assert_eq!(store.count_by_owner("carol").await.unwrap(), 0);
    }
}
