//! Enrollment engine.
//!
//! Issuing a certificate is reserve, sign, persist:
//! 1. reserve one enrollment against the identity's cap (atomic in the store)
//! 2. sign the request
//! 3. record the serial/AKI binding in the certificate store
//!
//! A failure in step 2 or 3 releases the reservation. A certificate that was
//! signed but could not be recorded is withheld from the caller.

use std::sync::Arc;
use std::time::Duration;

use ledgerca_auth::CertId;
use ledgerca_core::identity::attrs;
use ledgerca_core::quota::{check_enrollment, resolve_max_enrollments, QuotaError};
use ledgerca_core::{
    Attributes, AuditAction, CertStatus, CertificateRecord, Identity, RevocationReason,
};

use super::signer::{CertSigner, SignError, SignRequest, SignedCertificate};
use crate::audit;
use crate::certdb::{CertStore, CertStoreError};
use crate::registry::{Registry, RegistryError};

/// Profile used for transaction certificates when configured.
pub const TCERT_PROFILE: &str = "tcert";
/// Transaction certificate lifetime when no `tcert` profile exists.
pub const DEFAULT_TCERT_VALIDITY: Duration = Duration::from_secs(3600);

/// Errors from issuing certificates.
#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Sign(#[from] SignError),
    #[error(transparent)]
    Store(#[from] CertStoreError),
    /// Signed but not recorded; the certificate was not handed out.
    #[error("certificate {serial}/{aki} was signed but could not be recorded")]
    Unrecorded { serial: String, aki: String },
    #[error("{0}")]
    InvalidRequest(String),
}

/// An enroll or reenroll request.
#[derive(Debug, Clone, Default)]
pub struct EnrollRequest {
    pub csr_pem: String,
    pub profile: Option<String>,
    pub hosts: Vec<String>,
}

/// A transaction certificate batch request.
#[derive(Debug, Clone, Default)]
pub struct TcertRequest {
    pub csrs: Vec<String>,
    /// Attributes of the caller to embed. The caller record passed to
    /// [`EnrollmentEngine::issue_tcerts`] must carry them.
    pub attr_names: Vec<String>,
    pub validity: Option<Duration>,
}

/// A certificate handed back to a caller.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub pem: String,
    pub id: CertId,
    pub ca_chain: String,
}

#[derive(Debug, Clone, Copy)]
enum Issuance {
    Enroll,
    Reenroll,
}

impl Issuance {
    fn action(self) -> AuditAction {
        match self {
            Self::Enroll => AuditAction::CertificateIssued,
            Self::Reenroll => AuditAction::CertificateReenrolled,
        }
    }
}

/// Issues certificates and keeps the registry and certificate store in step.
pub struct EnrollmentEngine {
    registry: Arc<dyn Registry>,
    certs: CertStore,
    signer: CertSigner,
    ca_chain: String,
    registry_max: i64,
}

impl EnrollmentEngine {
    pub fn new(
        registry: Arc<dyn Registry>,
        certs: CertStore,
        signer: CertSigner,
        ca_chain: String,
        registry_max: i64,
    ) -> Self {
        Self {
            registry,
            certs,
            signer,
            ca_chain,
            registry_max,
        }
    }

    pub fn ca_chain(&self) -> &str {
        &self.ca_chain
    }

    /// Issue an enrollment certificate to `identity`.
    ///
    /// # Errors
    ///
    /// Returns `EnrollError::Quota` once the identity's cap is reached;
    /// other variants for signing or storage failures.
    pub async fn enroll(
        &self,
        identity: &Identity,
        request: &EnrollRequest,
    ) -> Result<IssuedCertificate, EnrollError> {
        self.issue_counted(identity, request, Issuance::Enroll).await
    }

    /// Issue a fresh certificate to an already enrolled caller.
    ///
    /// # Errors
    ///
    /// Same as [`enroll`](Self::enroll).
    pub async fn reenroll(
        &self,
        identity: &Identity,
        request: &EnrollRequest,
    ) -> Result<IssuedCertificate, EnrollError> {
        self.issue_counted(identity, request, Issuance::Reenroll).await
    }

    async fn issue_counted(
        &self,
        identity: &Identity,
        request: &EnrollRequest,
        kind: Issuance,
    ) -> Result<IssuedCertificate, EnrollError> {
        let cap = resolve_max_enrollments(self.registry_max, identity.max_enrollments)?;
        check_enrollment(identity.enrollments, cap)?;

        let count = match self.registry.record_enrollment(&identity.id, cap).await {
            Ok(count) => count,
            Err(RegistryError::QuotaExceeded { cap, .. }) => {
                return Err(QuotaError::Exhausted { cap }.into());
            }
            Err(e) => return Err(e.into()),
        };

        let sign_request = SignRequest {
            csr_pem: request.csr_pem.clone(),
            enrollment_id: identity.id.clone(),
            identity_type: identity.identity_type.clone(),
            hosts: request.hosts.clone(),
            profile: request.profile.clone(),
            attributes: identity_attributes(identity),
        };
        let signed = match self.signer.sign(&sign_request).await {
            Ok(signed) => signed,
            Err(e) => {
                self.release(&identity.id).await;
                tracing::warn!(id = %identity.id, error = %e, "Signing failed");
                return Err(e.into());
            }
        };

        if let Err(e) = self.persist(&identity.id, &signed).await {
            self.release(&identity.id).await;
            return Err(e);
        }

        tracing::info!(
            id = %identity.id,
            serial = %signed.info.id.serial,
            enrollments = count,
            cap,
            "Issued enrollment certificate"
        );
        audit::emit(
            Some(&identity.id),
            kind.action(),
            audit::certificate(&signed.info.id.serial, &signed.info.id.aki),
        );
        Ok(self.issued(signed))
    }

    /// Issue one short-lived certificate per request. Not counted against
    /// the enrollment cap.
    ///
    /// # Errors
    ///
    /// Returns `EnrollError::InvalidRequest` if the batch is empty or the
    /// caller lacks a requested attribute. No certificate from a failed
    /// batch is left valid in the store.
    pub async fn issue_tcerts(
        &self,
        identity: &Identity,
        request: &TcertRequest,
    ) -> Result<Vec<IssuedCertificate>, EnrollError> {
        if request.csrs.is_empty() {
            return Err(EnrollError::InvalidRequest(
                "no certificate requests supplied".into(),
            ));
        }

        let mut attributes = identity_attributes(identity);
        for name in &request.attr_names {
            let value = identity.attribute(name).ok_or_else(|| {
                EnrollError::InvalidRequest(format!(
                    "identity '{}' has no attribute '{}'",
                    identity.id, name
                ))
            })?;
            attributes.insert(name.clone(), value.to_string());
        }

        let policy = self.signer.policy();
        let (profile_name, mut profile) = if policy.has_profile(TCERT_PROFILE) {
            let profile = policy.profile(Some(TCERT_PROFILE))?.clone();
            (Some(TCERT_PROFILE.to_string()), profile)
        } else {
            let profile = policy.profile(None)?.clone();
            (None, profile.with_expiry(DEFAULT_TCERT_VALIDITY))
        };
        if let Some(validity) = request.validity {
            profile.expiry = profile.expiry.min(validity);
        }

        // The batch is all or nothing: sign every request before recording any.
        let mut batch = Vec::with_capacity(request.csrs.len());
        for csr in &request.csrs {
            let sign_request = SignRequest {
                csr_pem: csr.clone(),
                enrollment_id: identity.id.clone(),
                identity_type: identity.identity_type.clone(),
                hosts: Vec::new(),
                profile: profile_name.clone(),
                attributes: attributes.clone(),
            };
            batch.push(self.signer.sign_with(&sign_request, &profile).await?);
        }

        for (recorded, signed) in batch.iter().enumerate() {
            if let Err(e) = self.persist(&identity.id, signed).await {
                self.rollback(&identity.id, &batch[..recorded]).await;
                return Err(e);
            }
        }

        for signed in &batch {
            audit::emit(
                Some(&identity.id),
                AuditAction::TcertIssued,
                audit::certificate(&signed.info.id.serial, &signed.info.id.aki),
            );
        }
        tracing::info!(id = %identity.id, count = batch.len(), "Issued transaction certificates");
        Ok(batch.into_iter().map(|signed| self.issued(signed)).collect())
    }

    /// Revoke records written for a batch that was not handed out.
    async fn rollback(&self, owner: &str, recorded: &[SignedCertificate]) {
        let revoked_at = chrono::Utc::now().timestamp();
        for signed in recorded {
            let id = &signed.info.id;
            match self
                .certs
                .revoke(&id.serial, &id.aki, RevocationReason::CessationOfOperation.code(), revoked_at)
                .await
            {
                Ok(_) => tracing::warn!(
                    %owner,
                    serial = %id.serial,
                    "Revoked certificate from an incomplete batch"
                ),
                Err(e) => tracing::error!(
                    %owner,
                    serial = %id.serial,
                    error = %e,
                    "Failed to revoke certificate from an incomplete batch"
                ),
            }
        }
    }

    async fn persist(&self, owner: &str, signed: &SignedCertificate) -> Result<(), EnrollError> {
        let record = CertificateRecord {
            id: owner.to_string(),
            serial: signed.info.id.serial.clone(),
            aki: signed.info.id.aki.clone(),
            status: CertStatus::Valid,
            reason: 0,
            expiry: signed.info.not_after,
            revoked_at: 0,
            pem: signed.pem.clone(),
        };

        if let Err(e) = self.certs.insert(&record).await {
            tracing::error!(
                id = %owner,
                serial = %record.serial,
                aki = %record.aki,
                error = %e,
                "Signed certificate could not be recorded; withholding it"
            );
            audit::record(
                &ledgerca_core::AuditEvent::new(
                    Some(owner.to_string()),
                    AuditAction::IssuanceWithheld,
                    audit::certificate(&record.serial, &record.aki),
                )
                .with_metadata("error", e.to_string()),
            );
            return Err(EnrollError::Unrecorded {
                serial: record.serial,
                aki: record.aki,
            });
        }
        Ok(())
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.registry.release_enrollment(id).await {
            tracing::error!(%id, error = %e, "Failed to release enrollment reservation");
        }
    }

    fn issued(&self, signed: SignedCertificate) -> IssuedCertificate {
        IssuedCertificate {
            pem: signed.pem,
            id: signed.info.id,
            ca_chain: self.ca_chain.clone(),
        }
    }
}

fn identity_attributes(identity: &Identity) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert(attrs::ENROLLMENT_ID.into(), identity.id.clone());
    attributes.insert(attrs::TYPE.into(), identity.identity_type.clone());
    attributes.insert(attrs::AFFILIATION.into(), identity.affiliation.clone());
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::keymaterial::{ensure_key_material, test_files, CaKeyMaterial};
    use crate::ca::signer::{decode_attributes, test_support::csr_pem};
    use crate::config::{CsrTemplate, SigningConfig};
    use crate::db::{test_database, Database};
    use crate::registry::SqlRegistry;
    use ledgerca_core::NewIdentity;

    struct Fixture {
        engine: Arc<EnrollmentEngine>,
        registry: Arc<SqlRegistry>,
        certs: CertStore,
        db: Database,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn fixture(registry_max: i64, identity_max: i64) -> Fixture {
        let (db, db_dir) = test_database().await;
        let registry = Arc::new(SqlRegistry::new(db.clone()));
        registry.insert_group("org1", "").await.unwrap();
        let mut attributes = Attributes::new();
        attributes.insert("app.role".into(), "auditor".into());
        registry
            .insert_user(&NewIdentity {
                id: "alice".into(),
                secret: "alicepw".into(),
                identity_type: "user".into(),
                affiliation: "org1".into(),
                attributes,
                max_enrollments: identity_max,
            })
            .await
            .unwrap();

        let ca_dir = tempfile::tempdir().unwrap();
        let files = test_files(ca_dir.path());
        ensure_key_material(&files, &CsrTemplate::default(), false).unwrap();
        let ca = Arc::new(CaKeyMaterial::load(&files).unwrap());
        let signer = CertSigner::new(ca.clone(), &SigningConfig::default(), None).unwrap();
        let certs = CertStore::new(db.clone());
        let engine = Arc::new(EnrollmentEngine::new(
            registry.clone(),
            certs.clone(),
            signer,
            ca.cert_pem().to_string(),
            registry_max,
        ));

        Fixture {
            engine,
            registry,
            certs,
            db,
            _dirs: (db_dir, ca_dir),
        }
    }

    impl Fixture {
        async fn alice(&self, attr_names: &[&str]) -> Identity {
            self.registry.get_user("alice", attr_names).await.unwrap()
        }
    }

    fn request() -> EnrollRequest {
        EnrollRequest {
            csr_pem: csr_pem().1,
            ..EnrollRequest::default()
        }
    }

    #[tokio::test]
    async fn enroll_records_certificate() {
        let fx = fixture(0, -1).await;

        let issued = fx.engine.enroll(&fx.alice(&[]).await, &request()).await.unwrap();

        let record = fx
            .certs
            .get(&issued.id.serial, &issued.id.aki)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.id, "alice");
        assert_eq!(record.status, CertStatus::Valid);
        assert_eq!(record.pem, issued.pem);
        assert!(issued.ca_chain.contains("BEGIN CERTIFICATE"));
        assert_eq!(fx.alice(&[]).await.enrollments, 1);
    }

    #[tokio::test]
    async fn cap_of_two_rejects_third() {
        let fx = fixture(0, 2).await;

        fx.engine.enroll(&fx.alice(&[]).await, &request()).await.unwrap();
        fx.engine.reenroll(&fx.alice(&[]).await, &request()).await.unwrap();
        let third = fx.engine.enroll(&fx.alice(&[]).await, &request()).await;

        assert!(matches!(
            third,
            Err(EnrollError::Quota(QuotaError::Exhausted { cap: 2 }))
        ));
        assert_eq!(fx.alice(&[]).await.enrollments, 2);
        assert_eq!(fx.certs.count_by_owner("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_identity_snapshot_still_capped() {
        let fx = fixture(0, 1).await;
        let snapshot = fx.alice(&[]).await;

        fx.engine.enroll(&snapshot, &request()).await.unwrap();
        let second = fx.engine.enroll(&snapshot, &request()).await;

        assert!(matches!(second, Err(EnrollError::Quota(_))));
        assert_eq!(fx.certs.count_by_owner("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn registry_max_applies_to_inheriting_identity() {
        let fx = fixture(1, -1).await;

        fx.engine.enroll(&fx.alice(&[]).await, &request()).await.unwrap();
        let second = fx.engine.enroll(&fx.alice(&[]).await, &request()).await;

        assert!(matches!(second, Err(EnrollError::Quota(_))));
    }

    #[tokio::test]
    async fn signing_failure_releases_reservation() {
        let fx = fixture(0, 2).await;
        let bad = EnrollRequest {
            csr_pem: "garbage".into(),
            ..EnrollRequest::default()
        };

        let result = fx.engine.enroll(&fx.alice(&[]).await, &bad).await;

        assert!(matches!(result, Err(EnrollError::Sign(_))));
        assert_eq!(fx.alice(&[]).await.enrollments, 0);
    }

    #[tokio::test]
    async fn unrecorded_certificate_is_withheld() {
        let fx = fixture(0, 2).await;
        sqlx::query("DROP TABLE certificates")
            .execute(fx.db.pool())
            .await
            .unwrap();

        let result = fx.engine.enroll(&fx.alice(&[]).await, &request()).await;

        assert!(matches!(result, Err(EnrollError::Unrecorded { .. })));
        assert_eq!(fx.alice(&[]).await.enrollments, 0);
    }

    #[tokio::test]
    async fn tcerts_carry_requested_attributes_and_skip_quota() {
        let fx = fixture(0, 1).await;
        let alice = fx.alice(&["app.role"]).await;
        let request = TcertRequest {
            csrs: vec![csr_pem().1, csr_pem().1],
            attr_names: vec!["app.role".into()],
            validity: None,
        };

        let issued = fx.engine.issue_tcerts(&alice, &request).await.unwrap();

        assert_eq!(issued.len(), 2);
        assert_eq!(fx.alice(&[]).await.enrollments, 0);
        let der = ledgerca_auth::decode_certificate(issued[0].pem.as_bytes()).unwrap();
        let info = ledgerca_auth::inspect(&der).unwrap();
        assert!(info.not_after - info.not_before <= 3600);
        let attrs = decode_attributes(info.attributes.as_deref().unwrap()).unwrap();
        assert_eq!(attrs.get("app.role").map(String::as_str), Some("auditor"));
        assert_eq!(attrs.get("hf.EnrollmentID").map(String::as_str), Some("alice"));
    }

    #[tokio::test]
    async fn tcert_for_missing_attribute_rejected() {
        let fx = fixture(0, 0).await;
        let request = TcertRequest {
            csrs: vec![csr_pem().1],
            attr_names: vec!["app.clearance".into()],
            validity: None,
        };

        let result = fx.engine.issue_tcerts(&fx.alice(&[]).await, &request).await;

        assert!(matches!(result, Err(EnrollError::InvalidRequest(_))));
        assert_eq!(fx.certs.count_by_owner("alice").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enrollments_stop_at_cap() {
        let fx = fixture(0, 2).await;
        let snapshot = fx.alice(&[]).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let engine = fx.engine.clone();
            let snapshot = snapshot.clone();
            tasks.spawn(async move { engine.enroll(&snapshot, &request()).await });
        }
        let mut issued = 0;
        let mut capped = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => issued += 1,
                Err(EnrollError::Quota(_)) => capped += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(issued, 2);
        assert_eq!(capped, 4);
        assert_eq!(fx.alice(&[]).await.enrollments, 2);
        assert_eq!(fx.certs.count_by_owner("alice").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn tcert_batch_with_bad_request_records_nothing() {
        let fx = fixture(0, 0).await;
        let request = TcertRequest {
            csrs: vec![csr_pem().1, "garbage".into()],
            attr_names: Vec::new(),
            validity: None,
        };

        let result = fx.engine.issue_tcerts(&fx.alice(&[]).await, &request).await;

        assert!(matches!(result, Err(EnrollError::Sign(_))));
        assert_eq!(fx.certs.count_by_owner("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tcert_batch_revokes_recorded_certificates_on_store_failure() {
        let fx = fixture(0, 0).await;
        sqlx::query(
            "CREATE TRIGGER one_certificate BEFORE INSERT ON certificates \
             WHEN (SELECT COUNT(*) FROM certificates) >= 1 \
             BEGIN SELECT RAISE(ABORT, 'store full'); END",
        )
        .execute(fx.db.pool())
        .await
        .unwrap();
        let request = TcertRequest {
            csrs: vec![csr_pem().1, csr_pem().1],
            attr_names: Vec::new(),
            validity: None,
        };

        let result = fx.engine.issue_tcerts(&fx.alice(&[]).await, &request).await;

        assert!(matches!(result, Err(EnrollError::Unrecorded { .. })));
        let records = fx.certs.list_by_owner("alice").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, CertStatus::Revoked);
        assert_eq!(
            records[0].reason,
            RevocationReason::CessationOfOperation.code()
        );
    }
}
