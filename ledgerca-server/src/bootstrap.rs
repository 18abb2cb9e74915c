//! Registry bootstrap from configuration.
//!
//! Runs at every startup and must be safe to repeat: affiliations already
//! present are skipped (unless the policy says otherwise) and identities
//! already registered are left untouched.

use ledgerca_core::quota::{resolve_max_enrollments, QuotaError};
use ledgerca_core::{AffiliationNode, AuditAction, AuditTarget, NewIdentity};

use crate::audit;
use crate::config::{AffiliationPolicy, IdentityConfig, ServerConfig};
use crate::registry::{Insertion, Registry, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("affiliation '{0}' already exists")]
    DuplicateAffiliation(String),
    #[error("identity '{id}': {source}")]
    Quota {
        id: String,
        #[source]
        source: QuotaError,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Counts of what a bootstrap run changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapSummary {
    pub affiliations_created: usize,
    pub identities_created: usize,
}

/// Load the affiliation tree, then the configured identities.
///
/// # Errors
///
/// Returns the first failure; anything inserted before it stays.
pub async fn run(
    registry: &dyn Registry,
    config: &ServerConfig,
) -> Result<BootstrapSummary, BootstrapError> {
    let affiliations_created = match &config.affiliations {
        Some(tree) => load_affiliations(registry, tree, config.affiliation_policy).await?,
        None => 0,
    };
    let identities_created = load_identities(
        registry,
        &config.registry.identities,
        config.registry.max_enrollments,
    )
    .await?;

    let summary = BootstrapSummary {
        affiliations_created,
        identities_created,
    };
    tracing::info!(
        backend = registry.backend(),
        affiliations = summary.affiliations_created,
        identities = summary.identities_created,
        "Registry bootstrap complete"
    );
    Ok(summary)
}

/// Insert every affiliation in `tree`, parents before children.
///
/// # Errors
///
/// Returns `BootstrapError::DuplicateAffiliation` under
/// [`AffiliationPolicy::Reject`] when an affiliation already exists.
pub async fn load_affiliations(
    registry: &dyn Registry,
    tree: &AffiliationNode,
    policy: AffiliationPolicy,
) -> Result<usize, BootstrapError> {
    let mut created = 0;
    for entry in tree.insertion_order(ledgerca_core::affiliation::ROOT) {
        match registry.insert_group(&entry.path, &entry.parent).await? {
            Insertion::Created => {
                tracing::debug!(path = %entry.path, parent = %entry.parent, "Added affiliation");
                created += 1;
            }
            Insertion::AlreadyPresent => match policy {
                AffiliationPolicy::Skip => {
                    tracing::debug!(path = %entry.path, "Affiliation already present");
                }
                AffiliationPolicy::Reject => {
                    return Err(BootstrapError::DuplicateAffiliation(entry.path));
                }
            },
        }
    }
    Ok(created)
}

/// Register each configured identity that is not registered yet.
///
/// # Errors
///
/// Returns `BootstrapError::Quota` if an identity asks for more than the
/// registry allows.
pub async fn load_identities(
    registry: &dyn Registry,
    identities: &[IdentityConfig],
    registry_max: i64,
) -> Result<usize, BootstrapError> {
    let mut created = 0;
    for identity in identities {
        match registry.get_user(&identity.id, &[]).await {
            Ok(_) => {
                tracing::debug!(id = %identity.id, "Identity already registered");
                continue;
            }
            Err(RegistryError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if !registry.supports_insert() {
            tracing::warn!(
                id = %identity.id,
                backend = registry.backend(),
                "Skipping bootstrap identity; registry is read-only"
            );
            continue;
        }

        let max_enrollments = resolve_max_enrollments(registry_max, identity.max_enrollments)
            .map_err(|source| BootstrapError::Quota {
                id: identity.id.clone(),
                source,
            })?;
        let new_identity = NewIdentity {
            id: identity.id.clone(),
            secret: identity.pass.clone(),
            identity_type: identity.identity_type.clone(),
            affiliation: identity.affiliation.clone(),
            attributes: identity.attrs.clone(),
            max_enrollments,
        };

        match registry.insert_user(&new_identity).await {
            Ok(()) => {}
            // Registered by someone else since the lookup
            Err(RegistryError::DuplicateId(_)) => continue,
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            id = %identity.id,
            affiliation = %identity.affiliation,
            max_enrollments,
            "Registered bootstrap identity"
        );
        audit::emit(
            None,
            AuditAction::IdentityBootstrapped,
            AuditTarget::Identity(identity.id.clone()),
        );
        created += 1;
    }
    Ok(created)
}
