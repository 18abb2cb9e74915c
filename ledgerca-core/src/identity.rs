//! Identity records and attribute-based authorization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::affiliation::is_within;

/// Identity attributes. Using BTreeMap for deterministic serialization order.
pub type Attributes = BTreeMap<String, String>;

/// Well-known attribute names.
pub mod attrs {
    /// Comma-separated identity types the holder may register.
    pub const REGISTRAR_ROLES: &str = "hf.Registrar.Roles";
    /// Comma-separated roles the holder may grant as `hf.Registrar.Roles`.
    pub const DELEGATE_ROLES: &str = "hf.Registrar.DelegateRoles";
    /// `"true"` if the holder may revoke certificates.
    pub const REVOKER: &str = "hf.Revoker";

    pub const ENROLLMENT_ID: &str = "hf.EnrollmentID";
    pub const TYPE: &str = "hf.Type";
    pub const AFFILIATION: &str = "hf.Affiliation";
}

/// Identity type assumed when none is given.
pub const DEFAULT_IDENTITY_TYPE: &str = "user";

/// An identity as read back from the registry.
///
/// Never carries the enrollment secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(rename = "type")]
    pub identity_type: String,
    pub affiliation: String,
    /// Only the attributes the lookup asked for.
    pub attributes: Attributes,
    /// -1 inherits the registry default, 0 is unlimited, N is a hard cap.
    pub max_enrollments: i64,
    /// Number of enrollments recorded so far.
    pub enrollments: i64,
}

impl Identity {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Whether the attribute holds `value` in its comma-separated list.
    pub fn has_role(&self, attribute: &str, value: &str) -> bool {
        self.attribute(attribute)
            .map(|list| split_roles(list).any(|role| role == value))
            .unwrap_or(false)
    }

    pub fn is_revoker(&self) -> bool {
        self.attribute(attrs::REVOKER).map(is_true).unwrap_or(false)
    }
}

/// An identity to be inserted into the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct NewIdentity {
    pub id: String,
    pub secret: String,
    pub identity_type: String,
    pub affiliation: String,
    pub attributes: Attributes,
    /// Already resolved against the registry maximum.
    pub max_enrollments: i64,
}

impl std::fmt::Debug for NewIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewIdentity")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("identity_type", &self.identity_type)
            .field("affiliation", &self.affiliation)
            .field("attributes", &self.attributes)
            .field("max_enrollments", &self.max_enrollments)
            .finish()
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthzDecision {
    /// Action is permitted.
    Allow,
    /// Action is denied with explanation.
    Deny {
        /// Human-readable reason for denial.
        reason: String,
    },
}

impl AuthzDecision {
    pub fn allow() -> Self {
        Self::Allow
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Split a comma-separated role list, ignoring blanks.
pub fn split_roles(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|r| !r.is_empty())
}

/// Decide whether `registrar` may register an identity of `identity_type`
/// under `affiliation` carrying `attributes`.
///
/// The registrar needs the type in `hf.Registrar.Roles`, the target
/// affiliation must sit inside the registrar's own subtree. Granted
/// privileges are bounded by the registrar's own: `hf.Registrar.Roles` and
/// `hf.Registrar.DelegateRoles` must be subsets of its
/// `hf.Registrar.DelegateRoles`, and only a revoker may grant `hf.Revoker`.
pub fn authorize_register(
    registrar: &Identity,
    identity_type: &str,
    affiliation: &str,
    attributes: &Attributes,
) -> AuthzDecision {
    if !registrar.has_role(attrs::REGISTRAR_ROLES, identity_type) {
        return AuthzDecision::deny(format!(
            "'{}' may not register identities of type '{}'",
            registrar.id, identity_type
        ));
    }

    if !is_within(affiliation, &registrar.affiliation) {
        return AuthzDecision::deny(format!(
            "affiliation '{}' is outside registrar scope '{}'",
            affiliation, registrar.affiliation
        ));
    }

    for name in [attrs::REGISTRAR_ROLES, attrs::DELEGATE_ROLES] {
        let Some(granted) = attributes.get(name) else {
            continue;
        };
        for role in split_roles(granted) {
            if !registrar.has_role(attrs::DELEGATE_ROLES, role) {
                return AuthzDecision::deny(format!(
                    "'{}' may not delegate role '{}'",
                    registrar.id, role
                ));
            }
        }
    }

    if attributes.get(attrs::REVOKER).is_some_and(|v| is_true(v)) && !registrar.is_revoker() {
        return AuthzDecision::deny(format!(
            "'{}' may not grant hf.Revoker without holding it",
            registrar.id
        ));
    }

    AuthzDecision::allow()
}

/// Decide whether `revoker` may revoke certificates of an identity in
/// `target_affiliation`. `None` means the owner is no longer registered;
/// only the revoker attribute is checked then.
pub fn authorize_revoke(revoker: &Identity, target_affiliation: Option<&str>) -> AuthzDecision {
    if !revoker.is_revoker() {
        return AuthzDecision::deny(format!("'{}' does not have hf.Revoker", revoker.id));
    }

    match target_affiliation {
        Some(target) if !is_within(target, &revoker.affiliation) => AuthzDecision::deny(format!(
            "affiliation '{}' is outside revoker scope '{}'",
            target, revoker.affiliation
        )),
        _ => AuthzDecision::allow(),
    }
}
