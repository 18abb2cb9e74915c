//! Issued-certificate records.

use serde::{Deserialize, Serialize};

/// Lifecycle status of an issued certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Valid,
    Revoked,
}

impl CertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "good",
            Self::Revoked => "revoked",
        }
    }

    /// Parse the stored column value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "good" => Some(Self::Valid),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// RFC 5280 CRL reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub fn code(&self) -> i64 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            // 7 is unused
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    /// Parse a reason name, ignoring case (`keyCompromise`, `superseded`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        let reason = match name.to_ascii_lowercase().as_str() {
            "" | "unspecified" => Self::Unspecified,
            "keycompromise" => Self::KeyCompromise,
            "cacompromise" => Self::CaCompromise,
            "affiliationchanged" => Self::AffiliationChanged,
            "superseded" => Self::Superseded,
            "cessationofoperation" => Self::CessationOfOperation,
            "certificatehold" => Self::CertificateHold,
            "removefromcrl" => Self::RemoveFromCrl,
            "privilegewithdrawn" => Self::PrivilegeWithdrawn,
            "aacompromise" => Self::AaCompromise,
            _ => return None,
        };
        Some(reason)
    }
}

/// A stored certificate binding.
///
/// `(serial, aki)` is unique. Only `status`, `reason` and `revoked_at`
/// change after insertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Owning identity id.
    pub id: String,
    /// Serial number, decimal.
    pub serial: String,
    /// Authority key identifier, lowercase hex.
    pub aki: String,
    pub status: CertStatus,
    pub reason: i64,
    /// Unix seconds.
    pub expiry: i64,
    /// Unix seconds, 0 while valid.
    pub revoked_at: i64,
    pub pem: String,
}

impl CertificateRecord {
    pub fn is_valid(&self) -> bool {
        self.status == CertStatus::Valid
    }
}
