//! Certificate authority: key material, signing and enrollment.

mod enroll;
mod keymaterial;
mod signer;

pub use enroll::{
    EnrollError, EnrollRequest, EnrollmentEngine, IssuedCertificate, TcertRequest,
    DEFAULT_TCERT_VALIDITY, TCERT_PROFILE,
};
pub use keymaterial::{ensure_key_material, CaKeyMaterial, KeyMaterialError, Provisioned};
pub use signer::{
    decode_attributes, CertSigner, LocalSigner, Profile, RemoteSigner, SignError, SignRequest,
    SignedCertificate, Signer, SigningPolicy,
};

#[cfg(test)]
pub(crate) use keymaterial::test_files;
#[cfg(test)]
pub(crate) use signer::test_support;
