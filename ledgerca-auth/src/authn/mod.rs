//! Per-request authentication tokens and basic credentials.

mod basic;
mod error;
mod token;
mod verify;

pub use basic::BasicCredentials;
pub use error::AuthnError;
pub use token::{build_signed_payload, AuthToken};
pub use verify::{verify_token, VerifiedCaller};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::test_support::TestCa;
    use crate::cert::{CertError, TrustAnchor};
    use crate::identity::PrivateKey;

    const NOW: i64 = 1_800_000_000;

    fn setup() -> (TestCa, TrustAnchor, PrivateKey, Vec<u8>) {
        let ca = TestCa::new("test-ca");
        let anchor = TrustAnchor::from_certificate(&ca.der()).unwrap();
        let client = PrivateKey::generate();
        let cert = ca.issue(&client, "alice");
        (ca, anchor, client, cert)
    }

    #[test]
    fn test_verify_valid_token() {
        let (_ca, anchor, client, cert) = setup();
        let body = br#"{"id":"bob"}"#;

        let header = AuthToken::create(&cert, body, &client).unwrap().encode();
        let token = AuthToken::parse(&header).unwrap();
        let caller = verify_token(&token, body, &anchor, NOW).unwrap();

        assert_eq!(caller.enrollment_id(), "alice");
        assert_eq!(caller.cert_id().serial, "66051");
        assert_eq!(caller.public_key(), &client.public_key());
    }

    #[test]
    fn test_verify_tampered_body_rejected() {
        let (_ca, anchor, client, cert) = setup();

        let token = AuthToken::create(&cert, br#"{"id":"bob"}"#, &client).unwrap();
        let result = verify_token(&token, br#"{"id":"eve"}"#, &anchor, NOW);

        assert_eq!(result, Err(AuthnError::InvalidSignature));
    }

    #[test]
    fn test_verify_empty_body() {
        let (_ca, anchor, client, cert) = setup();

        let token = AuthToken::create(&cert, b"", &client).unwrap();

        assert!(verify_token(&token, b"", &anchor, NOW).is_ok());
        assert_eq!(
            verify_token(&token, b"x", &anchor, NOW),
            Err(AuthnError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_wrong_signing_key_rejected() {
        let (_ca, anchor, _client, cert) = setup();
        let other = PrivateKey::generate();

        let token = AuthToken::create(&cert, b"{}", &other).unwrap();

        assert_eq!(
            verify_token(&token, b"{}", &anchor, NOW),
            Err(AuthnError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_foreign_ca_rejected() {
        let (_ca, anchor, _client, _cert) = setup();
        let rogue = TestCa::new("rogue");
        let client = PrivateKey::generate();
        let cert = rogue.issue(&client, "alice");

        let token = AuthToken::create(&cert, b"{}", &client).unwrap();

        assert_eq!(
            verify_token(&token, b"{}", &anchor, NOW),
            Err(AuthnError::UntrustedCertificate(CertError::BadIssuerSignature))
        );
    }

    #[test]
    fn test_payload_binds_certificate() {
        let a = build_signed_payload(b"cert-a", b"body").unwrap();
        let b = build_signed_payload(b"cert-b", b"body").unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with(b"LEDGERCA-AUTH-v1"));
        assert_eq!(&a[16..20], &6u32.to_be_bytes());
        assert_eq!(a.len(), 16 + 4 + 6 + 32);
    }

    #[test]
    fn test_parse_malformed_tokens() {
        assert_eq!(AuthToken::parse(""), Err(AuthnError::MalformedToken));
        assert_eq!(AuthToken::parse("abc"), Err(AuthnError::MalformedToken));
        assert_eq!(AuthToken::parse("!!!.???"), Err(AuthnError::MalformedToken));
        assert_eq!(AuthToken::parse("YWJj.YWJj"), Err(AuthnError::MalformedToken));
        assert_eq!(AuthToken::parse("YWJj.YWJj.YWJj"), Err(AuthnError::MalformedToken));
        assert_eq!(AuthToken::parse(".YWJj"), Err(AuthnError::MalformedToken));
    }

    #[test]
    fn test_basic_credentials_roundtrip() {
        let creds = BasicCredentials::new("admin", "adminpw");

        let header = creds.encode();
        let parsed = BasicCredentials::parse(&header).unwrap();

        assert!(BasicCredentials::is_basic(&header));
        assert_eq!(parsed.id(), "admin");
        assert_eq!(parsed.secret(), "adminpw");
    }

    #[test]
    fn test_basic_credentials_secret_may_contain_colon() {
        let parsed = BasicCredentials::parse(&BasicCredentials::new("admin", "a:b").encode()).unwrap();

        assert_eq!(parsed.secret(), "a:b");
    }

    #[test]
    fn test_basic_credentials_malformed() {
        assert!(BasicCredentials::parse("Bearer abc").is_err());
        assert!(BasicCredentials::parse("Basic !!!").is_err());
        // "nocolon"
        assert!(BasicCredentials::parse("Basic bm9jb2xvbg==").is_err());
        // ":secret"
        assert!(BasicCredentials::parse("Basic OnNlY3JldA==").is_err());
    }

    #[test]
    fn test_basic_credentials_debug_redacts_secret() {
        let creds = BasicCredentials::new("admin", "adminpw");

        let debug = format!("{:?}", creds);

        assert!(debug.contains("admin"));
        assert!(!debug.contains("adminpw"));
    }
}
