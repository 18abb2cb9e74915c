//! Server configuration file.
//!
//! Loaded once from YAML at startup. Every field has a default so an empty
//! or missing file yields a runnable server.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ledgerca_core::identity::{attrs, Attributes, DEFAULT_IDENTITY_TYPE};
use ledgerca_core::quota::INHERIT;
use ledgerca_core::AffiliationNode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 7054;
pub const DEFAULT_CA_CERTFILE: &str = "ca-cert.pem";
pub const DEFAULT_CA_KEYFILE: &str = "ca-key.pem";
pub const DEFAULT_DB_TYPE: &str = "sqlite3";
pub const DEFAULT_DATASOURCE: &str = "ledgerca-server.db";
pub const DEFAULT_CA_EXPIRY: &str = "131400h";
pub const DEFAULT_PROFILE_EXPIRY: &str = "8760h";

const BOOTSTRAP_REGISTRAR_ROLES: &str = "client,user,peer,validator,auditor";
const BOOTSTRAP_DELEGATE_ROLES: &str = "client,user,validator,auditor";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid database type '{0}'; expected sqlite3, postgres or mysql")]
    InvalidBackend(String),
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("bootstrap identity requires a non-empty id and secret")]
    InvalidBootIdentity,
    #[error("registry max_enrollments must not be negative, got {0}")]
    InvalidRegistryMax(i64),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    /// Whether `start` serves on the calling task or spawns the accept loop.
    pub blocking: bool,
    pub debug: bool,
    pub tls: ListenerTls,
    pub ca: CaFiles,
    pub csr: CsrTemplate,
    pub signing: SigningConfig,
    /// Remote signing authority, e.g. `http://signer:8888`.
    pub remote: Option<String>,
    pub db: DbConfig,
    pub ldap: LdapConfig,
    pub registry: RegistryConfig,
    pub affiliations: Option<AffiliationNode>,
    pub affiliation_policy: AffiliationPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            blocking: true,
            debug: false,
            tls: ListenerTls::default(),
            ca: CaFiles::default(),
            csr: CsrTemplate::default(),
            signing: SigningConfig::default(),
            remote: None,
            db: DbConfig::default(),
            ldap: LdapConfig::default(),
            registry: RegistryConfig::default(),
            affiliations: None,
            affiliation_policy: AffiliationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerTls {
    pub enabled: bool,
    pub certfile: String,
    pub keyfile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaFiles {
    pub certfile: String,
    pub keyfile: String,
}

impl Default for CaFiles {
    fn default() -> Self {
        Self {
            certfile: DEFAULT_CA_CERTFILE.to_string(),
            keyfile: DEFAULT_CA_KEYFILE.to_string(),
        }
    }
}

/// Subject template for the self-signed CA certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrTemplate {
    pub cn: String,
    pub names: Vec<CsrName>,
    pub hosts: Vec<String>,
    pub serial_number: Option<String>,
    pub expiry: String,
}

impl Default for CsrTemplate {
    fn default() -> Self {
        Self {
            cn: "ledgerca-server".to_string(),
            names: Vec::new(),
            hosts: Vec::new(),
            serial_number: None,
            expiry: DEFAULT_CA_EXPIRY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrName {
    #[serde(rename = "C")]
    pub c: Option<String>,
    #[serde(rename = "ST")]
    pub st: Option<String>,
    #[serde(rename = "L")]
    pub l: Option<String>,
    #[serde(rename = "O")]
    pub o: Option<String>,
    #[serde(rename = "OU")]
    pub ou: Option<String>,
}

/// Named signing profiles plus the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub default: ProfileConfig,
    pub profiles: BTreeMap<String, ProfileConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    pub usage: Vec<String>,
    pub expiry: String,
    /// Never delegate this profile to a remote signer.
    pub local_only: bool,
    pub remote: Option<String>,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            usage: vec!["digital signature".to_string()],
            expiry: DEFAULT_PROFILE_EXPIRY.to_string(),
            local_only: false,
            remote: None,
        }
    }
}

/// Relational engine behind the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
    MySql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    #[serde(rename = "type")]
    pub db_type: String,
    /// Driver-specific connection string; a file path for sqlite3.
    pub datasource: String,
    pub tls: DbTls,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            db_type: DEFAULT_DB_TYPE.to_string(),
            datasource: DEFAULT_DATASOURCE.to_string(),
            tls: DbTls::default(),
        }
    }
}

impl DbConfig {
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidBackend` for an unknown `type`.
    pub fn kind(&self) -> Result<DbKind, ConfigError> {
        match self.db_type.as_str() {
            "sqlite3" | "sqlite" => Ok(DbKind::Sqlite),
            "postgres" | "postgresql" => Ok(DbKind::Postgres),
            "mysql" => Ok(DbKind::MySql),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DbTls {
    pub enabled: bool,
    /// Trusted root certificates for the server.
    pub certfiles: Vec<String>,
    pub client: ClientTls,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTls {
    pub certfile: String,
    pub keyfile: String,
}

/// Directory service used instead of the relational identity table.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub enabled: bool,
    pub url: String,
    pub base_dn: String,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    /// Search filter; `{id}` is replaced with the escaped identity id.
    pub user_filter: String,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            base_dn: String::new(),
            bind_dn: None,
            bind_password: None,
            user_filter: "(uid={id})".to_string(),
        }
    }
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .field("user_filter", &self.user_filter)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 0 means unlimited.
    pub max_enrollments: i64,
    pub identities: Vec<IdentityConfig>,
}

/// An identity loaded at bootstrap.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    #[serde(alias = "name")]
    pub id: String,
    #[serde(alias = "secret")]
    pub pass: String,
    #[serde(rename = "type")]
    pub identity_type: String,
    pub affiliation: String,
    #[serde(alias = "attributes")]
    pub attrs: Attributes,
    #[serde(alias = "maxenrollments")]
    pub max_enrollments: i64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            pass: String::new(),
            identity_type: DEFAULT_IDENTITY_TYPE.to_string(),
            affiliation: String::new(),
            attrs: Attributes::new(),
            max_enrollments: INHERIT,
        }
    }
}

impl std::fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("id", &self.id)
            .field("identity_type", &self.identity_type)
            .field("affiliation", &self.affiliation)
            .field("attrs", &self.attrs)
            .field("max_enrollments", &self.max_enrollments)
            .finish_non_exhaustive()
    }
}

/// What the affiliation loader does when an affiliation already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliationPolicy {
    /// Treat as success.
    #[default]
    Skip,
    /// Fail the bootstrap.
    Reject,
}

impl ServerConfig {
    /// Load configuration from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` if the file exists but cannot be read and
    /// `ConfigError::Yaml` if it is not valid.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// # Errors
    ///
    /// Returns `ConfigError::Yaml` if the text is not a valid configuration.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Reject settings that can never work.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.max_enrollments < 0 {
            return Err(ConfigError::InvalidRegistryMax(self.registry.max_enrollments));
        }
        if !self.ldap.enabled {
            self.db.kind()?;
        }
        parse_duration(&self.csr.expiry)?;
        parse_duration(&self.signing.default.expiry)?;
        for profile in self.signing.profiles.values() {
            parse_duration(&profile.expiry)?;
        }
        Ok(())
    }

    /// Resolve every relative file name against `home`.
    pub fn make_paths_absolute(&mut self, home: &Path) {
        for name in [
            &mut self.ca.certfile,
            &mut self.ca.keyfile,
            &mut self.tls.certfile,
            &mut self.tls.keyfile,
            &mut self.db.tls.client.certfile,
            &mut self.db.tls.client.keyfile,
        ] {
            *name = absolute(name, home);
        }
        for name in &mut self.db.tls.certfiles {
            *name = absolute(name, home);
        }
        if matches!(self.db.kind(), Ok(DbKind::Sqlite)) && !self.db.datasource.contains(':') {
            self.db.datasource = absolute(&self.db.datasource, home);
        }
    }

    /// Add the `--boot id:secret` registrar identity.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidBootIdentity` if either half is empty.
    pub fn add_bootstrap_identity(
        &mut self,
        id: &str,
        secret: &str,
        affiliation: &str,
    ) -> Result<(), ConfigError> {
        if id.is_empty() || secret.is_empty() {
            return Err(ConfigError::InvalidBootIdentity);
        }

        let mut attributes = Attributes::new();
        attributes.insert(attrs::REGISTRAR_ROLES.into(), BOOTSTRAP_REGISTRAR_ROLES.into());
        attributes.insert(attrs::DELEGATE_ROLES.into(), BOOTSTRAP_DELEGATE_ROLES.into());
        attributes.insert(attrs::REVOKER.into(), "true".into());

        self.registry.identities.push(IdentityConfig {
            id: id.to_string(),
            pass: secret.to_string(),
            identity_type: DEFAULT_IDENTITY_TYPE.to_string(),
            affiliation: affiliation.to_string(),
            attrs: attributes,
            max_enrollments: INHERIT,
        });
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn absolute(name: &str, home: &Path) -> String {
    if name.is_empty() || Path::new(name).is_absolute() {
        return name.to_string();
    }
    home.join(name).to_string_lossy().into_owned()
}

/// Parse a duration such as `30s`, `15m`, `8760h` or `2d`.
///
/// A bare number is taken as seconds.
///
/// # Errors
///
/// Returns `ConfigError::InvalidDuration` for empty, zero or unparsable input.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let (num_str, unit) = if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = s.strip_suffix('d') {
        (n, 86_400)
    } else {
        (s, 1)
    };

    let num: u64 = num_str.trim().parse().map_err(|_| invalid())?;
    if num == 0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs(num.saturating_mul(unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = ServerConfig::from_yaml("").unwrap();

        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 7054);
        assert_eq!(config.ca.certfile, "ca-cert.pem");
        assert_eq!(config.ca.keyfile, "ca-key.pem");
        assert_eq!(config.db.kind().unwrap(), DbKind::Sqlite);
        assert_eq!(config.db.datasource, "ledgerca-server.db");
        assert_eq!(config.affiliation_policy, AffiliationPolicy::Skip);
    }

    #[test]
    fn parses_registry_and_affiliations() {
        let yaml = r#"
port: 0
registry:
  max_enrollments: 3
  identities:
    - id: alice
      pass: alicepw
      affiliation: org1.dept1
      attrs:
        hf.Revoker: "true"
    - name: bob
      secret: bobpw
      type: peer
      max_enrollments: 2
affiliations:
  org1:
    - dept1
affiliation_policy: reject
"#;
        let config = ServerConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.port, 0);
        assert_eq!(config.registry.max_enrollments, 3);
        let alice = &config.registry.identities[0];
        assert_eq!(alice.identity_type, "user");
        assert_eq!(alice.max_enrollments, -1);
        assert_eq!(alice.attrs.get("hf.Revoker").map(String::as_str), Some("true"));
        let bob = &config.registry.identities[1];
        assert_eq!(bob.id, "bob");
        assert_eq!(bob.pass, "bobpw");
        assert_eq!(bob.identity_type, "peer");
        assert_eq!(bob.max_enrollments, 2);
        assert!(config.affiliations.is_some());
        assert_eq!(config.affiliation_policy, AffiliationPolicy::Reject);
    }

    #[test]
    fn invalid_backend_rejected() {
        let config = ServerConfig::from_yaml("db:\n  type: oracle\n").unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackend(t)) if t == "oracle"
        ));
    }

    #[test]
    fn negative_registry_max_rejected() {
        let config = ServerConfig::from_yaml("registry:\n  max_enrollments: -2\n").unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegistryMax(-2))
        ));
    }

    #[test]
    fn relative_paths_resolved_against_home() {
        let mut config = ServerConfig::default();
        config.tls.certfile = "/etc/tls/cert.pem".into();

        config.make_paths_absolute(Path::new("/srv/ca"));

        assert_eq!(config.ca.certfile, "/srv/ca/ca-cert.pem");
        assert_eq!(config.ca.keyfile, "/srv/ca/ca-key.pem");
        assert_eq!(config.db.datasource, "/srv/ca/ledgerca-server.db");
        assert_eq!(config.tls.certfile, "/etc/tls/cert.pem");
        assert_eq!(config.tls.keyfile, "");
    }

    #[test]
    fn bootstrap_identity_gets_registrar_attributes() {
        let mut config = ServerConfig::default();

        config.add_bootstrap_identity("admin", "adminpw", "").unwrap();

        let admin = &config.registry.identities[0];
        assert_eq!(admin.id, "admin");
        assert_eq!(
            admin.attrs.get(attrs::REGISTRAR_ROLES).map(String::as_str),
            Some("client,user,peer,validator,auditor")
        );
        assert_eq!(
            admin.attrs.get(attrs::DELEGATE_ROLES).map(String::as_str),
            Some("client,user,validator,auditor")
        );
        assert_eq!(admin.attrs.get(attrs::REVOKER).map(String::as_str), Some("true"));
    }

    #[test]
    fn bootstrap_identity_requires_id_and_secret() {
        let mut config = ServerConfig::default();

        assert!(config.add_bootstrap_identity("", "pw", "").is_err());
        assert!(config.add_bootstrap_identity("admin", "", "").is_err());
        assert!(config.registry.identities.is_empty());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("8760h").unwrap(), Duration::from_secs(8760 * 3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("0h").is_err());
        assert!(parse_duration("abc").is_err());
    }
}
