//! Configuration management.
//!
//! Settings are merged from a YAML file and `AUTHGATE_`-prefixed environment
//! variables (double underscore as the section separator, e.g.
//! `AUTHGATE_SERVER__PORT`). All validation happens at load time: a
//! misconfigured scope table, malformed session secret, or unknown access
//! check must fail startup, never a request.

use std::{collections::HashMap, path::Path, path::PathBuf, sync::OnceLock, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use jsonwebtoken::{DecodingKey, EncodingKey};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Minimum lifetime for any issued or derived token.
pub const MINIMUM_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Scopes that are always valid, independent of `known_scopes`.
pub const RESERVED_SCOPES: &[&str] = &["admin:token", "user:token"];

/// Regex matching a valid scope.
pub const SCOPE_REGEX: &str = "^[a-zA-Z0-9:._-]+$";

/// Regex matching a valid username.
pub const USERNAME_REGEX: &str = "^[a-z0-9](?:[a-z0-9]|-[a-z0-9])*$";

/// Regex matching a valid group name.
pub const GROUPNAME_REGEX: &str = "^[a-z_][a-zA-Z0-9._-]*$";

fn scope_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SCOPE_REGEX).expect("scope regex is valid"))
}

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(USERNAME_REGEX).expect("username regex is valid"))
}

fn groupname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(GROUPNAME_REGEX).expect("group regex is valid"))
}

/// Whether a string is a valid scope name.
#[must_use]
pub fn is_valid_scope(scope: &str) -> bool {
    scope_regex().is_match(scope)
}

/// Whether a string is a valid username.
#[must_use]
pub fn is_valid_username(username: &str) -> bool {
    username_regex().is_match(username)
}

/// Whether a string is a valid group name.
#[must_use]
pub fn is_valid_group_name(group: &str) -> bool {
    groupname_regex().is_match(group)
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order; later files override earlier ones.
    pub env_files: Vec<String>,
    /// Realm reported in `WWW-Authenticate` challenges.
    pub realm: String,
    /// Base64-encoded 32-byte key for session cookie encryption.
    pub session_secret: String,
    /// Our own token issuer (signing identity).
    pub issuer: IssuerConfig,
    /// Audiences for self-issued tokens.
    pub audience: AudienceConfig,
    /// Session cookie settings.
    pub cookie: CookieConfig,
    /// Prefix for serialized token handles.
    pub token_prefix: String,
    /// Challenge type for 401 responses.
    pub www_authenticate: ChallengeType,
    /// Redis connection URL; when unset, the in-memory store is used.
    pub redis_url: Option<String>,
    /// Scope name → human-readable description.
    pub known_scopes: HashMap<String, String>,
    /// Scope name → group whose members implicitly hold the scope.
    pub group_mapping: HashMap<String, String>,
    /// Ordered access checker names applied to every required scope.
    pub access_checks: Vec<String>,
    /// Upstream issuers we accept tokens from: URL → per-issuer settings.
    pub trusted_issuers: HashMap<String, TrustedIssuerConfig>,
    /// Lifetime of session tokens (and default for reissued ones).
    #[serde(with = "humantime_serde")]
    pub token_lifetime: Duration,
    /// TTL for cached upstream signing keys.
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Capacity of the in-memory internal/notebook token cache.
    pub token_cache_size: usize,
    /// Timeout for outbound HTTP requests to upstream providers.
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Usernames seeded into the administrator roster at startup.
    pub admins: Vec<String>,
    /// Server bind settings.
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            realm: "authgate".to_string(),
            session_secret: String::new(),
            issuer: IssuerConfig::default(),
            audience: AudienceConfig::default(),
            cookie: CookieConfig::default(),
            token_prefix: "gafaelfawr".to_string(),
            www_authenticate: ChallengeType::default(),
            redis_url: None,
            known_scopes: HashMap::new(),
            group_mapping: HashMap::new(),
            access_checks: vec!["scope".to_string()],
            trusted_issuers: HashMap::new(),
            token_lifetime: Duration::from_secs(24 * 60 * 60),
            jwks_ttl: Duration::from_secs(600),
            token_cache_size: 10_000,
            http_timeout: Duration::from_secs(10),
            admins: Vec::new(),
            server: ServerConfig::default(),
        }
    }
}

/// Our signing identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Issuer URL placed in the `iss` claim of every token we sign.
    pub url: String,
    /// RSA private key, PEM, inline. Takes precedence over `key_file`.
    pub key: Option<String>,
    /// Path to the RSA private key PEM.
    pub key_file: Option<PathBuf>,
    /// RSA public key, PEM, inline. Takes precedence over `public_key_file`.
    pub public_key: Option<String>,
    /// Path to the RSA public key PEM.
    pub public_key_file: Option<PathBuf>,
    /// Key ID placed in the header of every token we sign.
    pub kid: String,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key: None,
            key_file: None,
            public_key: None,
            public_key_file: None,
            kid: "authgate".to_string(),
        }
    }
}

/// Audiences for self-issued tokens.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AudienceConfig {
    /// Audience for ordinary session and user tokens.
    pub default: String,
    /// Audience for internal (service-to-service) tokens.
    pub internal: String,
}

/// Session cookie settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Cookie name.
    pub name: String,
    /// Whether to set the `Secure` attribute.
    pub secure: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: "gafaelfawr".to_string(),
            secure: true,
        }
    }
}

/// Per-upstream-issuer verification settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TrustedIssuerConfig {
    /// Audience the upstream issuer puts in tokens meant for us.
    pub audience: String,
}

/// Challenge type for unauthenticated responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    /// `WWW-Authenticate: Bearer …` (the default).
    #[default]
    Bearer,
    /// `WWW-Authenticate: Basic realm="…"`.
    Basic,
}

/// Server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file does not exist, cannot be
    /// parsed, or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                    Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.session_key()?;

        if self.issuer.url.is_empty() {
            return Err(Error::Config("issuer.url must be set".to_string()));
        }
        if self.audience.default.is_empty() {
            return Err(Error::Config("audience.default must be set".to_string()));
        }
        self.encoding_key()?;
        self.decoding_key()?;

        for scope in self.known_scopes.keys() {
            if !is_valid_scope(scope) {
                return Err(Error::Config(format!("Invalid scope name: {scope}")));
            }
        }
        for (scope, group) in &self.group_mapping {
            if !self.is_known_scope(scope) {
                return Err(Error::Config(format!(
                    "group_mapping references unknown scope: {scope}"
                )));
            }
            if !is_valid_group_name(group) {
                return Err(Error::Config(format!("Invalid group name: {group}")));
            }
        }
        for username in &self.admins {
            if !is_valid_username(username) {
                return Err(Error::Config(format!("Invalid admin username: {username}")));
            }
        }

        Ok(())
    }

    /// The decoded 32-byte session cookie key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the secret is not base64 or not 32 bytes.
    pub fn session_key(&self) -> Result<[u8; 32]> {
        let bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &self.session_secret,
        )
        .map_err(|e| Error::Config(format!("session_secret is not valid base64: {e}")))?;
        bytes
            .try_into()
            .map_err(|_| Error::Config("session_secret must decode to 32 bytes".to_string()))
    }

    /// The RSA signing key for tokens we issue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no key is configured or the PEM is bad.
    pub fn encoding_key(&self) -> Result<EncodingKey> {
        let pem = self.read_pem(self.issuer.key.as_deref(), self.issuer.key_file.as_deref())?;
        EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| Error::Config(format!("issuer.key is not a valid RSA key: {e}")))
    }

    /// The RSA public key matching [`Config::encoding_key`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no key is configured or the PEM is bad.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        let pem = self.read_pem(
            self.issuer.public_key.as_deref(),
            self.issuer.public_key_file.as_deref(),
        )?;
        DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| Error::Config(format!("issuer.public_key is not a valid RSA key: {e}")))
    }

    fn read_pem(&self, inline: Option<&str>, file: Option<&Path>) -> Result<String> {
        if let Some(pem) = inline {
            return Ok(pem.to_string());
        }
        if let Some(path) = file {
            return std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("Cannot read key file {}: {e}", path.display()))
            });
        }
        Err(Error::Config(
            "issuer key material missing: set key/key_file and public_key/public_key_file"
                .to_string(),
        ))
    }

    /// Whether the scope is configured or reserved.
    #[must_use]
    pub fn is_known_scope(&self, scope: &str) -> bool {
        RESERVED_SCOPES.contains(&scope) || self.known_scopes.contains_key(scope)
    }

    /// Claim key carrying the username. Fixed for now; kept as a method so a
    /// future per-deployment override only touches this spot.
    #[must_use]
    pub fn username_claim(&self) -> &'static str {
        "uid"
    }

    /// Claim key carrying the numeric UID.
    #[must_use]
    pub fn uid_claim(&self) -> &'static str {
        "uidNumber"
    }

    /// All audiences we accept on self-issued tokens.
    #[must_use]
    pub fn own_audiences(&self) -> Vec<String> {
        vec![self.audience.default.clone(), self.audience.internal.clone()]
    }
}

/// Custom humantime serde module for Duration.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s").
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a duration from "30s", "5m", "100ms", or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>()
                .map(|d| Duration::from_secs(d * 86_400))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;

    #[test]
    fn test_config_validates() {
        let config = test_config();
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_short_session_secret() {
        let mut config = test_config();
        config.session_secret = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            [0u8; 16],
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_non_base64_secret() {
        let mut config = test_config();
        config.session_secret = "not base64 at all!!!".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_group_mapping_to_unknown_scope() {
        let mut config = test_config();
        config
            .group_mapping
            .insert("made:up".to_string(), "somegroup".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_admin_username() {
        let mut config = test_config();
        config.admins.push("Not_A_Valid_User".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn reserved_scopes_are_always_known() {
        let config = test_config();
        assert!(config.is_known_scope("admin:token"));
        assert!(config.is_known_scope("user:token"));
        assert!(config.is_known_scope("read:all"));
        assert!(!config.is_known_scope("made:up"));
    }

    #[test]
    fn username_validation() {
        assert!(is_valid_username("alice"));
        assert!(is_valid_username("alice-b42"));
        assert!(!is_valid_username("Alice"));
        assert!(!is_valid_username("-alice"));
        assert!(!is_valid_username("alice--b"));
        assert!(!is_valid_username(""));
    }

    #[test]
    fn scope_validation() {
        assert!(is_valid_scope("read:all"));
        assert!(is_valid_scope("exec.notebook_v2"));
        assert!(!is_valid_scope("read all"));
        assert!(!is_valid_scope(""));
    }

    #[test]
    fn config_parses_from_yaml() {
        let yaml = r#"
realm: example.com
token_prefix: gafaelfawr
token_lifetime: 12h
known_scopes:
  read:all: "Read everything"
group_mapping:
  read:all: readers
access_checks:
  - group_membership
server:
  host: "0.0.0.0"
  port: 8085
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.realm, "example.com");
        assert_eq!(config.server.port, 8085);
        assert_eq!(config.access_checks, vec!["group_membership"]);
        assert_eq!(
            config.group_mapping.get("read:all"),
            Some(&"readers".to_string())
        );
        assert_eq!(config.token_lifetime, Duration::from_secs(12 * 3600));
        assert_eq!(config.cookie.name, "gafaelfawr");
        assert_eq!(config.token_cache_size, 10_000);
    }

    #[test]
    fn keys_load_from_files() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("issuer.pem");
        let public_path = dir.path().join("issuer.pub.pem");
        let mut f = std::fs::File::create(&key_path).unwrap();
        f.write_all(crate::testing::TEST_ISSUER_PRIVATE_PEM.as_bytes())
            .unwrap();
        let mut f = std::fs::File::create(&public_path).unwrap();
        f.write_all(crate::testing::TEST_ISSUER_PUBLIC_PEM.as_bytes())
            .unwrap();

        let mut config = test_config();
        config.issuer.key = None;
        config.issuer.public_key = None;
        config.issuer.key_file = Some(key_path);
        config.issuer.public_key_file = Some(public_path);

        config.encoding_key().unwrap();
        config.decoding_key().unwrap();
    }

    #[test]
    fn missing_key_material_is_rejected() {
        let mut config = test_config();
        config.issuer.key = None;
        config.issuer.key_file = None;
        assert!(matches!(config.encoding_key(), Err(Error::Config(_))));
    }

    #[test]
    fn duration_suffixes() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let w: Wrapper = serde_yaml::from_str("d: 5m").unwrap();
        assert_eq!(w.d, Duration::from_secs(300));
        let w: Wrapper = serde_yaml::from_str("d: \"600\"").unwrap();
        assert_eq!(w.d, Duration::from_secs(600));
        let w: Wrapper = serde_yaml::from_str("d: 250ms").unwrap();
        assert_eq!(w.d, Duration::from_millis(250));
        let w: Wrapper = serde_yaml::from_str("d: 1d").unwrap();
        assert_eq!(w.d, Duration::from_secs(86_400));
    }
}
