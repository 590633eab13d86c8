//! Configuration management for keyward
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (KEYWARD_* prefix, `__` between sections)
//! 2. keyward.local.toml (gitignored, local overrides)
//! 3. keyward.toml (git-tracked, project config)
//! 4. ~/.config/keyward/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use keyward_kms::{KmsTlsOptions, ProxyOptions, TransportOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main keyward configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub key_vault: KeyVaultConfig,
    pub kms: KmsConfig,
    pub markup: MarkupConfig,
    pub operation: OperationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyVaultConfig {
    /// `database.collection` holding data keys.
    pub namespace: String,
}

impl Default for KeyVaultConfig {
    fn default() -> Self {
        Self {
            namespace: "admin.datakeys".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    pub proxy: ProxyConfig,
    /// TLS settings keyed by KMS provider (`aws`, `azure`, `gcp`, `kmip`, ...).
    pub tls: BTreeMap<String, ProviderTlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTlsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_key_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_key_file_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_invalid_certificates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_invalid_hostnames: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_ocsp_endpoint_check: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_certificate_revocation_check: Option<bool>,
}

impl From<&ProviderTlsConfig> for KmsTlsOptions {
    fn from(cfg: &ProviderTlsConfig) -> Self {
        Self {
            tls_ca_file: cfg.ca_file.clone(),
            tls_certificate_key_file: cfg.certificate_key_file.clone(),
            tls_certificate_key_file_password: cfg.certificate_key_file_password.clone(),
            tls_insecure: cfg.insecure,
            tls_allow_invalid_certificates: cfg.allow_invalid_certificates,
            tls_allow_invalid_hostnames: cfg.allow_invalid_hostnames,
            tls_disable_ocsp_endpoint_check: cfg.disable_ocsp_endpoint_check,
            tls_disable_certificate_revocation_check: cfg.disable_certificate_revocation_check,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkupConfig {
    /// Address of the markup helper. Not dialed here: callers connect their
    /// `CommandClient` to it, and the spawned helper is expected to listen on it.
    pub uri: String,
    /// Never spawn the helper; assume something else manages it.
    pub bypass_spawn: bool,
    pub spawn_path: PathBuf,
    pub spawn_args: Vec<String>,
}

impl Default for MarkupConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27020".to_string(),
            bypass_spawn: false,
            spawn_path: PathBuf::from("mongocryptd"),
            spawn_args: vec!["--idleShutdownTimeoutSecs".to_string(), "60".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Upper bound on one state machine run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl KeywardConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file without layering.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that can never produce a working or secure setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.key_vault.namespace.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "key vault namespace must be `database.collection`, got {:?}",
                    self.key_vault.namespace
                )));
            }
        }

        for (provider, tls) in &self.kms.tls {
            KmsTlsOptions::from(tls)
                .validate(provider)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        Ok(())
    }

    /// Transport settings for KMS requests.
    pub fn transport_options(&self) -> TransportOptions {
        let proxy = ProxyOptions {
            proxy_host: self.kms.proxy.host.clone(),
            proxy_port: self.kms.proxy.port,
            proxy_username: self.kms.proxy.username.clone(),
            proxy_password: self.kms.proxy.password.clone(),
        };

        TransportOptions {
            proxy,
            tls: self
                .kms
                .tls
                .iter()
                .map(|(provider, tls)| (provider.clone(), KmsTlsOptions::from(tls)))
                .collect(),
            connect_timeout: self.kms.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: self.kms.read_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Overall operation timeout, if configured.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation.timeout_ms.map(Duration::from_millis)
    }

    /// Resolve relative certificate paths to absolute
    pub fn resolve_paths(&mut self, base_dir: impl AsRef<Path>) {
        let base = base_dir.as_ref();

        for tls in self.kms.tls.values_mut() {
            for path in [&mut tls.ca_file, &mut tls.certificate_key_file]
                .into_iter()
                .flatten()
            {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = KeywardConfig::default();
        assert_eq!(config.key_vault.namespace, "admin.datakeys");
        assert_eq!(config.markup.uri, "mongodb://localhost:27020");
        assert!(!config.markup.bypass_spawn);
        assert_eq!(config.markup.spawn_args, ["--idleShutdownTimeoutSecs", "60"]);
        assert!(config.validate().is_ok());
        assert!(config.operation_timeout().is_none());
    }

    #[test]
    fn test_transport_options_conversion() {
        let mut config = KeywardConfig::default();
        config.kms.proxy.host = Some("proxy.internal".to_string());
        config.kms.proxy.username = Some("svc".to_string());
        config.kms.read_timeout_ms = Some(2500);
        config.kms.tls.insert(
            "kmip".to_string(),
            ProviderTlsConfig {
                ca_file: Some(PathBuf::from("/etc/kmip/ca.pem")),
                ..ProviderTlsConfig::default()
            },
        );

        let options = config.transport_options();
        assert_eq!(options.proxy.address(), Some(("proxy.internal", 1080)));
        assert_eq!(options.proxy.credentials(), Some(("svc", "")));
        assert_eq!(options.read_timeout, Some(Duration::from_millis(2500)));
        assert!(options.connect_timeout.is_none());
        assert_eq!(
            options.tls["kmip"].tls_ca_file,
            Some(PathBuf::from("/etc/kmip/ca.pem"))
        );
    }

    #[test]
    fn test_validate_rejects_insecure_tls() {
        let mut config = KeywardConfig::default();
        config.kms.tls.insert(
            "gcp".to_string(),
            ProviderTlsConfig {
                allow_invalid_certificates: Some(true),
                ..ProviderTlsConfig::default()
            },
        );

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gcp: tlsAllowInvalidCertificates"));
    }

    #[test]
    fn test_validate_rejects_bad_namespace() {
        let mut config = KeywardConfig::default();
        config.key_vault.namespace = "datakeys".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[key_vault]
namespace = "encryption.__keyVault"

[markup]
bypass_spawn = true
"#
        )
        .unwrap();

        let config = KeywardConfig::from_file(file.path()).unwrap();
        assert_eq!(config.key_vault.namespace, "encryption.__keyVault");
        assert!(config.markup.bypass_spawn);
    }

    #[test]
    fn test_from_file_missing() {
        let err = KeywardConfig::from_file("/nonexistent/keyward.toml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn test_path_resolution() {
        let mut config = KeywardConfig::default();
        config.kms.tls.insert(
            "aws".to_string(),
            ProviderTlsConfig {
                ca_file: Some(PathBuf::from("certs/ca.pem")),
                certificate_key_file: Some(PathBuf::from("/abs/client.pem")),
                ..ProviderTlsConfig::default()
            },
        );
        config.resolve_paths("/home/user/project");

        let aws = &config.kms.tls["aws"];
        assert_eq!(
            aws.ca_file,
            Some(PathBuf::from("/home/user/project/certs/ca.pem"))
        );
        assert_eq!(aws.certificate_key_file, Some(PathBuf::from("/abs/client.pem")));
    }
}
