//! Configuration loader with multi-source merging

use crate::{KeywardConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "KEYWARD".to_string(),
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "KEYWARD")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<KeywardConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = KeywardConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/keyward/config.toml)
        let paths = Paths::new();
        if let Ok(user_config_file) = paths.user_config_file() {
            if user_config_file.exists() {
                builder = builder.add_source(toml_source(user_config_file));
            }
        }

        // 3. Project config (keyward.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(toml_source(project_config_file));
        }

        // 4. Local config (keyward.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(toml_source(local_config_file));
        }

        // 5. Environment variables (KEYWARD_MARKUP__BYPASS_SPAWN=true)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut keyward_config: KeywardConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        keyward_config.resolve_paths(&self.project_dir);
        keyward_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(keyward_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn toml_source(path: PathBuf) -> config::File<config::FileSourceFile, config::FileFormat> {
    config::File::from(path)
        .required(false)
        .format(config::FileFormat::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .with_env_prefix("KEYWARD_TEST_DEFAULTS")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.key_vault.namespace, "admin.datakeys");
        assert_eq!(config.markup.uri, "mongodb://localhost:27020");
        assert!(config.kms.tls.is_empty());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[key_vault]
namespace = "encryption.__keyVault"

[kms]
read_timeout_ms = 5000

[kms.proxy]
host = "localhost"
port = 1081

[kms.tls.kmip]
ca_file = "certs/ca.pem"

[operation]
timeout_ms = 30000
"#;
        fs::write(project_dir.join("keyward.toml"), config_content)
            .expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("KEYWARD_TEST_PROJECT")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.key_vault.namespace, "encryption.__keyVault");
        assert_eq!(config.kms.read_timeout_ms, Some(5000));
        assert_eq!(config.kms.proxy.port, Some(1081));
        assert_eq!(
            config.kms.tls["kmip"].ca_file,
            Some(project_dir.join("certs/ca.pem"))
        );
        assert_eq!(
            config.operation_timeout(),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("keyward.toml"),
            r#"
[markup]
uri = "mongodb://localhost:27020"
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("keyward.local.toml"),
            r#"
[markup]
uri = "mongodb://localhost:27099"
bypass_spawn = true
"#,
        )
        .expect("Failed to write local config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("KEYWARD_TEST_LOCAL")
            .load()
            .expect("Failed to load config");

        assert_eq!(config.markup.uri, "mongodb://localhost:27099");
        assert!(config.markup.bypass_spawn);
    }

    #[test]
    fn test_insecure_tls_in_file_is_rejected() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("keyward.toml"),
            r#"
[kms.tls.aws]
insecure = true
"#,
        )
        .expect("Failed to write config");

        let result = ConfigLoader::new()
            .with_project_dir(project_dir)
            .with_env_prefix("KEYWARD_TEST_INSECURE")
            .load();
        let err = result.expect_err("insecure TLS must fail the load");
        let chain = format!("{err:#}");
        assert!(chain.contains("Configuration failed validation"), "{chain}");
        assert!(chain.contains("aws"), "{chain}");
    }
}
