//! Per-provider TLS configuration for KMS connections.
//!
//! Builds a rustls `ClientConfig` from the file-based options a caller sets for
//! each KMS provider. Options that would weaken certificate or hostname
//! verification are recognised only so they can be rejected.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};

use crate::error::{KmsError, KmsResult};
use crate::pem::{self, PemBlock};

/// TLS options for connections to one KMS provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KmsTlsOptions {
    /// CA bundle (PEM) used instead of the public web PKI roots.
    #[serde(rename = "tlsCAFile", skip_serializing_if = "Option::is_none")]
    pub tls_ca_file: Option<PathBuf>,
    /// Client certificate chain and private key (PEM, one file).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_certificate_key_file: Option<PathBuf>,
    /// Passphrase for an encrypted PKCS#8 private key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_certificate_key_file_password: Option<String>,

    // Prohibited. Presence alone is an error, regardless of value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_insecure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_allow_invalid_certificates: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_allow_invalid_hostnames: Option<bool>,
    #[serde(
        rename = "tlsDisableOCSPEndpointCheck",
        skip_serializing_if = "Option::is_none"
    )]
    pub tls_disable_ocsp_endpoint_check: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_disable_certificate_revocation_check: Option<bool>,
}

impl KmsTlsOptions {
    /// Creates options trusting the given CA bundle.
    pub fn with_ca_file(mut self, path: impl AsRef<Path>) -> Self {
        self.tls_ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Presents the certificate and key in `path` as the client identity.
    pub fn with_certificate_key_file(mut self, path: impl AsRef<Path>) -> Self {
        self.tls_certificate_key_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the passphrase for an encrypted client key.
    pub fn with_key_password(mut self, password: impl Into<String>) -> Self {
        self.tls_certificate_key_file_password = Some(password.into());
        self
    }

    /// Returns the name of the first prohibited option that is set.
    pub fn insecure_option(&self) -> Option<&'static str> {
        [
            ("tlsInsecure", self.tls_insecure.is_some()),
            (
                "tlsAllowInvalidCertificates",
                self.tls_allow_invalid_certificates.is_some(),
            ),
            (
                "tlsAllowInvalidHostnames",
                self.tls_allow_invalid_hostnames.is_some(),
            ),
            (
                "tlsDisableOCSPEndpointCheck",
                self.tls_disable_ocsp_endpoint_check.is_some(),
            ),
            (
                "tlsDisableCertificateRevocationCheck",
                self.tls_disable_certificate_revocation_check.is_some(),
            ),
        ]
        .into_iter()
        .find_map(|(name, set)| set.then_some(name))
    }

    /// Rejects options that weaken verification for `provider`.
    pub fn validate(&self, provider: &str) -> KmsResult<()> {
        match self.insecure_option() {
            Some(option) => Err(KmsError::InsecureTlsOption {
                provider: provider.to_string(),
                option,
            }),
            None => Ok(()),
        }
    }

    /// Builds a client config, reading certificate material from disk.
    pub async fn client_config(&self) -> KmsResult<Arc<ClientConfig>> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| KmsError::Tls(e.to_string()))?;

        let roots = match &self.tls_ca_file {
            Some(path) => {
                let blocks = read_pem(path).await?;
                let mut store = RootCertStore::empty();
                let certs = pem::certificates(&blocks).map_err(|e| pem_error(path, e))?;
                for cert in certs {
                    store.add(cert).map_err(|e| {
                        KmsError::Tls(format!("invalid CA certificate in {}: {e}", path.display()))
                    })?;
                }
                store
            }
            None => RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            },
        };
        let builder = builder.with_root_certificates(roots);

        let config = match &self.tls_certificate_key_file {
            Some(path) => {
                let blocks = read_pem(path).await?;
                let certs = pem::certificates(&blocks).map_err(|e| pem_error(path, e))?;
                let key = pem::private_key(
                    &blocks,
                    self.tls_certificate_key_file_password.as_deref(),
                )
                .map_err(|e| pem_error(path, e))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| KmsError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

async fn read_pem(path: &Path) -> KmsResult<Vec<PemBlock>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| KmsError::Tls(format!("failed to read {}: {e}", path.display())))?;
    pem::parse_pem(&data).map_err(|e| pem_error(path, e))
}

fn pem_error(path: &Path, e: pem::PemError) -> KmsError {
    KmsError::Tls(format!("failed to load PEM file {}: {e}", path.display()))
}
