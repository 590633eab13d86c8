//! KMS provider credentials.
//!
//! The engine asks for credentials with `NeedKmsCredentials`. A caller either
//! supplies a refresh hook that produces the full provider document, or lets
//! [`ProviderCredentials`] fill in providers that were configured with an
//! empty block (`{ aws: {} }`) through a discovery chain.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use tracing::debug;

use crate::error::{Error, Result};

/// Produces the KMS providers document handed to the engine.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn kms_credentials(&self) -> Result<Document>;
}

/// Looks up credentials for one provider.
#[async_trait]
pub trait CredentialDiscovery: Send + Sync {
    async fn discover(&self, provider: &str) -> Result<Document>;
}

/// Configured providers plus on-demand discovery for empty blocks.
pub struct ProviderCredentials {
    providers: Document,
    refresh: Option<Arc<dyn CredentialSource>>,
    discovery: Arc<dyn CredentialDiscovery>,
}

impl ProviderCredentials {
    /// Uses [`EnvironmentDiscovery`] for empty provider blocks.
    pub fn new(providers: Document) -> Self {
        Self {
            providers,
            refresh: None,
            discovery: Arc::new(EnvironmentDiscovery::new()),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn CredentialDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// An explicit hook replaces discovery entirely.
    pub fn with_refresh(mut self, refresh: Arc<dyn CredentialSource>) -> Self {
        self.refresh = Some(refresh);
        self
    }
}

#[async_trait]
impl CredentialSource for ProviderCredentials {
    async fn kms_credentials(&self) -> Result<Document> {
        if let Some(refresh) = &self.refresh {
            return refresh.kms_credentials().await;
        }

        let mut resolved = Document::new();
        for (provider, block) in &self.providers {
            let value = match block {
                Bson::Document(d) if d.is_empty() => {
                    debug!(provider = %provider, "discovering KMS credentials");
                    Bson::Document(self.discovery.discover(provider).await?)
                }
                other => other.clone(),
            };
            resolved.insert(provider.clone(), value);
        }
        Ok(resolved)
    }
}

type Lookup = dyn Fn(&str) -> Option<String> + Send + Sync;

/// Reads credentials from process environment variables.
///
/// Only `aws` is supported, from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`
/// and the optional `AWS_SESSION_TOKEN`.
pub struct EnvironmentDiscovery {
    lookup: Arc<Lookup>,
}

impl EnvironmentDiscovery {
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(|name: &str| std::env::var(name).ok()),
        }
    }

    /// Reads variables through `lookup` instead of the process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Arc::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }
}

impl Default for EnvironmentDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialDiscovery for EnvironmentDiscovery {
    async fn discover(&self, provider: &str) -> Result<Document> {
        if provider != "aws" {
            return Err(Error::Credentials(format!(
                "automatic credential discovery is not supported for provider {provider}"
            )));
        }

        let (Some(access_key_id), Some(secret_access_key)) = (
            self.var("AWS_ACCESS_KEY_ID"),
            self.var("AWS_SECRET_ACCESS_KEY"),
        ) else {
            return Err(Error::Credentials(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY must be set".to_string(),
            ));
        };

        let mut credentials = doc! {
            "accessKeyId": access_key_id,
            "secretAccessKey": secret_access_key,
        };
        if let Some(token) = self.var("AWS_SESSION_TOKEN") {
            credentials.insert("sessionToken", token);
        }
        Ok(credentials)
    }
}
