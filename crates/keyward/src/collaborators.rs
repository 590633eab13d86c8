//! Database collaborators and the adapters that call them.
//!
//! Payloads stay raw end to end: filter and command bytes from the engine are
//! wrapped as [`RawDocumentBuf`] without decoding into typed values, so
//! numeric types come back byte-identical.

use async_trait::async_trait;
use bson::RawDocumentBuf;
use thiserror::Error;
use tracing::debug;

use crate::error::Result;
use crate::namespace::Namespace;

/// Failure reported by a database collaborator.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Server selection or a socket read timed out.
    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error.
    #[error("command failed: {0}")]
    Command(String),
}

/// Read isolation requested from the key vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConcern {
    Local,
    Majority,
}

impl ReadConcern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Majority => "majority",
        }
    }
}

/// Lists collection metadata.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Collection info documents in `db` matching `filter`.
    async fn list_collections(
        &self,
        db: &str,
        filter: RawDocumentBuf,
    ) -> std::result::Result<Vec<RawDocumentBuf>, DatabaseError>;
}

/// Runs commands against the markup helper.
#[async_trait]
pub trait CommandClient: Send + Sync {
    async fn run_command(
        &self,
        db: &str,
        command: RawDocumentBuf,
    ) -> std::result::Result<RawDocumentBuf, DatabaseError>;
}

/// Reads data key documents.
#[async_trait]
pub trait KeyVaultClient: Send + Sync {
    async fn find(
        &self,
        namespace: &Namespace,
        filter: RawDocumentBuf,
        read_concern: ReadConcern,
    ) -> std::result::Result<Vec<RawDocumentBuf>, DatabaseError>;
}

/// First collection info document in `ns.db` matching the engine's filter.
pub async fn fetch_collection_info(
    client: &dyn MetadataClient,
    ns: &Namespace,
    filter: Vec<u8>,
) -> Result<Option<RawDocumentBuf>> {
    let filter = RawDocumentBuf::from_bytes(filter)?;
    let info = client.list_collections(&ns.db, filter).await?;
    debug!(db = %ns.db, matches = info.len(), "listed collections");
    Ok(info.into_iter().next())
}

/// Runs the engine's command on the markup helper against `ns.db`.
pub async fn mark_command(
    client: &dyn CommandClient,
    ns: &Namespace,
    command: &[u8],
) -> Result<RawDocumentBuf> {
    let command = RawDocumentBuf::from_bytes(command.to_vec())?;
    Ok(client.run_command(&ns.db, command).await?)
}

/// Every key document matching the engine's filter, read with majority
/// read concern.
pub async fn fetch_keys(
    client: &dyn KeyVaultClient,
    key_vault: &Namespace,
    filter: Vec<u8>,
) -> Result<Vec<RawDocumentBuf>> {
    let filter = RawDocumentBuf::from_bytes(filter)?;
    let keys = client.find(key_vault, filter, ReadConcern::Majority).await?;
    debug!(key_vault = %key_vault, keys = keys.len(), "fetched data keys");
    Ok(keys)
}
