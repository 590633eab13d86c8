//! # keyward: client-side field-level encryption orchestration
//!
//! An encryption engine decides what an encrypt or decrypt operation still
//! needs: collection metadata, field markings, data keys, KMS credentials, or
//! raw KMS exchanges. `keyward` drives the engine through those steps.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!  caller ─→ │ StateMachine::execute        │ ─→ finalized document
//!            └──┬──────────┬──────────┬─────┘
//!               │          │          │
//!        MetadataClient  CommandClient  KeyVaultClient   (collaborators)
//!                          │ with_respawn
//!                    MarkupHelper (CryptdProcess)
//!               │
//!        KmsTransport (keyward-kms): TCP → SOCKS5 → TLS → ByteAccumulator
//! ```
//!
//! The engine is reached through [`CryptContext`]; its KMS requests through
//! [`keyward_kms::KmsRequest`]. Payloads are BSON bytes and are never decoded
//! into typed values on the way through.

mod collaborators;
mod context;
mod credentials;
mod cryptd;
mod error;
mod namespace;
mod retry;
mod state_machine;


pub use collaborators::{
    CommandClient, DatabaseError, KeyVaultClient, MetadataClient, ReadConcern,
    fetch_collection_info, fetch_keys, mark_command,
};
pub use context::{ContextState, CryptContext};
pub use credentials::{
    CredentialDiscovery, CredentialSource, EnvironmentDiscovery, ProviderCredentials,
};
pub use cryptd::CryptdProcess;
pub use error::{Error, Result};
pub use namespace::Namespace;
pub use retry::{MarkupHelper, with_respawn};
pub use state_machine::{ExecuteOptions, StateMachine, StateMachineBuilder};

pub use keyward_config::KeywardConfig;
pub use keyward_kms::{KmsError, KmsRequest, KmsTlsOptions, ProxyOptions, TransportOptions};
