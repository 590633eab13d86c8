//! The driver loop.
//!
//! [`StateMachine::execute`] reads the context's state, performs the I/O that
//! state asks for, feeds the result back, and reads the state again. It never
//! assumes which state comes next: the engine may repeat a state (several KMS
//! rounds) or skip states entirely.

use std::sync::Arc;
use std::time::Duration;

use bson::RawDocumentBuf;
use futures::future::try_join_all;
use keyward_config::KeywardConfig;
use keyward_kms::{KmsRequest, KmsTransport, TransportOptions};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::collaborators::{
    CommandClient, KeyVaultClient, MetadataClient, fetch_collection_info, fetch_keys, mark_command,
};
use crate::context::{ContextState, CryptContext};
use crate::credentials::CredentialSource;
use crate::error::{Error, Result};
use crate::namespace::Namespace;
use crate::retry::{MarkupHelper, with_respawn};

const DEFAULT_KEY_VAULT_NAMESPACE: &str = "admin.datakeys";

const UNIDENTIFIABLE_ERROR: &str = "unidentifiable error in MongoCrypt - received an error status from `libmongocrypt` but received no error message.";

/// Per-call options for [`StateMachine::execute`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Deadline for the whole walk. KMS requests are bounded by whatever
    /// remains of it.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Drives encryption contexts to completion.
///
/// Holds only shared, read-only collaborators; one instance may drive any
/// number of contexts concurrently.
#[derive(Clone)]
pub struct StateMachine {
    transport: KmsTransport,
    key_vault: Namespace,
    metadata: Option<Arc<dyn MetadataClient>>,
    markup: Option<Arc<dyn CommandClient>>,
    markup_helper: Option<Arc<dyn MarkupHelper>>,
    key_vault_client: Option<Arc<dyn KeyVaultClient>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    default_options: ExecuteOptions,
}

impl StateMachine {
    pub fn builder() -> StateMachineBuilder {
        StateMachineBuilder::default()
    }

    /// Builder seeded from loaded configuration: transport options, key vault
    /// namespace and the default operation timeout.
    pub fn from_config(config: &KeywardConfig) -> Result<StateMachineBuilder> {
        let key_vault = config.key_vault.namespace.parse()?;
        Ok(StateMachineBuilder {
            transport: config.transport_options(),
            key_vault: Some(key_vault),
            default_options: ExecuteOptions {
                timeout: config.operation_timeout(),
            },
            ..StateMachineBuilder::default()
        })
    }

    pub fn key_vault_namespace(&self) -> &Namespace {
        &self.key_vault
    }

    /// Runs `context` with the options configured on the builder.
    pub async fn run<C: CryptContext>(&self, context: &mut C) -> Result<Option<RawDocumentBuf>> {
        self.execute(context, self.default_options).await
    }

    /// Walks `context` until `Done` or `Error`.
    ///
    /// Returns the finalized document when the context passed through
    /// `Ready`, or `None` for operations that produce no output.
    #[instrument(skip_all, fields(ns = context.namespace().unwrap_or_default()))]
    pub async fn execute<C: CryptContext>(
        &self,
        context: &mut C,
        options: ExecuteOptions,
    ) -> Result<Option<RawDocumentBuf>> {
        // A timeout too large to represent as an instant is no deadline at all.
        let Some(deadline) = options
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout))
        else {
            return self.walk(context, None).await;
        };

        tokio::time::timeout_at(deadline, self.walk(context, Some(deadline)))
            .await
            .map_err(|_| Error::OperationTimedOut("Operation timed out"))?
    }

    async fn walk<C: CryptContext>(
        &self,
        context: &mut C,
        deadline: Option<Instant>,
    ) -> Result<Option<RawDocumentBuf>> {
        let mut output = None;

        loop {
            let raw = context.state();
            let Some(state) = ContextState::from_raw(raw) else {
                return Err(Error::Protocol(format!("Unknown state: {raw}")));
            };
            debug!(state = state.as_str(), "state machine visit");

            match state {
                ContextState::NeedMongoCollinfo => {
                    let client = required(self.metadata.as_deref(), state, "metadata client")?;
                    let ns = namespace(context)?;
                    let filter = next_operation(context, state)?;
                    if let Some(info) = fetch_collection_info(client, &ns, filter).await? {
                        context.add_mongo_operation_response(info.as_bytes());
                    }
                    context.finish_mongo_operation();
                }

                ContextState::NeedMongoMarkings => {
                    let client = required(self.markup.as_deref(), state, "markup client")?;
                    let ns = namespace(context)?;
                    let command = next_operation(context, state)?;
                    let (ns, command) = (&ns, command.as_slice());
                    let marked = with_respawn(self.markup_helper.as_deref(), move || {
                        mark_command(client, ns, command)
                    })
                    .await?;
                    context.add_mongo_operation_response(marked.as_bytes());
                    context.finish_mongo_operation();
                }

                ContextState::NeedMongoKeys => {
                    let client =
                        required(self.key_vault_client.as_deref(), state, "key vault client")?;
                    let filter = next_operation(context, state)?;
                    for key in fetch_keys(client, &self.key_vault, filter).await? {
                        context.add_mongo_operation_response(key.as_bytes());
                    }
                    context.finish_mongo_operation();
                }

                ContextState::NeedKmsCredentials => {
                    let source = self.credentials.as_deref().ok_or_else(|| {
                        Error::Credentials("no KMS credential source configured".to_string())
                    })?;
                    let providers = source.kms_credentials().await?;
                    context.provide_kms_providers(&bson::to_vec(&providers)?);
                }

                ContextState::NeedKms => {
                    let mut requests = Vec::new();
                    while let Some(request) = context.next_kms_request() {
                        requests.push(request);
                    }
                    debug!(count = requests.len(), "dispatching KMS requests");

                    try_join_all(
                        requests
                            .iter_mut()
                            .map(|request| self.kms_request(request, deadline)),
                    )
                    .await?;
                    drop(requests);
                    context.finish_kms_requests();
                }

                ContextState::Ready => {
                    let bytes = context.finalize();
                    if ContextState::from_raw(context.state()) == Some(ContextState::Error) {
                        let message = context
                            .status_message()
                            .filter(|m| !m.is_empty())
                            .unwrap_or_else(|| "Finalization error".to_string());
                        return Err(Error::Protocol(message));
                    }
                    output = Some(RawDocumentBuf::from_bytes(bytes)?);
                }

                ContextState::Error => {
                    let message = context
                        .status_message()
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| UNIDENTIFIABLE_ERROR.to_string());
                    return Err(Error::Protocol(message));
                }

                ContextState::Done => return Ok(output),
            }
        }
    }

    async fn kms_request<R: KmsRequest>(
        &self,
        request: &mut R,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.transport.request(request))
                .await
                .map_err(|_| Error::OperationTimedOut("KMS request timed out"))??,
            None => self.transport.request(request).await?,
        }
        Ok(())
    }
}

fn required<'a, T: ?Sized>(
    collaborator: Option<&'a T>,
    state: ContextState,
    name: &str,
) -> Result<&'a T> {
    collaborator.ok_or_else(|| {
        Error::Protocol(format!(
            "unreachable state machine state: entered {} but {name} is undefined",
            state.as_str()
        ))
    })
}

fn namespace<C: CryptContext>(context: &C) -> Result<Namespace> {
    context
        .namespace()
        .ok_or_else(|| Error::InvalidArgument("context has no namespace".to_string()))?
        .parse()
}

fn next_operation<C: CryptContext>(context: &mut C, state: ContextState) -> Result<Vec<u8>> {
    context.next_mongo_operation().ok_or_else(|| {
        Error::Protocol(format!("no pending operation in state {}", state.as_str()))
    })
}

/// Builder for [`StateMachine`].
#[derive(Default)]
pub struct StateMachineBuilder {
    transport: TransportOptions,
    key_vault: Option<Namespace>,
    metadata: Option<Arc<dyn MetadataClient>>,
    markup: Option<Arc<dyn CommandClient>>,
    markup_helper: Option<Arc<dyn MarkupHelper>>,
    key_vault_client: Option<Arc<dyn KeyVaultClient>>,
    credentials: Option<Arc<dyn CredentialSource>>,
    default_options: ExecuteOptions,
}

impl StateMachineBuilder {
    pub fn transport(mut self, options: TransportOptions) -> Self {
        self.transport = options;
        self
    }

    /// Defaults to `admin.datakeys`.
    pub fn key_vault_namespace(mut self, namespace: Namespace) -> Self {
        self.key_vault = Some(namespace);
        self
    }

    pub fn metadata_client(mut self, client: Arc<dyn MetadataClient>) -> Self {
        self.metadata = Some(client);
        self
    }

    pub fn markup_client(mut self, client: Arc<dyn CommandClient>) -> Self {
        self.markup = Some(client);
        self
    }

    /// Helper respawned when the markup client times out.
    pub fn markup_helper(mut self, helper: Arc<dyn MarkupHelper>) -> Self {
        self.markup_helper = Some(helper);
        self
    }

    pub fn key_vault_client(mut self, client: Arc<dyn KeyVaultClient>) -> Self {
        self.key_vault_client = Some(client);
        self
    }

    pub fn credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    /// Options used by [`StateMachine::run`].
    pub fn default_options(mut self, options: ExecuteOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn build(self) -> Result<StateMachine> {
        let key_vault = match self.key_vault {
            Some(ns) => ns,
            None => DEFAULT_KEY_VAULT_NAMESPACE.parse()?,
        };

        Ok(StateMachine {
            transport: KmsTransport::new(self.transport),
            key_vault,
            metadata: self.metadata,
            markup: self.markup,
            markup_helper: self.markup_helper,
            key_vault_client: self.key_vault_client,
            credentials: self.credentials,
            default_options: self.default_options,
        })
    }
}
