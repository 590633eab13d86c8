//! The engine boundary.
//!
//! An encryption context is owned by the caller and advanced by the driver.
//! The driver never looks inside payloads; it only moves bytes between the
//! context and the collaborators the context asks for.

use keyward_kms::KmsRequest;

/// States reported by an encryption context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ContextState {
    Error = 0,
    NeedMongoCollinfo = 1,
    NeedMongoMarkings = 2,
    NeedMongoKeys = 3,
    NeedKms = 4,
    Ready = 5,
    Done = 6,
    NeedKmsCredentials = 7,
}

impl ContextState {
    /// Maps a raw engine value to a state, `None` for values the driver does
    /// not know.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Error,
            1 => Self::NeedMongoCollinfo,
            2 => Self::NeedMongoMarkings,
            3 => Self::NeedMongoKeys,
            4 => Self::NeedKms,
            5 => Self::Ready,
            6 => Self::Done,
            7 => Self::NeedKmsCredentials,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "MONGOCRYPT_CTX_ERROR",
            Self::NeedMongoCollinfo => "MONGOCRYPT_CTX_NEED_MONGO_COLLINFO",
            Self::NeedMongoMarkings => "MONGOCRYPT_CTX_NEED_MONGO_MARKINGS",
            Self::NeedMongoKeys => "MONGOCRYPT_CTX_NEED_MONGO_KEYS",
            Self::NeedKms => "MONGOCRYPT_CTX_NEED_KMS",
            Self::Ready => "MONGOCRYPT_CTX_READY",
            Self::Done => "MONGOCRYPT_CTX_DONE",
            Self::NeedKmsCredentials => "MONGOCRYPT_CTX_NEED_KMS_CREDENTIALS",
        }
    }

    /// `Done` and `Error` end the walk.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One encrypt, decrypt or data-key operation inside the engine.
///
/// Methods that hand data to the engine are infallible: an engine that
/// rejects input moves itself to [`ContextState::Error`] and the driver picks
/// that up on its next state read.
pub trait CryptContext: Send {
    /// KMS request handle produced by [`next_kms_request`](Self::next_kms_request).
    type KmsRequest: KmsRequest;

    /// Raw state value, see [`ContextState`].
    fn state(&self) -> u32;

    /// Target `database.collection`, when the operation has one.
    fn namespace(&self) -> Option<&str>;

    /// Filter or command bytes for the pending database operation.
    fn next_mongo_operation(&mut self) -> Option<Vec<u8>>;

    fn add_mongo_operation_response(&mut self, bytes: &[u8]);

    fn finish_mongo_operation(&mut self);

    /// KMS provider credentials, as document bytes.
    fn provide_kms_providers(&mut self, bytes: &[u8]);

    /// Next pending KMS request. May yield several per `NeedKms` visit.
    fn next_kms_request(&mut self) -> Option<Self::KmsRequest>;

    fn finish_kms_requests(&mut self);

    /// Output document bytes. On failure the context moves to `Error`.
    fn finalize(&mut self) -> Vec<u8>;

    /// Error detail while in `Error`.
    fn status_message(&self) -> Option<String>;
}
