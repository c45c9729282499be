//! Registry errors

use thiserror::Error;

/// Wire-level error codes carried on REST error payloads
pub mod error_codes {
    // Not found
    pub const SUBJECT_NOT_FOUND: u32 = 40401;
    pub const VERSION_NOT_FOUND: u32 = 40402;
    pub const SCHEMA_NOT_FOUND: u32 = 40403;
    pub const SUBJECT_NOT_SOFT_DELETED: u32 = 40404;
    pub const VERSION_NOT_SOFT_DELETED: u32 = 40405;

    // Invalid input / policy violations
    pub const INVALID_SCHEMA: u32 = 42201;
    pub const INVALID_VERSION: u32 = 42202;
    pub const INVALID_COMPATIBILITY_LEVEL: u32 = 42203;
    pub const INVALID_MODE: u32 = 42204;
    pub const OPERATION_NOT_PERMITTED: u32 = 42205;
    pub const REFERENCE_EXISTS: u32 = 42206;
    pub const SCHEMA_TOO_LARGE: u32 = 42209;
    pub const INCOMPATIBLE_SCHEMA: u32 = 409;

    // Internal errors
    pub const INTERNAL_ERROR: u32 = 50001;
    pub const STORE_ERROR: u32 = 50002;
    pub const TIMEOUT_ERROR: u32 = 50003;
    pub const UNKNOWN_LEADER: u32 = 50004;
    pub const FORWARDING_ERROR: u32 = 50005;
    pub const ID_GENERATION_ERROR: u32 = 50006;
    pub const INITIALIZATION_ERROR: u32 = 50007;
}

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Incompatible schema: {0}")]
    IncompatibleSchema(String),

    #[error("Operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("One or more references exist to the schema {0}")]
    ReferenceExists(String),

    #[error("Schema is too large")]
    SchemaTooLarge,

    #[error("Subject '{0}' was not deleted first before being permanently deleted")]
    SubjectNotSoftDeleted(String),

    #[error("Version {version} of subject '{subject}' was not deleted first before being permanently deleted")]
    SchemaVersionNotSoftDeleted { subject: String, version: u32 },

    #[error("Subject not found: {0}")]
    SubjectNotFound(String),

    #[error("Version not found: {subject} version {version}")]
    VersionNotFound { subject: String, version: u32 },

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("{0} failed since leader is unknown")]
    UnknownLeader(String),

    #[error("Not the leader")]
    NotLeader,

    #[error("Error while forwarding the request to the leader: {0}")]
    RequestForwarding(String),

    /// Structured error returned by the leader; status and code are
    /// propagated to the caller intact.
    #[error("{message}")]
    Rest {
        status: u16,
        code: u32,
        message: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Id generation error: {0}")]
    IdGeneration(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RegistryError {
    /// Wire-level error code for REST error payloads
    pub fn error_code(&self) -> u32 {
        match self {
            RegistryError::InvalidSchema(_) => error_codes::INVALID_SCHEMA,
            RegistryError::IncompatibleSchema(_) => error_codes::INCOMPATIBLE_SCHEMA,
            RegistryError::OperationNotPermitted(_) => error_codes::OPERATION_NOT_PERMITTED,
            RegistryError::ReferenceExists(_) => error_codes::REFERENCE_EXISTS,
            RegistryError::SchemaTooLarge => error_codes::SCHEMA_TOO_LARGE,
            RegistryError::SubjectNotSoftDeleted(_) => error_codes::SUBJECT_NOT_SOFT_DELETED,
            RegistryError::SchemaVersionNotSoftDeleted { .. } => {
                error_codes::VERSION_NOT_SOFT_DELETED
            }
            RegistryError::SubjectNotFound(_) => error_codes::SUBJECT_NOT_FOUND,
            RegistryError::VersionNotFound { .. } => error_codes::VERSION_NOT_FOUND,
            RegistryError::SchemaNotFound(_) => error_codes::SCHEMA_NOT_FOUND,
            RegistryError::UnknownLeader(_) => error_codes::UNKNOWN_LEADER,
            RegistryError::NotLeader => error_codes::INTERNAL_ERROR,
            RegistryError::RequestForwarding(_) => error_codes::FORWARDING_ERROR,
            RegistryError::Rest { code, .. } => *code,
            RegistryError::Timeout(_) => error_codes::TIMEOUT_ERROR,
            RegistryError::Store(_) => error_codes::STORE_ERROR,
            RegistryError::IdGeneration(_) => error_codes::ID_GENERATION_ERROR,
            RegistryError::Initialization(_) => error_codes::INITIALIZATION_ERROR,
            RegistryError::Serialization(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status code the REST layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            RegistryError::InvalidSchema(_)
            | RegistryError::OperationNotPermitted(_)
            | RegistryError::ReferenceExists(_)
            | RegistryError::SchemaTooLarge => 422,
            RegistryError::IncompatibleSchema(_) => 409,
            RegistryError::SubjectNotSoftDeleted(_)
            | RegistryError::SchemaVersionNotSoftDeleted { .. }
            | RegistryError::SubjectNotFound(_)
            | RegistryError::VersionNotFound { .. }
            | RegistryError::SchemaNotFound(_) => 404,
            RegistryError::Rest { status, .. } => *status,
            _ => 500,
        }
    }

    /// Whether a caller may transparently retry the operation
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RegistryError::NotLeader | RegistryError::UnknownLeader(_)
        )
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

impl From<serde_json::Error> for RegistryError {
    fn from(e: serde_json::Error) -> Self {
        RegistryError::Serialization(e.to_string())
    }
}
