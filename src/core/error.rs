use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("{0}")]
    NotDurable(String),

    #[error("key {key} already registered in collection \"{label}\"")]
    KeyAlreadyRegistered { key: String, label: String },

    #[error("key {key} not found in collection \"{label}\"")]
    KeyNotFound { key: String, label: String },

    #[error("key too large: {0}")]
    KeyTooLarge(String),

    #[error("keys in store cannot be added to during iteration")]
    ConcurrentModification,

    #[error("redefinition of durable kind \"{0}\"")]
    KindRedefinition(String),

    #[error("durable kinds were not redefined, missing tags: [{}]", .0.join(","))]
    MissingTags(Vec<String>),

    #[error("Facet mismatch: {0}")]
    FacetMismatch(String),

    #[error("Invalid behavior: {0}")]
    InvalidBehavior(String),

    #[error("Unknown reference: {0}")]
    UnknownReference(String),

    #[error("State access error: {0}")]
    StateAccess(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Method error: {0}")]
    Method(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
