use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeriveError {
    #[error("Entity '{0}' is not defined")]
    UndefinedEntity(String),

    #[error(
        "Found a cached artifact with the same descriptor ('{descriptor}') and version \
         (major={major:?}, minor={minor:?}), but created by different code \
         (old hash {old_hash}, new hash {new_hash}). Did you change your code but not \
         update the version number? Change the major version to indicate that the \
         behavior has changed, or the minor version to indicate that it has not."
    )]
    CodeVersioning {
        descriptor: String,
        major: String,
        minor: Option<String>,
        old_hash: String,
        new_hash: String,
    },

    #[error("No values were defined for internal bootstrap entity '{0}'")]
    BootstrapUndefined(String),

    #[error("Bootstrap entity '{entity}' must have exactly one value; got {count}")]
    BootstrapMultiple { entity: String, count: usize },

    #[error("Bootstrap entity '{entity}' must be a value of type {expected}")]
    BootstrapType {
        entity: String,
        expected: &'static str,
    },

    #[error(
        "Attempting to load cached state for entity '{0}', but the cache is not \
         available yet because core bootstrap entities depend on this one; you should \
         mark entity '{0}' as not persisted to indicate that it can't be cached."
    )]
    PrematurePersistence(String),

    #[error("Entity '{0}' must be persisted, memoized, or both")]
    NotRetrievable(String),

    #[error(
        "Entity '{entity}' is persisted, but its protocol ({protocol}) cannot serialize \
         values; mark it as not persisted or give it a serializable protocol"
    )]
    NotPersistable {
        entity: String,
        protocol: &'static str,
    },

    #[error("Dependency cycle detected at '{0}'")]
    DependencyCycle(String),

    #[error("Task producing '{task}' is inconsistent: {reason}")]
    InconsistentTask { task: String, reason: &'static str },

    #[error("Provider for '{entity}':\n{source}")]
    Provider {
        entity: String,
        source: anyhow::Error,
    },

    #[error("Task '{task}':\n{source}")]
    Task { task: String, source: anyhow::Error },

    #[error("Task '{task}' returned {actual} values, expected {expected}")]
    TaskArity {
        task: String,
        expected: usize,
        actual: usize,
    },

    #[error("Value for '{task}' was rejected by its protocol:\n{source}")]
    Protocol { task: String, source: anyhow::Error },

    #[error("Cache access for '{task}':\n{source}")]
    Cache { task: String, source: anyhow::Error },

    #[error("Results for '{0}' are neither memoized nor persisted")]
    ResultsUnavailable(String),
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Derive(#[from] DeriveError),

    #[error("Couldn't derive a value token:\n{0}")]
    Token(#[from] serde_json::Error),

    #[error("Entity '{entity}' has {count} values, expected exactly one")]
    ValueCount { entity: String, count: usize },

    #[error("Entity '{entity}' does not hold values of type {expected}")]
    ValueType {
        entity: String,
        expected: &'static str,
    },
}
