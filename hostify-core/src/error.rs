use thiserror::Error;

/// Common result type for core operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported worker kind: {0}")]
    UnsupportedKind(String),
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("service already exists: {0}")]
    AlreadyExists(String),
    #[error("service not active: {0}")]
    NotActive(String),
    #[error("failed to {action} service {service}: {source}")]
    Registration {
        service: String,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("config store entry not found: {path} [{key}]: {source}")]
    StoreNotFound {
        path: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config store access denied: {path} [{key}]: {source}")]
    StoreAccessDenied {
        path: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config store error: {path} [{key}]: {source}")]
    Store {
        path: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start the service {service}: {source}")]
    StartFailed {
        service: String,
        #[source]
        source: Box<ServiceError>,
    },
    #[error("an error occurred while the service {service} was running: {source}")]
    RunFailed {
        service: String,
        #[source]
        source: Box<ServiceError>,
    },
    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),
    #[error("workload error: {0}")]
    Workload(String),
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("other error: {0}")]
    Other(String),
}

impl ServiceError {
    /// 是否为 "不存在" 类错误（服务或存储项）。
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::StoreNotFound { .. })
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}
