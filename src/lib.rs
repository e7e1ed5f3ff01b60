use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YamlError: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Kubeconfig Error: {0}")]
    KubeconfigError(#[from] kube::config::KubeconfigError),

    #[error("Invalid base64 data: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("The object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("No known CrcBundle matches {0}")]
    BundleNotFound(String),

    #[error(
        "Requested storage size {requested} is less than the minimum disk size of {minimum} needed by bundle {bundle}"
    )]
    InsufficientStorage {
        requested: String,
        minimum: String,
        bundle: String,
    },

    #[error("Invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("Failed to connect to {0} over ssh")]
    SshConnectTimeout(String),

    #[error("SSH authentication as {0} was rejected")]
    SshAuthenticationFailed(String),

    #[error("SSH Error: {0}")]
    SshError(#[from] russh::Error),

    #[error("SSH key Error: {0}")]
    SshKeyError(#[from] russh_keys::Error),

    #[error("Remote command exited with status {exit_status}: {output}")]
    RemoteCommandFailed { exit_status: u32, output: String },

    #[error("Kubelet not yet running")]
    KubeletNotStarted,

    #[error("Failed to generate client key: {0}")]
    KeyGenerationFailed(#[from] rsa::Error),

    #[error("Failed to encode client key: {0}")]
    KeyEncodingFailed(#[from] rsa::pkcs8::Error),

    #[error("Failed to build certificate signing request: {0}")]
    CertificateRequestFailed(#[from] rcgen::Error),

    #[error("CertificateSigningRequest {0} was approved but has no certificate yet")]
    CertificateNotIssued(String),

    #[error("Failed to hash password: {0}")]
    PasswordHashFailed(#[from] bcrypt::BcryptError),

    #[error("HTTP client Error: {0}")]
    HttpClientError(#[from] reqwest::Error),

    #[error("IO Error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::YamlError(_) => "YamlError",
            Error::KubeError(_) => "KubeError",
            Error::KubeconfigError(_) => "KubeconfigError",
            Error::InvalidBase64(_) => "InvalidBase64",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::BundleNotFound(_) => "BundleNotFound",
            Error::InsufficientStorage { .. } => "InsufficientStorage",
            Error::InvalidQuantity(_) => "InvalidQuantity",
            Error::SshConnectTimeout(_) => "SshConnectTimeout",
            Error::SshAuthenticationFailed(_) => "SshAuthenticationFailed",
            Error::SshError(_) => "SshError",
            Error::SshKeyError(_) => "SshKeyError",
            Error::RemoteCommandFailed { .. } => "RemoteCommandFailed",
            Error::KubeletNotStarted => "KubeletNotStarted",
            Error::KeyGenerationFailed(_) => "KeyGenerationFailed",
            Error::KeyEncodingFailed(_) => "KeyEncodingFailed",
            Error::CertificateRequestFailed(_) => "CertificateRequestFailed",
            Error::CertificateNotIssued(_) => "CertificateNotIssued",
            Error::PasswordHashFailed(_) => "PasswordHashFailed",
            Error::HttpClientError(_) => "HttpClientError",
            Error::IoError(_) => "IoError",
            Error::TaskFailed(_) => "TaskFailed",
        }
    }

    /// Errors that cannot resolve without the CrcCluster spec changing.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::BundleNotFound(_) | Error::InsufficientStorage { .. } | Error::InvalidQuantity(_)
        )
    }
}

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use metrics::Metrics;

/// Remote shell access to cluster nodes
pub mod ssh;

/// CRDs owned and consumed by the operator
pub mod resources;

pub use controllers::{OperatorConfig, State};
