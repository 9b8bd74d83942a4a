use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("bad scope: {0}")]
    BadScope(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("domain error: {0}")]
    Domain(#[from] shoal_domain::DomainError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("internal dispatch error: {0}")]
    Internal(String),
}
