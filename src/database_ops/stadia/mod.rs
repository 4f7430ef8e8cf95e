//! Stadia batch RPC client and the spider cache built on top of it.

pub mod batch;
pub mod context;
pub mod database;
pub mod models;
pub mod parsers;
pub mod provider;
pub mod scalars;
pub mod seed;
pub mod session;
pub mod spider;
pub mod tables;
pub mod throttle;

use thiserror::Error;

pub use batch::RpcCall;
pub use database::StadiaDatabase;
pub use parsers::ParseError;
pub use provider::{ClientConfig, StadiaClient};
pub use session::{EnvSessionSource, GoogleCookies, GoogleSession, SessionError, SessionSource};
pub use spider::{Spider, SpiderOptions, StepOutcome};
pub use tables::TableName;

use crate::database_ops::store::StoreError;

/// Transport failures. None of these are retried by the client itself.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http status {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("refusing to send session cookies to {0}")]
    DisallowedOrigin(String),
    #[error("malformed batch response: {0}")]
    MalformedEnvelope(String),
    #[error("session page has no {0} token")]
    MissingToken(&'static str),
    #[error("sent {expected} calls but got {actual} responses")]
    ResponseCount { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum StadiaError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{table} {key} is required but has not been fetched")]
    DependencyMissing { table: TableName, key: String },
    #[error("requested {table} {requested} but the response describes {found}")]
    KeyMismatch {
        table: TableName,
        requested: String,
        found: String,
    },
}

impl StadiaError {
    /// Errors confined to one record's response; the spider logs these and moves on.
    pub fn is_record_local(&self) -> bool {
        matches!(
            self,
            StadiaError::Parse(ParseError::Validation { .. } | ParseError::Unsupported { .. })
                | StadiaError::KeyMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_record_local_errors() {
        let validation: StadiaError = ParseError::Validation {
            path: "[0]".into(),
            expected: "string".into(),
            found: "1".into(),
        }
        .into();
        assert!(validation.is_record_local());
        assert!(StadiaError::from(ParseError::Unsupported { what: "MyPurchases" }).is_record_local());
        assert!(!StadiaError::from(ParseError::UnknownSkuType("7".into())).is_record_local());
        assert!(!StadiaError::from(RpcError::MissingToken("SNlM0e")).is_record_local());
        assert!(!StadiaError::DependencyMissing {
            table: TableName::Player,
            key: "1234".into()
        }
        .is_record_local());
    }
}
