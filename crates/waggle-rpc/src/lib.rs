// Correlation-based RPC over a partitioned log transport.
//
// The client multiplexes many outstanding calls over one shared reply topic
// by correlation id; the server decouples log consumption from handler
// execution with a bounded work queue so a slow handler backpressures the
// consumers instead of dropping requests.
use async_trait::async_trait;

pub mod config;

mod client;
mod server;

pub use client::RpcClient;
pub use config::RpcConfig;
pub use server::{ResponsePublisher, RpcServer};
pub use waggle_wire::{Request, Response};

pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] waggle_transport::TransportError),
    #[error("wire error: {0}")]
    Wire(#[from] waggle_wire::Error),
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelation(String),
    #[error("config error: {0}")]
    Config(String),
}

/// Fault raised by a request handler. The variant name ends up in the
/// failed response body as the error classification.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("handler error: {0}")]
    Internal(String),
}

/// Application hook executed by the server's worker pool.
///
/// A handler produces one or more responses for the request; additional
/// streamed responses may also be published later through the server's
/// [`ResponsePublisher`]. Returning an error never crosses the transport:
/// the server converts it into a single terminal failed response.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> std::result::Result<Vec<Response>, HandlerError>;
}
