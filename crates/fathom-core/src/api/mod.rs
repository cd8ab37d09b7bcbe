pub mod error;
pub mod provider;

pub use error::{TransportError, TransportErrorKind};
pub use provider::{
    CompletionRequest, CompletionResponse, CompletionStream, Provider, StreamChunk,
};
