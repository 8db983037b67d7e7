//! Request and response types for the gateway.
//!
//! Every capability has an explicit, typed request record — decoding is
//! total and malformed input is reported with field paths instead of
//! surfacing as runtime surprises deep in the dispatch path.

mod capability;
mod request;
mod response;

pub use capability::Capability;
pub use request::{
    AiRequest, ChatMessage, ChatRequest, CompletionRequest, DataProcessRequest, NlpRequest,
    Priority, SubmitOptions, VisionRequest,
};
pub use response::{parse_status, ListResponse, SubmitResponse};
