//! Tool dispatch value objects
//!
//! Requests, correlation ids, cache keys and responses exchanged between
//! callers, the dispatcher and the engine over `mcp_request`/`mcp_response`.

pub mod request;
pub mod response;

pub use request::{CacheKey, CorrelationId, RequestEnvelope, RequestState, ToolRequest};
pub use response::{ResponseEnvelope, ToolResponse};
