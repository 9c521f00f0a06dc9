//! # HTTP Gateway
//!
//! JSON API over the research engine plus a server-sent event stream per
//! session. Handlers only translate between HTTP and engine calls.

mod error;
mod routes;

pub use error::ApiError;
pub use routes::{GraphView, ResearchRequest, ResearchStarted, SessionDetail, router, serve};
