//! Upstream agent connectivity.

mod client;
mod error;

pub use client::{CallerIdentity, UpstreamClient};
pub use error::{UpstreamError, UpstreamResult};
