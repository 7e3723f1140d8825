//! Network side of pixstash.
//!
//! This crate provides the HTTP transport and the remote fetch pipeline that
//! the dispatcher uses as its resolver.

pub mod fetch;
pub mod pipeline;

pub use fetch::{Body, FetchConfig, HttpTransport, Transport, UrlError, parse_image_url};
pub use pipeline::{HTTP_CACHE_NAMESPACE, PipelineConfig, RemoteFetchPipeline};
