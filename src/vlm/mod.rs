//! Vision-language model backends.
//!
//! The dispatcher talks to the model only through [`VlmBackend`]. Backends
//! are shared by all concurrently running inference tasks, so they must be
//! `Send + Sync` and must give up promptly once cancelled or past the
//! request timeout.

mod backend;
pub mod backends;
mod registry;

pub use backend::{AnalyzeRequest, VlmBackend, VlmResponse};
pub use backends::{HttpBackend, HttpBackendConfig, StubBackend, StubCall};
pub use registry::BackendRegistry;
