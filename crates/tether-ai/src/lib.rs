//! tether-ai: provider layer for the tether agent runtime
//!
//! Message and content types shared by every crate in the workspace, the
//! streaming event vocabulary a provider speaks, provider error
//! classification, the per-model context limit table, and an
//! OpenAI-compatible streaming provider.

pub mod error;
pub mod models;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use stream::{StreamEvent, StreamEventStream};
pub use types::*;
