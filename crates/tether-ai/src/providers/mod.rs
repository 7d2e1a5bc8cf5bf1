//! LLM provider implementations

pub mod openai;

use crate::{Error, Result};

/// Get an API key from the provided value or the first environment variable that is set
pub fn get_api_key(provided: Option<&str>, env_vars: &[&str]) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    env_vars
        .iter()
        .find_map(|var| std::env::var(var).ok())
        .ok_or(Error::InvalidApiKey)
}
