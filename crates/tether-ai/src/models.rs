//! Context window sizes per model family.

/// Ceiling used when a model is not in the table.
pub const DEFAULT_CONTEXT_LIMIT: u32 = 100_000;

/// Family prefixes and their context windows. Longer prefixes are listed
/// before shorter ones sharing a stem, the first match wins.
const CONTEXT_LIMITS: &[(&str, u32)] = &[
    ("claude", 200_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("gpt-5", 400_000),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4", 200_000),
    ("gemini-1.5", 1_000_000),
    ("gemini-2", 1_048_576),
    ("gemini", 1_000_000),
    ("grok", 131_072),
    ("llama-3", 128_000),
    ("llama", 8_192),
    ("deepseek", 64_000),
    ("mistral-large", 128_000),
    ("mistral", 32_000),
    ("qwen", 32_768),
];

/// Strip vendor prefixes (`openai/gpt-4o`) and trailing modifiers
/// (`gpt-4o:online`, `llama-3-70b:free`) from a model identifier.
pub fn base_model_id(model: &str) -> &str {
    let without_modifier = model.split(':').next().unwrap_or(model);
    without_modifier
        .rsplit('/')
        .next()
        .unwrap_or(without_modifier)
}

/// Look up the context window for a model identifier.
pub fn context_limit(model: &str) -> u32 {
    let id = base_model_id(model).to_lowercase();
    CONTEXT_LIMITS
        .iter()
        .find(|(prefix, _)| id.starts_with(prefix))
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_CONTEXT_LIMIT)
}
