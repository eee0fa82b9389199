//! Known text models served by the generation backend.

/// Model used when neither the caller nor the config names one
pub const DEFAULT_MODEL: &str = "gemma-3-27b-it";

/// Text and vision models the backend accepts
pub const TEXT_MODELS: &[&str] = &["gemini-2.5-flash", "gemini-2.0-flash-exp", "gemma-3-27b-it"];

/// Get all known model ids.
pub fn available() -> &'static [&'static str] {
    TEXT_MODELS
}

/// Whether the backend is known to serve this model id.
pub fn is_known(id: &str) -> bool {
    TEXT_MODELS.contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_known() {
        assert!(is_known(DEFAULT_MODEL));
    }

    #[test]
    fn test_unknown_model() {
        assert!(!is_known("gpt-4o"));
        assert_eq!(available().len(), 3);
    }
}
