//! Routing of outgoing turns between streamed chat and image generation

use parley_ai::Part;
use regex::Regex;
use std::sync::LazyLock;

/// Where an outgoing turn is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// The streaming text endpoint
    Stream,
    /// The one-shot image generation endpoint
    Image,
}

static IMAGE_INTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(create|generate|draw|make|design|show me|picture of|photo of|image of|illustration of)\b",
    )
    .expect("image intent pattern is valid")
});

/// Whether the text asks for an image to be produced
pub fn wants_image(text: &str) -> bool {
    IMAGE_INTENT.is_match(text)
}

/// Route to image generation iff the text matches an intent keyword and no
/// outgoing part carries inline image data.
pub fn classify(text: &str, parts: &[Part]) -> Route {
    let has_attachment = parts.iter().any(Part::has_inline_data);
    if wants_image(text) && !has_attachment {
        Route::Image
    } else {
        Route::Stream
    }
}
