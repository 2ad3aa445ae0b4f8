//! Embedded page-context scripts.
//!
//! The element-index walker runs inside the page, so it ships as a
//! JavaScript bundle kept in its own `.js` file (editors get highlighting,
//! the crate gets a compile-time string via `include_str!`).

/// Embedded contents of `scripts/element_index.js`.
pub const ELEMENT_INDEX_SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/scripts/element_index.js"
));

/// The walker expression evaluated to capture a snapshot.
///
/// A function so tests can substitute truncated fixtures while production
/// code keeps the embedded bundle.
pub fn element_index_script() -> &'static str {
    ELEMENT_INDEX_SCRIPT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_script_is_non_empty() {
        assert!(!ELEMENT_INDEX_SCRIPT.trim().is_empty());
    }

    #[test]
    fn embedded_script_walks_iframes() {
        assert!(
            ELEMENT_INDEX_SCRIPT.contains("contentDocument"),
            "walker should descend into same-origin iframes"
        );
    }

    #[test]
    fn embedded_script_is_an_expression() {
        let trimmed = ELEMENT_INDEX_SCRIPT.trim_end();
        assert!(
            trimmed.ends_with("})()"),
            "walker must be an immediately-invoked expression so evaluate() returns the records"
        );
    }
}
