use crate::ids::SourceName;

/// Prefix placed in front of every source topic title.
pub const TOPIC_PREFIX: &str = "🏰";

/// Maximum topic title length accepted by the destination.
pub const MAX_TOPIC_NAME_CHARS: usize = 128;

/// The title the engine assigns to the thread of `source`.
pub fn canonical_topic_name(source: &SourceName) -> String {
    let name = format!("{TOPIC_PREFIX} {}", collapse_whitespace(source.as_str()));
    truncate_chars(&name, MAX_TOPIC_NAME_CHARS)
}

/// Normalized form used to compare thread titles.
///
/// Whitespace runs collapse to one space and the ends are trimmed, so
/// `"🏰  Beta "` and `"🏰 Beta"` compare equal. Case is preserved.
pub fn normalize_display_name(name: &str) -> String {
    collapse_whitespace(name)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_has_prefix() {
        assert_eq!(canonical_topic_name(&SourceName::from("Beta")), "🏰 Beta");
    }

    #[test]
    fn canonical_name_collapses_padding() {
        assert_eq!(canonical_topic_name(&SourceName::from("  Beta   Hub ")), "🏰 Beta Hub");
    }

    #[test]
    fn normalization_ignores_spacing_not_case() {
        assert_eq!(normalize_display_name(" 🏰  Beta "), "🏰 Beta");
        assert_ne!(normalize_display_name("🏰 beta"), normalize_display_name("🏰 Beta"));
    }

    #[test]
    fn long_names_truncate_on_char_boundary() {
        let long = "ж".repeat(300);
        let name = canonical_topic_name(&SourceName::from(long.as_str()));
        assert_eq!(name.chars().count(), MAX_TOPIC_NAME_CHARS);
    }
}
