//! Small string helpers.

/// Truncate `s` to at most `max_bytes`, backing off to a char boundary.
#[must_use]
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Number of characters (not bytes) in `s`.
#[must_use]
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundary() {
        assert_eq!(truncate_str("héllo", 2), "h");
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello", 3), "hel");
    }

    #[test]
    fn char_len_counts_scalars() {
        assert_eq!(char_len("héllo"), 5);
        assert_eq!(char_len(""), 0);
    }
}
