use std::borrow::Cow;

/// Truncation classes for string values.
///
/// Limits are counted in characters, not bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Limit {
    /// Names and property keys.
    Name,
    /// Generic strings.
    String,
    /// Trace messages.
    Message,
    /// Exception messages and stacks.
    Exception,
    /// URLs.
    Url,
    /// Identifiers.
    Id,
    /// Values of custom properties.
    PropertyValue,
}

impl Limit {
    /// Returns the maximum number of characters for this class.
    pub const fn max_chars(self) -> usize {
        match self {
            Limit::Name => 150,
            Limit::String => 1024,
            Limit::Message | Limit::Exception => 32768,
            Limit::Url => 2048,
            Limit::Id => 128,
            Limit::PropertyValue => 8192,
        }
    }
}

/// Truncates `value` to the limit's maximum number of characters.
///
/// Returns the input unchanged if it fits, so truncating twice is a no-op.
///
/// # Example
///
/// ```
/// use courier_protocol::{Limit, truncate};
///
/// let long = "x".repeat(200);
/// assert_eq!(truncate(&long, Limit::Name).chars().count(), 150);
/// assert_eq!(truncate("short", Limit::Name), "short");
/// ```
pub fn truncate(value: &str, limit: Limit) -> Cow<'_, str> {
    truncate_chars(value, limit.max_chars())
}

fn truncate_chars(value: &str, max: usize) -> Cow<'_, str> {
    match value.char_indices().nth(max) {
        Some((index, _)) => Cow::Owned(value[..index].to_owned()),
        None => Cow::Borrowed(value),
    }
}

/// Sanitizes a property key and makes it unique among the keys already `taken`.
///
/// Keys are trimmed and truncated to [`Limit::Name`]. If truncation makes the key collide with
/// an existing key, a three digit counter is appended (`001`, `002`, ...) while keeping the
/// result within the limit. Returns the key and whether it was truncated.
pub fn sanitize_key(key: &str, taken: impl Fn(&str) -> bool) -> (String, bool) {
    let trimmed = key.trim();
    let truncated = truncate(trimmed, Limit::Name);

    if let Cow::Borrowed(fits) = truncated {
        return (fits.to_owned(), false);
    }

    let mut candidate = truncated.into_owned();
    let prefix = truncate_chars(&candidate, Limit::Name.max_chars() - 3).into_owned();

    let mut counter = 0;
    while taken(&candidate) && counter < 999 {
        counter += 1;
        candidate = format!("{prefix}{counter:03}");
    }

    (candidate, true)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn test_truncate_exact_limit_is_noop() {
        let value = "a".repeat(Limit::Id.max_chars());
        assert!(matches!(truncate(&value, Limit::Id), Cow::Borrowed(_)));
    }

    #[test]
    fn test_truncate_one_over() {
        let value = "a".repeat(Limit::Id.max_chars() + 1);
        let truncated = truncate(&value, Limit::Id);
        assert_eq!(truncated.chars().count(), Limit::Id.max_chars());

        let again = truncate(&truncated, Limit::Id);
        assert!(matches!(again, Cow::Borrowed(_)));
    }

    #[test]
    fn test_truncate_counts_chars() {
        let value = "ü".repeat(151);
        let truncated = truncate(&value, Limit::Name);
        assert_eq!(truncated.chars().count(), 150);
        assert_eq!(truncated.len(), 300);
    }

    #[test]
    fn test_sanitize_key_unique_suffix() {
        let long = format!("{}tail", "k".repeat(150));
        let mut taken = BTreeSet::new();

        let (first, truncated) = sanitize_key(&long, |k| taken.contains(k));
        assert!(truncated);
        assert_eq!(first, "k".repeat(150));
        taken.insert(first);

        let (second, _) = sanitize_key(&long, |k| taken.contains(k));
        assert_eq!(second, format!("{}001", "k".repeat(147)));
        taken.insert(second);

        let (third, _) = sanitize_key(&long, |k| taken.contains(k));
        assert_eq!(third, format!("{}002", "k".repeat(147)));
    }

    #[test]
    fn test_sanitize_key_short_keys_untouched() {
        let (key, truncated) = sanitize_key("  region ", |_| true);
        assert_eq!(key, "region");
        assert!(!truncated);
    }
}
