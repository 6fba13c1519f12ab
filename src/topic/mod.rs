//! Topic names and filters
//!
//! Validation keeps malformed names off the wire: a broker drops a client
//! that publishes to an empty or wildcard topic. Matching is used by the
//! in-memory broker to route publishes to subscribers.

/// Longest topic the wire format can carry
const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name (used in PUBLISH)
///
/// Topic names must be non-empty, at most 65535 bytes, and free of NUL and
/// of the `+` and `#` wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE and UNSUBSCRIBE)
///
/// `+` must fill a whole level; `#` must fill the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }
    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err("multi-level wildcard must be the last level");
        }
        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy an entire level");
        }
    }
    Ok(())
}

/// Check whether a topic name matches a subscription filter.
///
/// `+` matches exactly one level, `#` matches the remaining levels including
/// the parent level. Topics starting with `$` never match a filter whose
/// first level is a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert!(validate_topic_name("a/b").is_ok());
        assert!(validate_topic_name("/").is_ok());
        assert!(validate_topic_name("$SYS/x").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("a/+").is_err());
        assert!(validate_topic_name("a/#").is_err());
        assert!(validate_topic_name("a+b").is_err());
        assert!(validate_topic_name("a\0b").is_err());
        assert!(validate_topic_name(&"x".repeat(65536)).is_err());
    }

    #[test]
    fn test_topic_filters() {
        assert!(validate_topic_filter("a/b").is_ok());
        assert!(validate_topic_filter("+/b/+").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/b").is_err());
        assert!(validate_topic_filter("a#").is_err());
        assert!(validate_topic_filter("a/b+").is_err());
    }

    #[test]
    fn test_exact_matches() {
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches_filter("test/topic", "test/+"));
        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("test", "+/+"));
        assert!(!topic_matches_filter("test/topic/extra", "test/+"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches_filter("test/topic/more", "#"));
        assert!(topic_matches_filter("test/topic/more", "test/#"));
        assert!(topic_matches_filter("test", "test/#"));
        assert!(!topic_matches_filter("other/topic", "test/#"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
    }
}
