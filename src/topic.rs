//! Topic name and topic filter rules.
//!
//! Topic names (used when publishing) never contain wildcards. Topic filters (used
//! when subscribing) may use `+` for exactly one level and `#` for the rest of the
//! tree, and each wildcard must occupy a whole level.

/// Returns `true` if `topic` can be used as the topic of a PUBLISH.
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= u16::MAX as usize
        && !topic.contains(['+', '#', '\0'])
}

/// Returns `true` if `filter` can be used in SUBSCRIBE/UNSUBSCRIBE.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > u16::MAX as usize || filter.contains('\0') {
        return false;
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" => return levels.peek().is_none(),
            "+" => {}
            _ if level.contains(['+', '#']) => return false,
            _ => {}
        }
    }
    true
}

/// Returns `true` if `topic` is matched by `filter`.
///
/// Topics beginning with `$` are not matched by filters starting with a wildcard.
pub fn matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
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
    fn topic_names_reject_wildcards() {
        assert!(is_valid_topic_name("sensors/room1/temp"));
        assert!(is_valid_topic_name("/"));
        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("sensors/+/temp"));
        assert!(!is_valid_topic_name("sensors/#"));
    }

    #[test]
    fn filters_require_whole_level_wildcards() {
        assert!(is_valid_topic_filter("sensors/+/temp"));
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("sensors/#"));
        assert!(is_valid_topic_filter("+"));
        assert!(!is_valid_topic_filter("sensors/#/temp"));
        assert!(!is_valid_topic_filter("sensors/room+/temp"));
        assert!(!is_valid_topic_filter("sensors#"));
        assert!(!is_valid_topic_filter(""));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("sensors/+/temp", "sensors/room1/temp"));
        assert!(!matches("sensors/+/temp", "sensors/room1/humidity"));
        assert!(!matches("sensors/+/temp", "sensors/a/b/temp"));
        assert!(matches("sensors/+", "sensors/"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("sensors/#", "sensors"));
        assert!(matches("sensors/#", "sensors/room1/temp"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("sensors/#", "actuators/fan"));
    }

    #[test]
    fn system_topics_hidden_from_leading_wildcards() {
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/#", "$SYS/uptime"));
    }
}
