/// MQTT topic filter matching: `+` matches one level, a trailing `#` matches
/// the rest of the topic (including the parent level itself).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match system topics such as `$SYS/...`.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) if expected == actual => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
