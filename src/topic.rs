//! Topic names, topic filters and wildcard matching.

/// Whether `topic` is matched by `filter`.
///
/// `+` matches exactly one level, `#` matches the remaining levels including
/// its parent (`sport/#` matches `sport`). A `#` that is not the last level
/// never matches.
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(filter_level) = filter_levels.next() {
        if filter_level == "#" {
            return filter_levels.peek().is_none();
        }

        let Some(topic_level) = topic_levels.next() else {
            return false;
        };

        if filter_level != "+" && filter_level != topic_level {
            return false;
        }
    }

    topic_levels.next().is_none()
}

/// Checks a subscription filter: non-empty, `#` only as a whole last level,
/// `+` only as a whole level.
pub fn validate_filter(filter: &str) -> Result<(), crate::Error> {
    if filter.is_empty() {
        return Err(crate::Error::ProtocolViolation("topic filter must not be empty"));
    }

    let mut levels = filter.split('/').peekable();

    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(crate::Error::Parameter("`#` must be the last level of a filter"));
        }

        if level.contains('+') && level != "+" {
            return Err(crate::Error::Parameter("`+` must occupy a whole filter level"));
        }
    }

    Ok(())
}

/// Checks a topic name used for publishing: non-empty and wildcard-free.
pub fn validate_topic(topic: &str) -> Result<(), crate::Error> {
    if topic.is_empty() {
        return Err(crate::Error::Parameter("topic must not be empty"));
    }

    if topic.contains(['+', '#']) {
        return Err(crate::Error::Parameter("topic must not contain wildcards"));
    }

    Ok(())
}
