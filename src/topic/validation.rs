//! Topic name validation
//!
//! Every topic the bridge registers is a plain MQTT topic name underneath:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic names MUST NOT contain the null character
//! - Topic names are at most 65535 bytes

/// Validate a topic name
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > 65535 {
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

/// Validate the prefix placed in front of every bridge topic
///
/// The prefix is joined to relative paths without a separator, so it must
/// end with `/`. A leading `$` would put the topics in the broker's system
/// namespace.
pub fn validate_prefix(prefix: &str) -> Result<(), &'static str> {
    validate_topic_name(prefix)?;

    if !prefix.ends_with('/') {
        return Err("prefix must end with '/'");
    }

    if prefix.starts_with('$') {
        return Err("prefix cannot start with '$'");
    }

    Ok(())
}
