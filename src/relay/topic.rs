//! Topic rewriting and MQTT topic validation
//!
//! The relay maps every inbound topic to an outbound one through a
//! [`TopicTransformer`]. Any `Fn(&str) -> String` closure qualifies; the
//! service binary uses the config-driven [`TopicRewrite`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pure mapping from an inbound topic to the topic the message is republished on
pub trait TopicTransformer: Send + Sync {
    fn transform(&self, source_topic: &str) -> String;
}

impl<F> TopicTransformer for F
where
    F: Fn(&str) -> String + Send + Sync,
{
    fn transform(&self, source_topic: &str) -> String {
        self(source_topic)
    }
}

/// Prefix/suffix rewrite rule, applied as strip, then prepend, then append
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRewrite {
    /// Removed from the start of the topic when present
    pub strip_prefix: Option<String>,
    /// Added to the start of the topic
    pub prepend: Option<String>,
    /// Added to the end of the topic
    pub append: Option<String>,
}

impl TopicRewrite {
    pub fn prepend(prefix: impl Into<String>) -> Self {
        Self {
            prepend: Some(prefix.into()),
            ..Default::default()
        }
    }

    /// Reject rules that could only ever produce unpublishable topics
    pub fn validate(&self) -> Result<(), TopicError> {
        for part in [&self.prepend, &self.append].into_iter().flatten() {
            if let Some(ch) = part.chars().find(|c| matches!(c, '+' | '#' | '\0')) {
                return Err(TopicError::WildcardInTopicName(ch));
            }
        }
        Ok(())
    }

    /// True when the rule leaves every topic unchanged
    pub fn is_identity(&self) -> bool {
        let empty = |part: &Option<String>| part.as_deref().map_or(true, str::is_empty);
        empty(&self.strip_prefix) && empty(&self.prepend) && empty(&self.append)
    }
}

impl TopicTransformer for TopicRewrite {
    fn transform(&self, source_topic: &str) -> String {
        let stripped = match &self.strip_prefix {
            Some(prefix) => source_topic.strip_prefix(prefix.as_str()).unwrap_or(source_topic),
            None => source_topic,
        };

        let mut topic = String::with_capacity(
            stripped.len()
                + self.prepend.as_ref().map_or(0, String::len)
                + self.append.as_ref().map_or(0, String::len),
        );
        if let Some(prefix) = &self.prepend {
            topic.push_str(prefix);
        }
        topic.push_str(stripped);
        if let Some(suffix) = &self.append {
            topic.push_str(suffix);
        }
        topic
    }
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains NUL character")]
    NulCharacter,
    #[error("Topic exceeds 65535 bytes")]
    TooLong,
    #[error("Multi-level wildcard '#' must be the last level and occupy it entirely")]
    MisplacedMultiLevelWildcard,
    #[error("Single-level wildcard '+' must occupy an entire level")]
    MisplacedSingleLevelWildcard,
    #[error("Topic name contains wildcard character: '{0}'")]
    WildcardInTopicName(char),
}

const MAX_TOPIC_BYTES: usize = 65_535;

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a subscription filter, which may contain `+` and `#` wildcards
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TopicError::MisplacedMultiLevelWildcard);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedSingleLevelWildcard);
        }
    }
    Ok(())
}

/// Validate a topic name used for publishing; wildcards are not allowed
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    match topic.chars().find(|c| matches!(c, '+' | '#')) {
        Some(ch) => Err(TopicError::WildcardInTopicName(ch)),
        None => Ok(()),
    }
}
