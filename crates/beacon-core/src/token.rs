//! Topic names and topic filters.
//!
//! A topic name is a concrete `/`-separated destination such as
//! `sensors/7/temp`. A topic filter may contain `+` (exactly one level) and
//! `#` (all remaining levels), and may be wrapped as a shared subscription,
//! `$share/{group}/{filter}`, so that one member of the group receives each
//! message.

use std::fmt;
use thiserror::Error;

/// Maximum encoded length of a topic name or filter.
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Prefix of a shared-subscription filter.
pub const SHARE_PREFIX: &str = "$share/";

/// First character of reserved system topics.
const SYSTEM_PREFIX: char = '$';

/// Topic parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    /// Malformed topic filter.
    #[error("Invalid topic filter '{filter}': {reason}")]
    InvalidFilter {
        filter: String,
        reason: &'static str,
    },

    /// Malformed topic name.
    #[error("Invalid topic name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Level {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A parsed topic name or topic filter.
///
/// Immutable once parsed. For shared filters [`TopicToken::filter`] is the
/// inner filter and [`TopicToken::as_str`] is the full `$share/...` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicToken {
    raw: String,
    filter_start: usize,
    levels: Vec<Level>,
    single_level: bool,
    multi_level: bool,
    share_group: Option<String>,
}

impl TopicToken {
    /// Parse a subscription filter.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError::InvalidFilter`] if a wildcard does not occupy a
    /// whole level, `#` is not the last level, or a shared filter lacks a
    /// group or inner filter.
    pub fn parse_filter(filter: &str) -> Result<Self, TopicError> {
        let invalid = |reason| TopicError::InvalidFilter {
            filter: filter.to_string(),
            reason,
        };

        check_common(filter).map_err(invalid)?;

        let (share_group, inner) = match filter.strip_prefix(SHARE_PREFIX) {
            Some(rest) => {
                let (group, inner) = rest
                    .split_once('/')
                    .ok_or_else(|| invalid("shared filter needs a group and a filter"))?;
                if group.is_empty() {
                    return Err(invalid("shared group name cannot be empty"));
                }
                if group.contains(['+', '#']) {
                    return Err(invalid("shared group name cannot contain wildcards"));
                }
                if inner.is_empty() {
                    return Err(invalid("shared filter cannot be empty"));
                }
                (Some(group.to_string()), inner)
            }
            None => (None, filter),
        };

        let count = inner.split('/').count();
        let mut levels = Vec::with_capacity(count);
        let mut single_level = false;
        let mut multi_level = false;

        for (index, level) in inner.split('/').enumerate() {
            match level {
                "+" => {
                    single_level = true;
                    levels.push(Level::SingleLevel);
                }
                "#" => {
                    if index + 1 != count {
                        return Err(invalid("'#' must be the last level"));
                    }
                    multi_level = true;
                    levels.push(Level::MultiLevel);
                }
                literal if literal.contains(['+', '#']) => {
                    return Err(invalid("wildcards must occupy an entire level"));
                }
                literal => levels.push(Level::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            raw: filter.to_string(),
            filter_start: filter.len() - inner.len(),
            levels,
            single_level,
            multi_level,
            share_group,
        })
    }

    /// Parse a concrete topic name, as carried by a publish.
    ///
    /// # Errors
    ///
    /// Returns [`TopicError::InvalidName`] if the name is empty, too long, or
    /// contains a wildcard.
    pub fn parse_name(name: &str) -> Result<Self, TopicError> {
        let invalid = |reason| TopicError::InvalidName {
            name: name.to_string(),
            reason,
        };

        check_common(name).map_err(invalid)?;
        if name.contains(['+', '#']) {
            return Err(invalid("topic names cannot contain wildcards"));
        }

        Ok(Self {
            raw: name.to_string(),
            filter_start: 0,
            levels: name
                .split('/')
                .map(|level| Level::Literal(level.to_string()))
                .collect(),
            single_level: false,
            multi_level: false,
            share_group: None,
        })
    }

    /// The string this token was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The filter without any `$share/{group}/` prefix.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.raw[self.filter_start..]
    }

    /// The shared-subscription group, if any.
    #[must_use]
    pub fn share_group(&self) -> Option<&str> {
        self.share_group.as_deref()
    }

    /// Whether this is a shared-subscription filter.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.share_group.is_some()
    }

    /// Whether the filter contains `+` or `#`.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.single_level || self.multi_level
    }

    /// Whether the filter contains `+`.
    #[must_use]
    pub fn has_single_level_wildcard(&self) -> bool {
        self.single_level
    }

    /// Whether the filter ends with `#`.
    #[must_use]
    pub fn has_multi_level_wildcard(&self) -> bool {
        self.multi_level
    }

    /// Number of levels in the (inner) filter.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Check whether a concrete topic name matches this filter.
    ///
    /// Topics starting with `$` are never matched by a filter whose first
    /// level is a wildcard.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with(SYSTEM_PREFIX)
            && matches!(
                self.levels.first(),
                Some(Level::SingleLevel | Level::MultiLevel)
            )
        {
            return false;
        }

        let mut names = topic.split('/');
        for level in &self.levels {
            match level {
                Level::MultiLevel => return true,
                Level::SingleLevel => {
                    if names.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(literal) => match names.next() {
                    Some(name) if name == literal => {}
                    _ => return false,
                },
            }
        }
        names.next().is_none()
    }
}

impl fmt::Display for TopicToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Check a filter string against a topic name.
///
/// Malformed filters match nothing.
#[must_use]
pub fn matches(filter: &str, topic: &str) -> bool {
    TopicToken::parse_filter(filter)
        .map(|token| token.matches(topic))
        .unwrap_or(false)
}

fn check_common(value: &str) -> Result<(), &'static str> {
    if value.is_empty() {
        return Err("cannot be empty");
    }
    if value.len() > MAX_TOPIC_LENGTH {
        return Err("too long");
    }
    if value.contains('\0') {
        return Err("contains a NUL character");
    }
    Ok(())
}
