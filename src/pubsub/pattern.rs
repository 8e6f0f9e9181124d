//! # Channel Matching
//!
//! Literal subscriptions match one channel name exactly. Pattern
//! subscriptions use glob syntax: `*` any run of characters, `?` one
//! character, `[abc]` / `[a-z]` / `[!abc]` character classes, `\x` a literal
//! `x`.

use regex::Regex;

use super::errors::{PubSubError, PubSubResult};

/// How a subscription selects channels
#[derive(Debug, Clone)]
pub enum ChannelMatcher {
    /// Exact channel name
    Literal(String),
    /// Compiled glob
    Pattern { glob: String, regex: Regex },
}

impl ChannelMatcher {
    /// Build a matcher for a subscription
    pub fn new(channel: &str, is_pattern: bool) -> PubSubResult<Self> {
        if channel.is_empty() {
            return Err(PubSubError::InvalidChannel("channel must not be empty".into()));
        }
        if !is_pattern {
            return Ok(ChannelMatcher::Literal(channel.to_string()));
        }
        let regex = Regex::new(&glob_to_regex(channel)?)
            .map_err(|e| PubSubError::InvalidPattern(format!("{}: {}", channel, e)))?;
        Ok(ChannelMatcher::Pattern {
            glob: channel.to_string(),
            regex,
        })
    }

    /// Whether a published channel is selected
    pub fn matches(&self, channel: &str) -> bool {
        match self {
            ChannelMatcher::Literal(name) => name == channel,
            ChannelMatcher::Pattern { regex, .. } => regex.is_match(channel),
        }
    }

    /// The subscribed channel or glob as written
    pub fn source(&self) -> &str {
        match self {
            ChannelMatcher::Literal(name) => name,
            ChannelMatcher::Pattern { glob, .. } => glob,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, ChannelMatcher::Pattern { .. })
    }
}

/// Translate a glob into an anchored regex
fn glob_to_regex(glob: &str) -> PubSubResult<String> {
    let mut out = String::with_capacity(glob.len() * 2 + 2);
    out.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => out.push_str(&regex::escape("\\")),
            },
            '[' => {
                out.push('[');
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    out.push('^');
                }
                let mut closed = false;
                let mut empty = true;
                for class_char in chars.by_ref() {
                    if class_char == ']' && !empty {
                        closed = true;
                        break;
                    }
                    empty = false;
                    match class_char {
                        '\\' | '[' | ']' | '^' | '&' | '~' => {
                            out.push('\\');
                            out.push(class_char);
                        }
                        other => out.push(other),
                    }
                }
                if !closed {
                    return Err(PubSubError::InvalidPattern(format!(
                        "unterminated character class in '{}'",
                        glob
                    )));
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push('$');
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(glob: &str) -> ChannelMatcher {
        ChannelMatcher::new(glob, true).unwrap()
    }

    #[test]
    fn test_literal_is_exact() {
        let m = ChannelMatcher::new("events:report", false).unwrap();
        assert!(m.matches("events:report"));
        assert!(!m.matches("events:report:1"));
        // Glob characters are not special in literal subscriptions
        let star = ChannelMatcher::new("events:*", false).unwrap();
        assert!(!star.matches("events:report"));
        assert!(star.matches("events:*"));
    }

    #[test]
    fn test_star_and_question() {
        assert!(pattern("events:*").matches("events:report.created"));
        assert!(pattern("events:*").matches("events:"));
        assert!(!pattern("events:*").matches("audit:report"));
        assert!(pattern("user.?").matches("user.7"));
        assert!(!pattern("user.?").matches("user.42"));
    }

    #[test]
    fn test_character_classes() {
        assert!(pattern("branch-[abc]").matches("branch-b"));
        assert!(!pattern("branch-[abc]").matches("branch-d"));
        assert!(pattern("branch-[!abc]").matches("branch-d"));
        assert!(pattern("v[0-9]").matches("v5"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(pattern("a.b+c").matches("a.b+c"));
        assert!(!pattern("a.b+c").matches("axbbc"));
        assert!(pattern("lit\\*").matches("lit*"));
        assert!(!pattern("lit\\*").matches("literal"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            ChannelMatcher::new("bad[", true),
            Err(PubSubError::InvalidPattern(_))
        ));
        assert!(matches!(
            ChannelMatcher::new("", false),
            Err(PubSubError::InvalidChannel(_))
        ));
    }
}
