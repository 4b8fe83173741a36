//! Subscription patterns: exact type strings, `*` wildcards, or compiled
//! regexes. Wildcards translate `*` to `.*` inside a fully anchored regex,
//! so `agent:*` matches `agent:busy` but not `workflow:started`.

use regex::Regex;

/// How a subscription decides which event types it wants.
#[derive(Debug, Clone)]
pub enum SubscriptionPattern {
    /// Byte-for-byte type match.
    Exact(String),
    /// Glob with `*` wildcards, compiled to an anchored regex.
    Wildcard {
        /// The glob as the subscriber wrote it.
        raw: String,
        /// Compiled anchored regex.
        regex: Regex,
    },
    /// A caller-supplied regex, used as-is.
    Regex {
        /// Compiled regex.
        regex: Regex,
    },
}

impl SubscriptionPattern {
    /// Parse a pattern string: globs containing `*` compile to wildcards,
    /// everything else matches exactly.
    pub fn parse(raw: &str) -> Self {
        if !raw.contains('*') {
            return Self::Exact(raw.to_string());
        }
        let mut pattern = String::with_capacity(raw.len() + 4);
        pattern.push('^');
        for ch in raw.chars() {
            if ch == '*' {
                pattern.push_str(".*");
            } else {
                pattern.push_str(&regex::escape(&ch.to_string()));
            }
        }
        pattern.push('$');
        match Regex::new(&pattern) {
            Ok(regex) => Self::Wildcard {
                raw: raw.to_string(),
                regex,
            },
            // Escaped input cannot produce an invalid regex; degrade to an
            // exact match rather than panic if it somehow does.
            Err(_) => Self::Exact(raw.to_string()),
        }
    }

    /// Whether the pattern matches an event type.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == event_type,
            Self::Wildcard { regex, .. } => regex.is_match(event_type),
            Self::Regex { regex } => regex.is_match(event_type),
        }
    }

    /// The pattern as the subscriber supplied it, used by
    /// pattern-addressed unsubscription.
    pub fn raw(&self) -> &str {
        match self {
            Self::Exact(exact) => exact,
            Self::Wildcard { raw, .. } => raw,
            Self::Regex { regex } => regex.as_str(),
        }
    }
}

impl From<&str> for SubscriptionPattern {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for SubscriptionPattern {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<Regex> for SubscriptionPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex { regex }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_matches_exactly() {
        let pattern = SubscriptionPattern::parse("agent.busy");
        assert!(pattern.matches("agent.busy"));
        assert!(!pattern.matches("agent.busyness"));
        assert!(!pattern.matches("agent"));
    }

    #[test]
    fn wildcard_is_anchored() {
        let pattern = SubscriptionPattern::parse("agent:*");
        assert!(pattern.matches("agent:spawned"));
        assert!(pattern.matches("agent:"));
        assert!(!pattern.matches("subagent:spawned"));
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        let pattern = SubscriptionPattern::parse("agent.busy");
        assert!(!pattern.matches("agentXbusy"));
        let dotted = SubscriptionPattern::parse("agent.*");
        assert!(dotted.matches("agent.idle"));
        assert!(!dotted.matches("agentidle"));
    }

    #[test]
    fn regex_pattern_passes_through() {
        let pattern = SubscriptionPattern::from(Regex::new(r"^task:(started|completed)$").unwrap());
        assert!(pattern.matches("task:started"));
        assert!(pattern.matches("task:completed"));
        assert!(!pattern.matches("task:failed"));
    }

    #[test]
    fn raw_round_trips() {
        assert_eq!(SubscriptionPattern::parse("agent:*").raw(), "agent:*");
        assert_eq!(SubscriptionPattern::parse("exact").raw(), "exact");
    }
}
