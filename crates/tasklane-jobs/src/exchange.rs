//! Topic exchange routing.
//!
//! A routing key has three dot-separated words, `domain.subtype.priority`.
//! Queues bind to an exchange with a pattern in which `*` matches exactly
//! one word and `#` matches zero or more.

use crate::config::ExchangeConfig;
use crate::error::{JobError, JobResult};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// A `domain.subtype.priority` routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub domain: String,
    pub subtype: String,
    pub priority: String,
}

impl RoutingKey {
    /// Builds a key from its parts.
    pub fn new(domain: impl Into<String>, subtype: impl Into<String>, priority: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            subtype: subtype.into(),
            priority: priority.into(),
        }
    }
}

impl FromStr for RoutingKey {
    type Err = JobError;

    fn from_str(key: &str) -> JobResult<Self> {
        match key.split('.').collect::<Vec<_>>().as_slice() {
            [domain, subtype, priority] if !domain.is_empty() && !subtype.is_empty() && !priority.is_empty() => {
                Ok(Self::new(*domain, *subtype, *priority))
            }
            _ => Err(JobError::Configuration(format!(
                "Routing key must be domain.subtype.priority: {key}"
            ))),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.domain, self.subtype, self.priority)
    }
}

/// Returns true if `key` matches the binding `pattern`.
pub fn topic_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((first, tail)) => (*word == "*" || word == first) && matches_words(rest, tail),
            None => false,
        },
    }
}

/// A queue bound to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub pattern: String,
}

/// Named exchange resolving routing keys to queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicExchange {
    name: String,
    bindings: Vec<QueueBinding>,
}

impl TopicExchange {
    /// Creates an exchange with no bindings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
        }
    }

    /// Builds an exchange from configuration.
    pub fn from_config(config: &ExchangeConfig) -> Self {
        config
            .bindings
            .iter()
            .fold(Self::new(&config.name), |exchange, b| exchange.bind_queue(&b.queue, &b.pattern))
    }

    /// Exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bindings in the order they were added.
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Binds `queue` with `pattern`, replacing an earlier binding of it.
    pub fn bind_queue(mut self, queue: impl Into<String>, pattern: impl Into<String>) -> Self {
        let queue = queue.into();
        self.bindings.retain(|b| b.queue != queue);
        self.bindings.push(QueueBinding {
            queue,
            pattern: pattern.into(),
        });
        self
    }

    /// Queues whose pattern matches `key`, in binding order.
    pub fn matching_queues(&self, key: &RoutingKey) -> Vec<&str> {
        let key = key.to_string();
        self.bindings
            .iter()
            .filter(|b| topic_matches(&b.pattern, &key))
            .map(|b| b.queue.as_str())
            .collect()
    }

    /// Picks the queue for `key`: a matching queue named after the key's
    /// priority (`<name>.<priority>`) wins, otherwise the first match.
    pub fn route(&self, key: &RoutingKey) -> JobResult<String> {
        let matching = self.matching_queues(key);
        let suffix = format!(".{}", key.priority);
        let queue = matching
            .iter()
            .find(|queue| queue.ends_with(&suffix))
            .or_else(|| matching.first())
            .ok_or_else(|| JobError::NoRoute(format!("{key} on exchange {}", self.name)))?;
        debug!(exchange = %self.name, routing_key = %key, queue = %queue, "Routed job");
        Ok(queue.to_string())
    }
}
