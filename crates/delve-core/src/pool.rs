//! Pool membership by server name.

use regex::Regex;

/// Decides whether a server name belongs to the schedulable dungeon pool.
///
/// Anything that does not match (lobby, builders, ...) is infrastructure
/// and never reserved, expired or torn down.
#[derive(Debug, Clone)]
pub struct PoolMatcher {
    pattern: Regex,
}

impl PoolMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_pool(&self, name: &str) -> bool {
        self.pattern.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }
}
