//! Relay allow/deny policy
//!
//! Decides which remote hosts may open connections through a socket relay.

use serde::{Deserialize, Serialize};

use crate::host::normalize_host;

/// Host whitelist and blacklist for a relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPolicy {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl RelayPolicy {
    pub fn new(whitelist: Vec<String>, blacklist: Vec<String>) -> Self {
        Self {
            whitelist: whitelist.into_iter().map(|p| p.trim().to_lowercase()).collect(),
            blacklist: blacklist.into_iter().map(|p| p.trim().to_lowercase()).collect(),
        }
    }

    /// Builds a policy from comma separated pattern lists
    pub fn from_csv(whitelist: &str, blacklist: &str) -> Self {
        let split = |s: &str| -> Vec<String> {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        };
        Self::new(split(whitelist), split(blacklist))
    }

    /// Check if a remote host may use the relay
    ///
    /// The blacklist is evaluated first and wins. A non-empty whitelist must
    /// then match.
    pub fn is_allowed(&self, host: &str) -> bool {
        let host = normalize_host(host);

        if self.blacklist.iter().any(|p| matches_host(p, &host)) {
            return false;
        }

        // Empty whitelist means allow all hosts
        if self.whitelist.is_empty() {
            return true;
        }

        self.whitelist.iter().any(|p| matches_host(p, &host))
    }
}

/// Pattern match supporting exact names, `*` and `*.suffix`
///
/// `*.example.com` matches `a.example.com` and `example.com` itself.
pub fn matches_host(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host == suffix || host.ends_with(&format!(".{}", suffix));
    }
    normalize_host(pattern) == host
}
