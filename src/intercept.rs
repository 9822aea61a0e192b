//! Interception rule: which tunnels to decrypt and which requests to manage

use regex::Regex;
use tracing::debug;

use crate::config::InterceptConfig;
use crate::message::Request;
use crate::{GenproxyError, Result};

/// Two independent predicates over connections and requests.
///
/// `should_intercept` runs once per CONNECT, before any request is visible.
/// `is_managed` runs per request and gates entry into the engine; anything it
/// rejects is forwarded untouched.
#[derive(Debug, Clone)]
pub struct InterceptionRule {
    connect_hosts: Regex,
    destination: Regex,
}

impl InterceptionRule {
    /// Compile the rule from configured patterns
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either pattern is not a valid regex
    pub fn new(connect_hosts: &str, destination: &str) -> Result<Self> {
        let connect_hosts = Regex::new(connect_hosts).map_err(|e| {
            GenproxyError::Config(format!("Invalid connect host pattern '{connect_hosts}': {e}"))
        })?;
        let destination = Regex::new(destination).map_err(|e| {
            GenproxyError::Config(format!("Invalid destination pattern '{destination}': {e}"))
        })?;

        Ok(Self {
            connect_hosts,
            destination,
        })
    }

    /// Compile the rule from the `[intercept]` config section
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either pattern is invalid
    pub fn from_config(config: &InterceptConfig) -> Result<Self> {
        Self::new(&config.connect_hosts, &config.destination)
    }

    /// Whether a CONNECT tunnel to `authority` (`host:port`) should be decrypted
    #[must_use]
    pub fn should_intercept(&self, authority: &str) -> bool {
        let matched = self.connect_hosts.is_match(authority);
        debug!("CONNECT {} intercept={}", authority, matched);
        matched
    }

    /// Whether a request's destination is subject to record/playback
    #[must_use]
    pub fn is_managed(&self, request: &Request) -> bool {
        request
            .destination()
            .is_some_and(|destination| self.destination.is_match(&destination))
    }

    /// Destination pattern source, for startup logs
    #[must_use]
    pub fn destination_pattern(&self) -> &str {
        self.destination.as_str()
    }
}
