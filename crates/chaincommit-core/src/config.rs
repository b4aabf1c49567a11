//! Event subsystem configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handler::CommitPolicy;

/// Settings for an [`EventContext`](crate::context::EventContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    /// Organization (MSP id) of the calling client, used for org-scoped policies
    pub organization: String,
    /// How submitted transactions are confirmed
    #[serde(default)]
    pub commit_policy: CommitPolicy,
    /// Default wait for a commit verdict, in milliseconds
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
}

fn default_commit_timeout_ms() -> u64 { 30_000 }

impl EventConfig {
    /// Default policy and timeout for `organization`.
    pub fn for_organization(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            commit_policy: CommitPolicy::default(),
            commit_timeout_ms: default_commit_timeout_ms(),
        }
    }

    pub fn with_commit_policy(mut self, policy: CommitPolicy) -> Self {
        self.commit_policy = policy;
        self
    }

    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout_ms = millis(timeout);
        self
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
