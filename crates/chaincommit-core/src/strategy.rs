//! Commit strategies: pure aggregation of per-peer outcomes into a verdict.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::PeerRef;

/// Terminal report from one peer about one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitOutcome {
    Valid,
    Invalid,
    Disconnected,
}

/// Per-peer outcomes over a fixed target set. The first outcome recorded
/// for a peer wins.
#[derive(Debug, Clone)]
pub struct OutcomeLedger {
    peers: Vec<PeerRef>,
    outcomes: HashMap<PeerRef, CommitOutcome>,
}

impl OutcomeLedger {
    pub fn new(peers: Vec<PeerRef>) -> Self {
        Self {
            peers,
            outcomes: HashMap::new(),
        }
    }

    /// Record `outcome` for `peer`. Returns `false` when the peer is not a
    /// target or has already reported.
    pub fn record(&mut self, peer: &PeerRef, outcome: CommitOutcome) -> bool {
        if !self.peers.contains(peer) || self.outcomes.contains_key(peer) {
            return false;
        }
        self.outcomes.insert(peer.clone(), outcome);
        true
    }

    pub fn outcome(&self, peer: &PeerRef) -> Option<CommitOutcome> {
        self.outcomes.get(peer).copied()
    }

    pub fn count(&self, outcome: CommitOutcome) -> usize {
        self.outcomes.values().filter(|o| **o == outcome).count()
    }

    pub fn all_reported(&self) -> bool {
        self.outcomes.len() == self.peers.len()
    }

    /// Names of the peers that reported `outcome`, in target order.
    pub fn peers_with(&self, outcome: CommitOutcome) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| self.outcome(p) == Some(outcome))
            .map(|p| p.name().to_string())
            .collect()
    }

    pub fn peers(&self) -> &[PeerRef] {
        &self.peers
    }
}

/// Final decision of a strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    /// Named peers reported the transaction invalid.
    Rejected { peers: Vec<String> },
    /// No peer could confirm the transaction.
    Unreachable { peers: Vec<String> },
}

/// Decides, from the outcomes so far, whether a commit has succeeded or
/// failed. `None` means "keep waiting".
pub trait CommitStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, ledger: &OutcomeLedger) -> Option<Verdict>;
}

/// Every target peer must report; any `Invalid` fails immediately. With all
/// peers reported, success needs at least one `Valid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllCommitStrategy;

impl CommitStrategy for AllCommitStrategy {
    fn name(&self) -> &'static str {
        "all"
    }

    fn evaluate(&self, ledger: &OutcomeLedger) -> Option<Verdict> {
        if ledger.count(CommitOutcome::Invalid) > 0 {
            return Some(Verdict::Rejected {
                peers: ledger.peers_with(CommitOutcome::Invalid),
            });
        }
        if !ledger.all_reported() {
            return None;
        }
        if ledger.count(CommitOutcome::Valid) > 0 {
            Some(Verdict::Succeeded)
        } else {
            Some(Verdict::Unreachable {
                peers: ledger.peers_with(CommitOutcome::Disconnected),
            })
        }
    }
}

/// The first `Valid` succeeds. Fails only once every peer has reported
/// without a `Valid`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyCommitStrategy;

impl CommitStrategy for AnyCommitStrategy {
    fn name(&self) -> &'static str {
        "any"
    }

    fn evaluate(&self, ledger: &OutcomeLedger) -> Option<Verdict> {
        if ledger.count(CommitOutcome::Valid) > 0 {
            return Some(Verdict::Succeeded);
        }
        if !ledger.all_reported() {
            return None;
        }
        let invalid = ledger.peers_with(CommitOutcome::Invalid);
        if invalid.is_empty() {
            Some(Verdict::Unreachable {
                peers: ledger.peers_with(CommitOutcome::Disconnected),
            })
        } else {
            Some(Verdict::Rejected { peers: invalid })
        }
    }
}

/// Which peers a commit handler waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerScope {
    /// Event-source peers of the caller's own organization.
    Organization,
    /// Every event-source peer on the channel.
    Network,
}

impl PeerScope {
    pub fn resolve(&self, peers: &[PeerRef], organization: &str) -> Vec<PeerRef> {
        peers
            .iter()
            .filter(|p| p.is_event_source())
            .filter(|p| match self {
                PeerScope::Organization => p.organization() == organization,
                PeerScope::Network => true,
            })
            .cloned()
            .collect()
    }
}
