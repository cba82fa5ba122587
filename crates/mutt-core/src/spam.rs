//! Relay flood protection.
//!
//! Counts barks each neighbour asks us to relay. A neighbour is banned when
//! it exceeds the relay rate, or when it repeats the same bark more often
//! than an honest retry schedule would. Bans last for the life of the
//! runtime and are keyed by advertised endpoint name.
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::config::MuttConfig;
use crate::types::BarkKey;

/// Limits applied to relayed barks, per neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpamLimits {
    /// Length of the sliding window.
    pub window: Duration,
    /// Most barks accepted from one neighbour within `window`.
    pub max_barks: usize,
    /// Most copies of one bark accepted from one neighbour within `window`.
    pub max_repeats: usize,
}

impl SpamLimits {
    pub fn from_config(config: &MuttConfig) -> Self {
        Self {
            window: config.relay_window,
            max_barks: config.relay_max_barks.max(1),
            max_repeats: config.relay_max_repeats.max(1),
        }
    }
}

/// What to do with a bark offered for relaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// The sender is banned; `reason` is set when this bark caused the ban.
    Banned { reason: Option<String> },
}

#[derive(Debug, Default)]
struct Neighbour {
    arrivals: VecDeque<Instant>,
    copies: HashMap<BarkKey, VecDeque<Instant>>,
}

impl Neighbour {
    fn expire(&mut self, cutoff: Instant) {
        while self.arrivals.front().is_some_and(|at| *at < cutoff) {
            self.arrivals.pop_front();
        }
        self.copies.retain(|_, times| {
            while times.front().is_some_and(|at| *at < cutoff) {
                times.pop_front();
            }
            !times.is_empty()
        });
    }
}

pub struct SpamFilter {
    limits: SpamLimits,
    neighbours: HashMap<String, Neighbour>,
    banned: HashSet<String>,
}

impl SpamFilter {
    pub fn new(limits: SpamLimits) -> Self {
        Self {
            limits,
            neighbours: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    pub fn is_banned(&self, endpoint: &str) -> bool {
        self.banned.contains(endpoint)
    }

    pub fn banned(&self) -> Vec<String> {
        let mut names: Vec<_> = self.banned.iter().cloned().collect();
        names.sort();
        names
    }

    /// Record that `endpoint` offered bark `key` at `now`.
    pub fn check(&mut self, endpoint: &str, key: &BarkKey, now: Instant) -> Verdict {
        if self.banned.contains(endpoint) {
            return Verdict::Banned { reason: None };
        }

        let cutoff = now.checked_sub(self.limits.window).unwrap_or(now);
        let neighbour = self.neighbours.entry(endpoint.to_string()).or_default();
        neighbour.expire(cutoff);
        neighbour.arrivals.push_back(now);
        let copies = neighbour.copies.entry(*key).or_default();
        copies.push_back(now);

        let reason = if copies.len() > self.limits.max_repeats {
            format!("sent {key} {} times within {:?}", copies.len(), self.limits.window)
        } else if neighbour.arrivals.len() > self.limits.max_barks {
            format!(
                "relayed {} barks within {:?}",
                neighbour.arrivals.len(),
                self.limits.window
            )
        } else {
            return Verdict::Accept;
        };

        warn!(endpoint, %reason, "banning endpoint");
        self.neighbours.remove(endpoint);
        self.banned.insert(endpoint.to_string());
        Verdict::Banned {
            reason: Some(reason),
        }
    }
}
