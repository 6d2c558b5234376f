//! Credential / proxy identities and round-robin rotation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One credential/proxy combination a worker can present to the target site
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub index: usize,
    pub label: String,
    pub proxy: Option<String>,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proxy {
            Some(proxy) => write!(f, "{}#{} via {}", self.label, self.index, proxy),
            None => write!(f, "{}#{}", self.label, self.index),
        }
    }
}

/// Fixed, non-empty, ordered list of identities shared by all workers of a run
#[derive(Debug, Clone)]
pub struct IdentityPool {
    identities: Arc<[Identity]>,
}

impl IdentityPool {
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn new(identities: Vec<Identity>) -> Option<Self> {
        if identities.is_empty() {
            return None;
        }
        Some(Self {
            identities: identities.into(),
        })
    }

    /// Build from `label` or `label@proxy` specs, indexed by position.
    #[must_use]
    pub fn from_specs<I, S>(specs: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let identities = specs
            .into_iter()
            .map(|spec| spec.as_ref().trim().to_string())
            .filter(|spec| !spec.is_empty())
            .enumerate()
            .map(|(index, spec)| match spec.split_once('@') {
                Some((label, proxy)) => Identity {
                    index,
                    label: label.to_string(),
                    proxy: Some(proxy.to_string()),
                },
                None => Identity {
                    index,
                    label: spec,
                    proxy: None,
                },
            })
            .collect();
        Self::new(identities)
    }

    /// Single anonymous identity
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            identities: vec![Identity {
                index: 0,
                label: "default".to_string(),
                proxy: None,
            }]
            .into(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Identity at `index`, wrapping around the pool.
    #[must_use]
    pub fn get(&self, index: usize) -> &Identity {
        &self.identities[index % self.identities.len()]
    }

    /// Cursor for worker `worker_id`; worker *i* starts at identity `i mod len`.
    #[must_use]
    pub fn cursor_for_worker(&self, worker_id: usize) -> IdentityCursor {
        IdentityCursor {
            pool: self.clone(),
            index: worker_id % self.identities.len(),
            searches: 0,
        }
    }
}

/// A worker's position in the identity pool plus its usage since the last rotation
#[derive(Debug, Clone)]
pub struct IdentityCursor {
    pool: IdentityPool,
    index: usize,
    searches: u32,
}

impl IdentityCursor {
    #[must_use]
    pub fn current(&self) -> &Identity {
        self.pool.get(self.index)
    }

    #[must_use]
    pub const fn searches(&self) -> u32 {
        self.searches
    }

    pub const fn record_search(&mut self) {
        self.searches += 1;
    }

    /// `true` once the current identity has served `threshold` searches. A zero
    /// threshold disables count-based rotation.
    #[must_use]
    pub const fn threshold_reached(&self, threshold: u32) -> bool {
        threshold > 0 && self.searches >= threshold
    }

    /// Advance to the next identity (wrapping) and reset the search counter.
    pub fn advance(&mut self) -> &Identity {
        self.index = (self.index + 1) % self.pool.len();
        self.searches = 0;
        self.current()
    }
}
