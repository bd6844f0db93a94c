//! A Chinese Restaurant Process partition over arbitrary item ids.
//!
//! Clusters are created lazily when the first member arrives and deleted
//! lazily when the last member leaves. Cluster ids are arena-style: drawn
//! from a monotonically increasing watermark and never reused, so a cluster
//! id observed by a caller stays meaningful for the life of the partition.
use std::collections::BTreeMap;

use rand::Rng;
use rv::misc::ln_pflip;
use serde::{Deserialize, Serialize};

use crate::error::{ConsistencyError, CrpError};
use crate::misc::{lcrp, ln_gamma, log_linspace};

/// Number of points in the concentration hyperprior grid
pub const N_GRID: usize = 30;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Crp {
    alpha: f64,
    /// item id → cluster id
    asgn: BTreeMap<usize, usize>,
    /// cluster id → occupancy
    counts: BTreeMap<usize, usize>,
    /// All past and present cluster ids are below this watermark
    next_id: usize,
    alpha_grid: Vec<f64>,
}

impl Crp {
    pub fn new(alpha: f64) -> Result<Self, CrpError> {
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(CrpError::InvalidAlpha(alpha));
        }
        Ok(Crp {
            alpha,
            asgn: BTreeMap::new(),
            counts: BTreeMap::new(),
            next_id: 0,
            alpha_grid: Vec::new(),
        })
    }

    /// Build a partition over items `0..zs.len()` with the given cluster ids.
    pub fn from_assignment(alpha: f64, zs: &[usize]) -> Result<Self, CrpError> {
        let mut crp = Self::new(alpha)?;
        for (item, &z) in zs.iter().enumerate() {
            crp.incorporate(item, z)?;
        }
        crp.rebuild_alpha_grid();
        Ok(crp)
    }

    pub fn n(&self) -> usize {
        self.asgn.len()
    }

    pub fn n_clusters(&self) -> usize {
        self.counts.len()
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn set_alpha(&mut self, alpha: f64) -> Result<(), CrpError> {
        if !alpha.is_finite() || alpha <= 0.0 {
            return Err(CrpError::InvalidAlpha(alpha));
        }
        self.alpha = alpha;
        Ok(())
    }

    pub fn counts(&self) -> &BTreeMap<usize, usize> {
        &self.counts
    }

    pub fn asgn(&self) -> &BTreeMap<usize, usize> {
        &self.asgn
    }

    /// The cluster of `item`, if it is a member.
    pub fn assignment(&self, item: usize) -> Option<usize> {
        self.asgn.get(&item).copied()
    }

    pub fn contains(&self, item: usize) -> bool {
        self.asgn.contains_key(&item)
    }

    /// Whether `item` is the only member of its cluster.
    pub fn is_singleton(&self, item: usize) -> bool {
        self.asgn
            .get(&item)
            .map_or(false, |z| self.counts[z] == 1)
    }

    /// The lowest live cluster id, if any cluster exists.
    pub fn first_cluster(&self) -> Option<usize> {
        self.counts.keys().next().copied()
    }

    /// An id guaranteed never to have labeled a cluster.
    pub fn fresh_id(&self) -> usize {
        self.next_id
    }

    /// Roll the id watermark back after transient clusters created during
    /// a query have all been deleted. Every live cluster must sit below the
    /// restored watermark.
    pub(crate) fn set_watermark(&mut self, next_id: usize) {
        debug_assert!(self
            .counts
            .keys()
            .next_back()
            .map_or(true, |&z| z < next_id));
        self.next_id = next_id;
    }

    pub fn incorporate(&mut self, item: usize, cluster: usize) -> Result<(), CrpError> {
        if self.asgn.contains_key(&item) {
            return Err(CrpError::DuplicateItem(item));
        }
        self.asgn.insert(item, cluster);
        *self.counts.entry(cluster).or_insert(0) += 1;
        if cluster >= self.next_id {
            self.next_id = cluster + 1;
        }
        Ok(())
    }

    /// Remove `item`. Returns its former cluster and whether that cluster
    /// became empty (and was deleted).
    pub fn unincorporate(&mut self, item: usize) -> Result<(usize, bool), CrpError> {
        let z = self
            .asgn
            .remove(&item)
            .ok_or(CrpError::UnknownItem(item))?;
        let ct = self
            .counts
            .get_mut(&z)
            .ok_or(CrpError::UnknownItem(item))?;
        *ct -= 1;
        let emptied = *ct == 0;
        if emptied {
            self.counts.remove(&z);
        }
        Ok((z, emptied))
    }

    /// Candidate clusters for a Gibbs step on member `item` with `m`
    /// auxiliary tables. A singleton's own cluster stands in for one of the
    /// auxiliaries.
    pub fn gibbs_tables(&self, item: usize, m: usize) -> Vec<usize> {
        let m_aux = if self.is_singleton(item) { m - 1 } else { m };
        self.counts
            .keys()
            .copied()
            .chain((0..m_aux).map(|j| self.next_id + j))
            .collect()
    }

    /// Unnormalized log prior weights aligned with `gibbs_tables`.
    pub fn gibbs_logps(&self, item: usize, m: usize) -> Vec<f64> {
        let z = self.asgn[&item];
        let singleton = self.counts[&z] == 1;
        let m_aux = if singleton { m - 1 } else { m };
        let lp_aux = (self.alpha / m as f64).ln();
        self.counts
            .iter()
            .map(|(&t, &ct)| {
                if t == z {
                    if singleton {
                        lp_aux
                    } else {
                        ((ct - 1) as f64).ln()
                    }
                } else {
                    (ct as f64).ln()
                }
            })
            .chain((0..m_aux).map(|_| lp_aux))
            .collect()
    }

    /// Candidate clusters for a hypothetical (non-member) item.
    pub fn fresh_tables(&self, m: usize) -> Vec<usize> {
        self.counts
            .keys()
            .copied()
            .chain((0..m).map(|j| self.next_id + j))
            .collect()
    }

    /// Normalized log predictive weights aligned with `fresh_tables`.
    pub fn fresh_logps(&self, m: usize) -> Vec<f64> {
        let ln_z = (self.n() as f64 + self.alpha).ln();
        let lp_aux = (self.alpha / m as f64).ln() - ln_z;
        self.counts
            .values()
            .map(|&ct| (ct as f64).ln() - ln_z)
            .chain((0..m).map(|_| lp_aux))
            .collect()
    }

    /// Log probability that a hypothetical item lands in `cluster`. Any id
    /// that is not a live cluster is treated as a fresh table.
    pub fn predictive_logp(&self, cluster: usize) -> f64 {
        let ln_z = (self.n() as f64 + self.alpha).ln();
        match self.counts.get(&cluster) {
            Some(&ct) => (ct as f64).ln() - ln_z,
            None => self.alpha.ln() - ln_z,
        }
    }

    /// Log marginal of the current partition.
    pub fn logpdf_score(&self) -> f64 {
        if self.asgn.is_empty() {
            return 0.0;
        }
        lcrp(self.n(), self.counts.values(), self.alpha)
    }

    pub fn rebuild_alpha_grid(&mut self) {
        let n = self.n().max(2) as f64;
        self.alpha_grid = log_linspace(1.0 / n, n, N_GRID);
    }

    /// Grid Gibbs step on the concentration parameter. Returns the new value.
    pub fn transition_alpha<R: Rng>(&mut self, rng: &mut R) -> f64 {
        if self.alpha_grid.is_empty() {
            self.rebuild_alpha_grid();
        }
        let n = self.n() as f64;
        let k = self.n_clusters() as f64;
        let logps: Vec<f64> = self
            .alpha_grid
            .iter()
            .map(|&a| k.mul_add(a.ln(), ln_gamma(a)) - ln_gamma(n + a))
            .collect();
        let ix = ln_pflip(&logps, 1, false, rng)[0];
        self.alpha = self.alpha_grid[ix];
        self.alpha
    }

    /// Verify the redundant occupancy table against true membership.
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        let mut counted: BTreeMap<usize, usize> = BTreeMap::new();
        for &z in self.asgn.values() {
            *counted.entry(z).or_insert(0) += 1;
        }
        for (&z, &ct) in &self.counts {
            if ct == 0 {
                return Err(ConsistencyError::EmptyCluster(z));
            }
            if z >= self.next_id {
                return Err(ConsistencyError::StaleArenaWatermark(z));
            }
            let n_members = counted.get(&z).copied().unwrap_or(0);
            if n_members != ct {
                return Err(ConsistencyError::OccupancyMismatch {
                    cluster: z,
                    counted: n_members,
                    recorded: ct,
                });
            }
        }
        if counted.len() != self.counts.len() {
            let z = counted
                .keys()
                .find(|z| !self.counts.contains_key(z))
                .copied()
                .unwrap_or(0);
            return Err(ConsistencyError::OccupancyMismatch {
                cluster: z,
                counted: counted.get(&z).copied().unwrap_or(0),
                recorded: 0,
            });
        }
        Ok(())
    }
}
