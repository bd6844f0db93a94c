//! A single column of data partitioned into cluster component models.
use std::collections::BTreeMap;

use rand::Rng;
use rv::misc::ln_pflip;
use serde::{Deserialize, Serialize};

use crate::dist::{ColModel, ColType, ColumnModel, HyperGrids, Hypers, N_GRID};
use crate::error::QueryError;
use crate::gpm::Values;

/// One column under a row partition: a component model per live cluster.
///
/// Rows with a missing value are tracked separately; they occupy their
/// cluster but contribute nothing to its component model. The dim keeps its
/// own copy of incorporated values so that rows can be unincorporated and
/// clusters rebuilt without consulting the owning table.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Dim {
    pub index: usize,
    ctype: ColType,
    hypers: Hypers,
    grids: HyperGrids,
    pub clusters: BTreeMap<usize, ColModel>,
    /// rowid → cluster, rows with a present value
    asgn: BTreeMap<usize, usize>,
    /// rowid → cluster, rows with a missing value
    missing: BTreeMap<usize, usize>,
    /// rowid → present value
    data: BTreeMap<usize, f64>,
    /// Exogenous input variables; nonempty makes the dim conditional
    inputs: Vec<usize>,
}

impl Dim {
    pub fn new(index: usize, ctype: ColType, inputs: Vec<usize>) -> Self {
        Dim {
            index,
            ctype,
            hypers: ctype.default_hypers(),
            grids: HyperGrids::new(),
            clusters: BTreeMap::new(),
            asgn: BTreeMap::new(),
            missing: BTreeMap::new(),
            data: BTreeMap::new(),
            inputs,
        }
    }

    pub fn ctype(&self) -> ColType {
        self.ctype
    }

    pub fn hypers(&self) -> &Hypers {
        &self.hypers
    }

    pub fn set_hypers(&mut self, hypers: Hypers) {
        self.hypers = hypers;
        for model in self.clusters.values_mut() {
            model.set_hypers(&self.hypers);
        }
    }

    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    pub fn is_conditional(&self) -> bool {
        !self.inputs.is_empty()
    }

    pub fn is_collapsed(&self) -> bool {
        self.ctype.is_collapsed()
    }

    /// The recorded value for `rowid`, if present (missing values are not
    /// recorded).
    pub fn value(&self, rowid: usize) -> Option<f64> {
        self.data.get(&rowid).copied()
    }

    pub fn is_member(&self, rowid: usize) -> bool {
        self.asgn.contains_key(&rowid) || self.missing.contains_key(&rowid)
    }

    /// Cluster occupancy including missing-valued members.
    pub fn occupancy(&self, cluster: usize) -> usize {
        self.asgn.values().filter(|&&z| z == cluster).count()
            + self.missing.values().filter(|&&z| z == cluster).count()
    }

    /// Rebuild the hyperparameter grids from the incorporated values.
    pub fn transition_hyper_grids(&mut self) {
        let xs: Vec<f64> = self.data.values().copied().collect();
        self.grids = self.ctype.hyper_grids(&xs, N_GRID);
    }

    pub fn incorporate(&mut self, rowid: usize, x: f64, cluster: usize) {
        debug_assert!(!self.is_member(rowid));
        if x.is_nan() {
            self.missing.insert(rowid, cluster);
        } else {
            self.clusters
                .entry(cluster)
                .or_insert_with(|| self.ctype.new_model(&self.hypers))
                .incorporate(x);
            self.asgn.insert(rowid, cluster);
            self.data.insert(rowid, x);
        }
    }

    pub fn unincorporate(&mut self, rowid: usize) -> Result<(), QueryError> {
        if let Some(cluster) = self.asgn.remove(&rowid) {
            let x = self
                .data
                .remove(&rowid)
                .ok_or(QueryError::UnknownRow(rowid))?;
            if let Some(model) = self.clusters.get_mut(&cluster) {
                model.unincorporate(x);
            }
            Ok(())
        } else if self.missing.remove(&rowid).is_some() {
            Ok(())
        } else {
            Err(QueryError::UnknownRow(rowid))
        }
    }

    /// Delete the component model of a cluster the row partition emptied.
    pub fn drop_cluster(&mut self, cluster: usize) {
        self.clusters.remove(&cluster);
    }

    /// Log predictive of `x` in `cluster`. An unknown cluster id denotes a
    /// fresh singleton. When `exclude` names a row currently assigned to
    /// `cluster`, that row's own value is removed before scoring, so the
    /// density is predictive given all other members.
    pub fn predictive_logp(
        &self,
        exclude: Option<usize>,
        x: f64,
        cluster: usize,
    ) -> f64 {
        match self.clusters.get(&cluster) {
            None => self.singleton_logp(x),
            Some(model) => {
                let excluded = exclude.and_then(|rowid| {
                    if self.asgn.get(&rowid) == Some(&cluster) {
                        self.data.get(&rowid).copied()
                    } else {
                        None
                    }
                });
                match excluded {
                    Some(x_own) => {
                        let mut others = model.clone();
                        others.unincorporate(x_own);
                        others.predictive_logp(x)
                    }
                    None => model.predictive_logp(x),
                }
            }
        }
    }

    /// Log predictive of `x` in an empty fresh cluster.
    pub fn singleton_logp(&self, x: f64) -> f64 {
        self.ctype.new_model(&self.hypers).predictive_logp(x)
    }

    /// Draw from the posterior predictive of `cluster` (fresh if unknown).
    pub fn simulate_in<R: Rng>(&self, cluster: usize, rng: &mut R) -> f64 {
        match self.clusters.get(&cluster) {
            Some(model) => model.simulate(rng),
            None => self.ctype.new_model(&self.hypers).simulate(rng),
        }
    }

    /// Like `simulate_in`, but with the excluded row's own value removed
    /// from the cluster first, mirroring `predictive_logp`.
    pub fn simulate_excluding<R: Rng>(
        &self,
        exclude: Option<usize>,
        cluster: usize,
        rng: &mut R,
    ) -> f64 {
        let excluded = exclude.and_then(|rowid| {
            if self.asgn.get(&rowid) == Some(&cluster) {
                self.data.get(&rowid).copied()
            } else {
                None
            }
        });
        match (excluded, self.clusters.get(&cluster)) {
            (Some(x_own), Some(model)) => {
                let mut others = model.clone();
                others.unincorporate(x_own);
                others.simulate(rng)
            }
            _ => self.simulate_in(cluster, rng),
        }
    }

    /// Log marginal likelihood of the column under the current partition.
    pub fn logpdf_score(&self) -> f64 {
        self.clusters.values().map(|model| model.marginal_logp()).sum()
    }

    /// Rebuild the clusters under a new row partition. Values and missing
    /// rows are re-homed; the partition must cover every member row.
    pub fn reassign(&mut self, asgn: &BTreeMap<usize, usize>) {
        self.clusters.clear();
        self.asgn.clear();
        self.missing.clear();
        let data = std::mem::take(&mut self.data);
        for (&rowid, &cluster) in asgn {
            let x = data.get(&rowid).copied().unwrap_or(f64::NAN);
            self.incorporate(rowid, x, cluster);
        }
    }

    /// Grid Gibbs sweep over the named hyperparameters, holding the
    /// partition fixed.
    pub fn transition_hypers<R: Rng>(&mut self, rng: &mut R) {
        if self.grids.is_empty() {
            self.transition_hyper_grids();
        }
        let names: Vec<String> = self.grids.keys().cloned().collect();
        for name in names {
            let grid = self.grids[&name].clone();
            if grid.len() < 2 {
                continue;
            }
            let logps: Vec<f64> = grid
                .iter()
                .map(|&value| {
                    let mut proposal = self.hypers.clone();
                    proposal.insert(name.clone(), value);
                    self.clusters
                        .values()
                        .map(|model| {
                            let mut scored = model.clone();
                            scored.set_hypers(&proposal);
                            scored.marginal_logp()
                        })
                        .sum()
                })
                .collect();
            let ix = ln_pflip(&logps, 1, false, rng)[0];
            self.hypers.insert(name, grid[ix]);
        }
        let hypers = self.hypers.clone();
        for model in self.clusters.values_mut() {
            model.set_hypers(&hypers);
        }
    }

    /// The values this dim would contribute to a full record of `rowid`.
    pub fn extend_record(&self, rowid: usize, record: &mut Values) {
        if let Some(x) = self.data.get(&rowid) {
            record.insert(self.index, *x);
        }
    }
}
