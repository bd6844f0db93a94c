//! A view: one row partition shared by a set of dims.
//!
//! The view owns a CRP over row ids and a `Dim` per member column. Queries
//! against a view marginalize or condition on the latent cluster assignment
//! exposed as the variable id in `latent`.
use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use rv::misc::ln_pflip;
use serde::{Deserialize, Serialize};

use crate::crp::Crp;
use crate::dim::Dim;
use crate::error::{ConsistencyError, CrpError, QueryError, StateError};
use crate::gpm::{Gpm, Values};
use crate::metadata::{GpmMetadata, MetadataError};
use crate::misc::{allclose, crp_draw, log_normalize, logsumexp};

/// Factory tag recorded in view metadata
pub const VIEW_FACTORY: &str = "cgpm::view::View";

/// Number of auxiliary tables proposed per row Gibbs step
const M_AUX: usize = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct View {
    /// Variable id under which the cluster assignment is queryable
    latent: usize,
    pub crp: Crp,
    pub dims: BTreeMap<usize, Dim>,
}

impl View {
    pub fn new(latent: usize, alpha: f64) -> Result<Self, CrpError> {
        Ok(View {
            latent,
            crp: Crp::new(alpha)?,
            dims: BTreeMap::new(),
        })
    }

    /// A dimless view over rows `0..zs.len()` with the given row partition.
    pub fn from_partition(
        latent: usize,
        alpha: f64,
        zs: &[usize],
    ) -> Result<Self, CrpError> {
        Ok(View {
            latent,
            crp: Crp::from_assignment(alpha, zs)?,
            dims: BTreeMap::new(),
        })
    }

    /// A dimless view with a row partition drawn from the CRP prior.
    pub fn from_prior<R: Rng>(
        latent: usize,
        alpha: f64,
        n_rows: usize,
        rng: &mut R,
    ) -> Result<Self, CrpError> {
        let draw = crp_draw(n_rows, alpha, rng);
        Self::from_partition(latent, alpha, &draw.asgn)
    }

    pub fn latent(&self) -> usize {
        self.latent
    }

    pub fn n_rows(&self) -> usize {
        self.crp.n()
    }

    pub fn alpha(&self) -> f64 {
        self.crp.alpha()
    }

    /// Rows outside the partition are hypothetical population members.
    pub fn hypothetical(&self, rowid: usize) -> bool {
        !self.crp.contains(rowid)
    }

    pub fn cluster_of(&self, rowid: usize) -> Option<usize> {
        self.crp.assignment(rowid)
    }

    // ------------------------------------------------------------------
    // Incorporate / unincorporate

    /// Add a row. `values` maps column ids to values; columns this view
    /// owns but `values` omits are recorded as missing. If `values` pins
    /// the latent variable the row goes to that cluster, otherwise it is
    /// placed provisionally and settled with one Gibbs step.
    pub fn incorporate<R: Rng>(
        &mut self,
        rowid: usize,
        values: &Values,
        rng: &mut R,
    ) -> Result<(), QueryError> {
        if self.crp.contains(rowid) {
            return Err(QueryError::DuplicateRow(rowid));
        }
        for col in values.keys() {
            if *col != self.latent && !self.dims.contains_key(col) {
                return Err(QueryError::UnknownVariable(*col));
            }
        }
        match values.get(&self.latent) {
            Some(&zf) => {
                let cluster = zf as usize;
                self.insert_row(rowid, values, cluster)?;
            }
            None => {
                let provisional = self
                    .crp
                    .first_cluster()
                    .unwrap_or_else(|| self.crp.fresh_id());
                self.insert_row(rowid, values, provisional)?;
                self.gibbs_transition_row(rowid, rng);
            }
        }
        Ok(())
    }

    fn insert_row(
        &mut self,
        rowid: usize,
        values: &Values,
        cluster: usize,
    ) -> Result<(), QueryError> {
        self.crp
            .incorporate(rowid, cluster)
            .map_err(|_| QueryError::DuplicateRow(rowid))?;
        for dim in self.dims.values_mut() {
            let x = values.get(&dim.index).copied().unwrap_or(f64::NAN);
            dim.incorporate(rowid, x, cluster);
        }
        Ok(())
    }

    /// Remove a row. A cluster emptied by the removal is deleted and its id
    /// is never reused.
    pub fn unincorporate(&mut self, rowid: usize) -> Result<(), QueryError> {
        if !self.crp.contains(rowid) {
            return Err(QueryError::UnknownRow(rowid));
        }
        for dim in self.dims.values_mut() {
            dim.unincorporate(rowid)?;
        }
        let (cluster, emptied) = self
            .crp
            .unincorporate(rowid)
            .map_err(|_| QueryError::UnknownRow(rowid))?;
        if emptied {
            for dim in self.dims.values_mut() {
                dim.drop_cluster(cluster);
            }
        }
        Ok(())
    }

    /// Adopt a dim. With `reassign` the dim's clusters are rebuilt under
    /// this view's row partition; without it the dim's current clustering
    /// is kept (it must already match). Returns the dim's marginal under
    /// its final clustering.
    pub fn incorporate_dim(&mut self, mut dim: Dim, reassign: bool) -> f64 {
        if reassign {
            dim.reassign(self.crp.asgn());
        }
        let logp = dim.logpdf_score();
        self.dims.insert(dim.index, dim);
        logp
    }

    pub fn unincorporate_dim(&mut self, index: usize) -> Option<Dim> {
        self.dims.remove(&index)
    }

    // ------------------------------------------------------------------
    // Row kernel

    /// Gibbs sweep over row assignments in shuffled order.
    pub fn transition_rows<R: Rng>(
        &mut self,
        rows: Option<&[usize]>,
        rng: &mut R,
    ) {
        let mut rowids: Vec<usize> = match rows {
            Some(rows) => rows.to_vec(),
            None => self.crp.asgn().keys().copied().collect(),
        };
        rowids.shuffle(rng);
        for rowid in rowids {
            self.gibbs_transition_row(rowid, rng);
        }
    }

    fn gibbs_transition_row<R: Rng>(&mut self, rowid: usize, rng: &mut R) {
        if self.n_rows() < 2 {
            return;
        }
        let tables = self.crp.gibbs_tables(rowid, M_AUX);
        let logp_crp = self.crp.gibbs_logps(rowid, M_AUX);
        let logps: Vec<f64> = tables
            .iter()
            .zip(logp_crp)
            .map(|(&k, lp)| lp + self.row_logp(rowid, k))
            .collect();
        let choice = tables[ln_pflip(&logps, 1, false, rng)[0]];
        if self.crp.assignment(rowid) != Some(choice) {
            self.migrate_row(rowid, choice);
        }
    }

    /// Log predictive of the row's recorded values in `cluster`, excluding
    /// the row's own contribution where it is currently counted.
    fn row_logp(&self, rowid: usize, cluster: usize) -> f64 {
        self.dims
            .values()
            .filter_map(|dim| {
                dim.value(rowid)
                    .map(|x| dim.predictive_logp(Some(rowid), x, cluster))
            })
            .sum()
    }

    fn migrate_row(&mut self, rowid: usize, cluster: usize) {
        let mut values = Values::new();
        for dim in self.dims.values() {
            dim.extend_record(rowid, &mut values);
        }
        // the row is known to be a member; removal cannot fail
        let _ = self.unincorporate(rowid);
        let _ = self.insert_row(rowid, &values, cluster);
    }

    // ------------------------------------------------------------------
    // Other kernels

    pub fn transition_alpha<R: Rng>(&mut self, rng: &mut R) -> f64 {
        self.crp.transition_alpha(rng)
    }

    pub fn transition_hypers<R: Rng>(&mut self, rng: &mut R) {
        for dim in self.dims.values_mut() {
            dim.transition_hypers(rng);
        }
    }

    pub fn transition_hyper_grids(&mut self) {
        for dim in self.dims.values_mut() {
            dim.transition_hyper_grids();
        }
    }

    /// Log marginal of the row partition and all member columns.
    pub fn logpdf_score(&self) -> f64 {
        self.crp.logpdf_score()
            + self.dims.values().map(Dim::logpdf_score).sum::<f64>()
    }

    // ------------------------------------------------------------------
    // Queries

    /// Validate a query against this view and fill in the evidence for an
    /// observed row: every recorded cell not in the query or the evidence,
    /// plus the row's cluster assignment.
    pub fn populate_evidence(
        &self,
        rowid: usize,
        query_vars: &BTreeSet<usize>,
        evidence: &Values,
    ) -> Result<Values, QueryError> {
        let overlap: Vec<usize> = query_vars
            .iter()
            .filter(|var| evidence.contains_key(var))
            .copied()
            .collect();
        if !overlap.is_empty() {
            return Err(QueryError::QueryEvidenceOverlap(overlap));
        }
        for &var in query_vars.iter().chain(evidence.keys()) {
            if var != self.latent && !self.dims.contains_key(&var) {
                return Err(QueryError::UnknownVariable(var));
            }
        }
        for (&var, &value) in evidence {
            if var != self.latent && value.is_nan() {
                return Err(QueryError::InvalidValue { col: var, value });
            }
        }
        if self.hypothetical(rowid) {
            return Ok(evidence.clone());
        }
        // the cluster of a member row is fixed by the partition
        if query_vars.contains(&self.latent)
            || evidence.contains_key(&self.latent)
        {
            return Err(QueryError::ClusterConstraintOnObservedRow(rowid));
        }
        for (&var, &value) in evidence {
            if let Some(x) = self.dims[&var].value(rowid) {
                if !allclose(x, value) {
                    return Err(QueryError::EvidenceContradictsObservedCell {
                        row: rowid,
                        col: var,
                    });
                }
            }
        }
        let mut filled = evidence.clone();
        for (&col, dim) in &self.dims {
            if !query_vars.contains(&col) && !filled.contains_key(&col) {
                dim.extend_record(rowid, &mut filled);
            }
        }
        // membership is established above
        let cluster = self.crp.assignment(rowid).unwrap_or_default();
        filled.insert(self.latent, cluster as f64);
        Ok(filled)
    }

    /// Log density of `query` given `evidence`, the dataset, and the row
    /// partition. Cells of an observed row are scored predictively given
    /// every member but the row itself.
    pub fn logpdf(
        &self,
        rowid: usize,
        query: &Values,
        evidence: &Values,
    ) -> Result<f64, QueryError> {
        for (&var, &value) in query {
            if var != self.latent && value.is_nan() {
                return Err(QueryError::InvalidValue { col: var, value });
            }
        }
        let query_vars: BTreeSet<usize> = query.keys().copied().collect();
        let evidence = self.populate_evidence(rowid, &query_vars, evidence)?;
        let exclude = if self.hypothetical(rowid) {
            None
        } else {
            Some(rowid)
        };

        if let Some(&zf) = evidence.get(&self.latent) {
            // cluster pinned: query cells are independent given z
            let cluster = zf as usize;
            Ok(self.cells_logp(query, exclude, cluster))
        } else if let Some(&zf) = query.get(&self.latent) {
            // cluster queried: Bayes rule
            // p(z=k, xQ | xE) = p(z=k) p(xQ, xE | z=k) / p(xE)
            let cluster = zf as usize;
            let lp_cluster = self.crp.predictive_logp(cluster);
            let mut numer = evidence.clone();
            numer.extend(
                query
                    .iter()
                    .filter(|(&var, _)| var != self.latent)
                    .map(|(&var, &value)| (var, value)),
            );
            let lp_numer = self.cells_logp(&numer, exclude, cluster);
            let lp_denom = if evidence.is_empty() {
                0.0
            } else {
                self.logpdf(rowid, &evidence, &Values::new())?
            };
            Ok(lp_cluster + lp_numer - lp_denom)
        } else {
            // marginalize the cluster by enumeration
            let tables = self.crp.fresh_tables(M_AUX);
            let lp_crp = self.crp.fresh_logps(M_AUX);
            let lp_evidence: Vec<f64> = tables
                .iter()
                .zip(&lp_crp)
                .map(|(&k, lp)| lp + self.cells_logp(&evidence, exclude, k))
                .collect();
            if !evidence.is_empty()
                && logsumexp(&lp_evidence) == f64::NEG_INFINITY
            {
                return Err(QueryError::DegenerateEvidence);
            }
            let lp_posterior = log_normalize(&lp_evidence);
            let terms: Vec<f64> = tables
                .iter()
                .zip(lp_posterior)
                .map(|(&k, lp)| lp + self.cells_logp(query, exclude, k))
                .collect();
            Ok(logsumexp(&terms))
        }
    }

    fn cells_logp(
        &self,
        cells: &Values,
        exclude: Option<usize>,
        cluster: usize,
    ) -> f64 {
        cells
            .iter()
            .filter(|(&var, _)| var != self.latent)
            .map(|(&var, &x)| {
                self.dims[&var].predictive_logp(exclude, x, cluster)
            })
            .sum()
    }

    /// Draw `n` records of `targets` given `evidence` and the dataset.
    pub fn simulate<R: Rng>(
        &self,
        rowid: usize,
        targets: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<Values>, QueryError> {
        let mut target_vars = BTreeSet::new();
        for &var in targets {
            if !target_vars.insert(var) {
                return Err(QueryError::DuplicateTarget(var));
            }
        }
        let evidence = self.populate_evidence(rowid, &target_vars, evidence)?;
        let exclude = if self.hypothetical(rowid) {
            None
        } else {
            Some(rowid)
        };
        let expose = target_vars.contains(&self.latent);
        let cols: Vec<usize> = targets
            .iter()
            .filter(|&&var| var != self.latent)
            .copied()
            .collect();

        if let Some(&zf) = evidence.get(&self.latent) {
            let cluster = zf as usize;
            let records = (0..n)
                .map(|_| self.draw_record(&cols, exclude, cluster, rng))
                .collect();
            return Ok(records);
        }

        let tables = self.crp.fresh_tables(M_AUX);
        let lp_crp = self.crp.fresh_logps(M_AUX);
        let weights: Vec<f64> = tables
            .iter()
            .zip(&lp_crp)
            .map(|(&k, lp)| lp + self.cells_logp(&evidence, exclude, k))
            .collect();
        if !evidence.is_empty() && logsumexp(&weights) == f64::NEG_INFINITY {
            return Err(QueryError::DegenerateEvidence);
        }
        // one categorical draw with multiplicities per cluster
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for ix in ln_pflip(&weights, n, false, rng) {
            *counts.entry(ix).or_insert(0) += 1;
        }
        let mut records = Vec::with_capacity(n);
        for (ix, count) in counts {
            let cluster = tables[ix];
            for _ in 0..count {
                let mut record =
                    self.draw_record(&cols, exclude, cluster, rng);
                if expose {
                    record.insert(self.latent, cluster as f64);
                }
                records.push(record);
            }
        }
        Ok(records)
    }

    fn draw_record<R: Rng>(
        &self,
        cols: &[usize],
        exclude: Option<usize>,
        cluster: usize,
        rng: &mut R,
    ) -> Values {
        cols.iter()
            .map(|&col| {
                (col, self.dims[&col].simulate_excluding(exclude, cluster, rng))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Multirow queries

    /// Joint log density over several rows:
    /// `log p(query rows | evidence rows)`.
    ///
    /// Each outer key is a row id and maps to that row's cells; the latent
    /// variable may pin a row's cluster. Rows already incorporated are
    /// detached for the duration of the computation and restored afterward,
    /// so their queried cells are scored jointly rather than against their
    /// own recorded values; a detached row's remaining recorded cells stay
    /// conditioned on, exactly as in a single-row query.
    pub fn logpdf_multirow<R: Rng>(
        &mut self,
        query: &BTreeMap<usize, Values>,
        evidence: &BTreeMap<usize, Values>,
        rng: &mut R,
    ) -> Result<f64, QueryError> {
        for (rowid, cells) in query {
            self.validate_multirow_cells(cells)?;
            if let Some(given) = evidence.get(rowid) {
                let overlap: Vec<usize> = cells
                    .keys()
                    .filter(|var| given.contains_key(var))
                    .copied()
                    .collect();
                if !overlap.is_empty() {
                    return Err(QueryError::QueryEvidenceOverlap(overlap));
                }
            }
        }
        for cells in evidence.values() {
            self.validate_multirow_cells(cells)?;
        }

        let mut joint: BTreeMap<usize, Values> = evidence.clone();
        for (&rowid, cells) in query {
            joint.entry(rowid).or_default().extend(cells.iter());
        }
        let mut given: BTreeMap<usize, Values> = evidence.clone();

        // Detach every member row the computation names, once, so the
        // numerator and the denominator score it against the same reduced
        // view. Each detached row's recorded cells join its scored cells;
        // those not named by the query also join its evidence entry, so
        // the density stays conditioned on what was actually observed.
        let watermark = self.crp.fresh_id();
        let mut detached: Vec<(usize, Values)> = Vec::new();
        let named: Vec<usize> = joint.keys().copied().collect();
        for rowid in named {
            let cluster = match self.crp.assignment(rowid) {
                Some(cluster) => cluster,
                None => continue,
            };
            let mut record = Values::new();
            for dim in self.dims.values() {
                dim.extend_record(rowid, &mut record);
            }
            let cells = joint.entry(rowid).or_default();
            for (&var, &x) in &record {
                cells.entry(var).or_insert(x);
            }
            let held = given.entry(rowid).or_default();
            for (&var, &x) in &record {
                let queried = query
                    .get(&rowid)
                    .map_or(false, |cells| cells.contains_key(&var));
                if !queried {
                    held.entry(var).or_insert(x);
                }
            }
            record.insert(self.latent, cluster as f64);
            self.unincorporate(rowid)?;
            detached.push((rowid, record));
        }

        let lp_joint = self.joint_rows(&joint, rng);
        let lp_given = if given.is_empty() {
            Ok(0.0)
        } else {
            self.joint_rows(&given, rng)
        };

        for (rowid, record) in detached {
            // restoration re-pins the original cluster; it cannot fail
            let _ = self.incorporate(rowid, &record, rng);
        }
        // roll back transient cluster ids so the query leaves no trace
        self.crp.set_watermark(watermark);
        Ok(lp_joint? - lp_given?)
    }

    fn validate_multirow_cells(&self, cells: &Values) -> Result<(), QueryError> {
        for (&var, &value) in cells {
            if var != self.latent && !self.dims.contains_key(&var) {
                return Err(QueryError::UnknownVariable(var));
            }
            if var != self.latent && value.is_nan() {
                return Err(QueryError::InvalidValue { col: var, value });
            }
        }
        Ok(())
    }

    /// Chain-rule joint over the given rows, marginalizing unpinned
    /// clusters by enumeration. Member rows must be detached beforehand.
    fn joint_rows<R: Rng>(
        &mut self,
        rows: &BTreeMap<usize, Values>,
        rng: &mut R,
    ) -> Result<f64, QueryError> {
        let items: Vec<(usize, &Values)> =
            rows.iter().map(|(&rowid, cells)| (rowid, cells)).collect();
        self.joint_rows_rec(&items, rng)
    }

    fn joint_rows_rec<R: Rng>(
        &mut self,
        items: &[(usize, &Values)],
        rng: &mut R,
    ) -> Result<f64, QueryError> {
        let (rowid, cells) = match items.first() {
            None => return Ok(0.0),
            Some(&(rowid, cells)) => (rowid, cells),
        };
        if let Some(&zf) = cells.get(&self.latent) {
            let cluster = zf as usize;
            let lp = self.crp.predictive_logp(cluster)
                + self.cells_logp(cells, None, cluster);
            if lp == f64::NEG_INFINITY {
                return Ok(f64::NEG_INFINITY);
            }
            self.insert_row(rowid, cells, cluster)?;
            let rest = self.joint_rows_rec(&items[1..], rng);
            self.unincorporate(rowid)?;
            Ok(lp + rest?)
        } else {
            let tables = self.crp.fresh_tables(M_AUX);
            let lp_crp = self.crp.fresh_logps(M_AUX);
            let mut terms = Vec::with_capacity(tables.len());
            for (&cluster, lp) in tables.iter().zip(&lp_crp) {
                let lp_row = lp + self.cells_logp(cells, None, cluster);
                if lp_row == f64::NEG_INFINITY {
                    terms.push(f64::NEG_INFINITY);
                    continue;
                }
                self.insert_row(rowid, cells, cluster)?;
                let rest = self.joint_rows_rec(&items[1..], rng);
                self.unincorporate(rowid)?;
                terms.push(lp_row + rest?);
            }
            Ok(logsumexp(&terms))
        }
    }

    // ------------------------------------------------------------------
    // Structural validation

    /// Expensive structural validation: the partition's redundant counts
    /// and every dim's membership are checked against each other.
    pub fn check_partitions(&self) -> Result<(), ConsistencyError> {
        self.crp.validate()?;
        for (&col, dim) in &self.dims {
            for (&cluster, &count) in self.crp.counts() {
                if dim.occupancy(cluster) != count {
                    return Err(ConsistencyError::ColumnMembershipMismatch {
                        col,
                    });
                }
            }
            for cluster in dim.clusters.keys() {
                if !self.crp.counts().contains_key(cluster) {
                    return Err(ConsistencyError::UnknownClusterInColumn {
                        col,
                        cluster: *cluster,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Gpm for View {
    fn outputs(&self) -> Vec<usize> {
        std::iter::once(self.latent)
            .chain(self.dims.keys().copied())
            .collect()
    }

    fn inputs(&self) -> Vec<usize> {
        let mut inputs: Vec<usize> = self
            .dims
            .values()
            .flat_map(|dim| dim.inputs().iter().copied())
            .collect();
        inputs.sort_unstable();
        inputs.dedup();
        inputs
    }

    fn n_rows(&self) -> usize {
        self.n_rows()
    }

    fn incorporate(
        &mut self,
        rowid: usize,
        query: &Values,
        _inputs: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<(), StateError> {
        View::incorporate(self, rowid, query, &mut &mut *rng)
            .map_err(StateError::from)
    }

    fn unincorporate(&mut self, rowid: usize) -> Result<(), StateError> {
        View::unincorporate(self, rowid).map_err(StateError::from)
    }

    fn logpdf(
        &self,
        rowid: usize,
        query: &Values,
        evidence: &Values,
        _rng: &mut dyn RngCore,
    ) -> Result<f64, QueryError> {
        View::logpdf(self, rowid, query, evidence)
    }

    fn simulate(
        &self,
        rowid: usize,
        targets: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Values>, QueryError> {
        View::simulate(self, rowid, targets, evidence, n, &mut &mut *rng)
    }

    fn logpdf_score(&self) -> f64 {
        View::logpdf_score(self)
    }

    fn transition(&mut self, rng: &mut dyn RngCore) {
        let mut rng = &mut *rng;
        self.transition_rows(None, &mut rng);
        self.transition_alpha(&mut rng);
        self.transition_hypers(&mut rng);
    }

    fn to_metadata(&self) -> Result<GpmMetadata, MetadataError> {
        Ok(GpmMetadata {
            factory: VIEW_FACTORY.into(),
            payload: serde_json::to_value(self)?,
        })
    }
}
