//! The CrossCat state: a Dirichlet process mixture over columns, where each
//! mixture component is a view holding its own Dirichlet process mixture
//! over rows.
//!
//! The column partition is a CRP whose cluster ids double as view ids; each
//! view answers for its member columns and exposes its row-cluster
//! assignment as the latent variable `LATENT_VAR_BASE + view_id`. Queries
//! against a plain state factorize exactly across views. Hooking a foreign
//! component or adding a conditional column makes the state composite, and
//! queries are then routed through an importance-sampling network over all
//! components.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use rv::misc::ln_pflip;
use serde::{Deserialize, Serialize};

use crate::config::StateUpdateConfig;
use crate::crp::Crp;
use crate::dim::Dim;
use crate::dist::{ColType, Hypers};
use crate::error::{ConsistencyError, QueryError, StateError};
use crate::gpm::{Gpm, Values};
use crate::metadata::{
    FactoryRegistry, GpmMetadata, MetadataError, StateMetadata, STATE_FACTORY,
};
use crate::misc::{allclose, crp_draw};
use crate::network::{
    ancestor_vars, connected_blocks, variable_owners, Network,
};
use crate::sampling;
use crate::transition::StateTransition;
use crate::view::View;
use crate::LATENT_VAR_BASE;

/// First token issued to a hooked foreign component
pub const TOKEN_BASE: usize = 57481;

/// Auxiliary views entertained when reassigning a column
const M_AUX: usize = 1;

/// Inference history collected at checkpoints during `update`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StateDiagnostics {
    /// Log score at each checkpoint
    pub loglike: Vec<f64>,
    /// Column CRP concentration at each checkpoint
    pub column_alpha: Vec<f64>,
    /// Column partition (column, view) at each checkpoint
    pub column_partition: Vec<Vec<(usize, usize)>>,
    /// Total applications of each kernel, by name
    pub iterations: BTreeMap<String, usize>,
}

/// Builds a `State` from data, with optional pinned structure.
///
/// Anything not pinned is drawn from the prior: the column partition from a
/// CRP over columns, each view's row partition from a CRP over rows.
pub struct StateBuilder {
    x: BTreeMap<usize, Vec<f64>>,
    coltypes: BTreeMap<usize, ColType>,
    alpha: Option<f64>,
    zv: Option<BTreeMap<usize, usize>>,
    view_alphas: BTreeMap<usize, f64>,
    row_partitions: BTreeMap<usize, Vec<usize>>,
    hypers: BTreeMap<usize, Hypers>,
    independence: Vec<(usize, usize)>,
}

impl StateBuilder {
    /// `x` maps column id to cell values in row order, with `f64::NAN` for
    /// missing cells. `coltypes` must name a type for every column.
    pub fn new(
        x: BTreeMap<usize, Vec<f64>>,
        coltypes: BTreeMap<usize, ColType>,
    ) -> Self {
        StateBuilder {
            x,
            coltypes,
            alpha: None,
            zv: None,
            view_alphas: BTreeMap::new(),
            row_partitions: BTreeMap::new(),
            hypers: BTreeMap::new(),
            independence: Vec::new(),
        }
    }

    pub fn column_alpha(mut self, alpha: f64) -> Self {
        self.alpha = Some(alpha);
        self
    }

    /// Pin the column partition: column id → view id
    pub fn column_partition(mut self, zv: BTreeMap<usize, usize>) -> Self {
        self.zv = Some(zv);
        self
    }

    pub fn view_alpha(mut self, view: usize, alpha: f64) -> Self {
        self.view_alphas.insert(view, alpha);
        self
    }

    /// Pin a view's row partition: cluster id per row
    pub fn row_partition(mut self, view: usize, zs: Vec<usize>) -> Self {
        self.row_partitions.insert(view, zs);
        self
    }

    pub fn hypers(mut self, col: usize, hypers: Hypers) -> Self {
        self.hypers.insert(col, hypers);
        self
    }

    /// Constrain two columns to never share a view
    pub fn independent(mut self, col0: usize, col1: usize) -> Self {
        self.independence.push((col0, col1));
        self
    }

    pub fn build<R: Rng>(self, rng: &mut R) -> Result<State, StateError> {
        let StateBuilder {
            x,
            coltypes,
            alpha,
            zv,
            view_alphas,
            row_partitions,
            hypers,
            independence,
        } = self;

        if x.is_empty() {
            return Err(StateError::EmptyTable);
        }
        let outputs: Vec<usize> = x.keys().copied().collect();
        let n_rows = x[&outputs[0]].len();
        if n_rows == 0 {
            return Err(StateError::EmptyTable);
        }
        for (&col, xs) in &x {
            if xs.len() != n_rows {
                return Err(StateError::ColumnLengthMismatch {
                    col,
                    expected: n_rows,
                    got: xs.len(),
                });
            }
            if !coltypes.contains_key(&col) {
                return Err(StateError::UnknownColumn(col));
            }
        }
        for &(a, b) in &independence {
            if a == b {
                return Err(StateError::SelfConstraint(a));
            }
            for col in [a, b] {
                if !x.contains_key(&col) {
                    return Err(StateError::UnknownColumn(col));
                }
            }
        }

        let alpha = alpha.unwrap_or(1.0);
        let mut crp = Crp::new(alpha)?;
        match &zv {
            Some(zv) => {
                for &col in &outputs {
                    let &v = zv
                        .get(&col)
                        .ok_or(StateError::UnknownColumn(col))?;
                    crp.incorporate(col, v)?;
                }
                for &(a, b) in &independence {
                    if crp.assignment(a) == crp.assignment(b) {
                        return Err(StateError::ConstraintViolation(a, b));
                    }
                }
            }
            None => {
                let draw = crp_draw(outputs.len(), alpha, rng);
                for (&col, &v) in outputs.iter().zip(&draw.asgn) {
                    crp.incorporate(col, v)?;
                }
                // repair constraint violations by exiling the second
                // column to a fresh singleton view
                for &(a, b) in &independence {
                    if crp.assignment(a) == crp.assignment(b) {
                        crp.unincorporate(b)?;
                        let fresh = crp.fresh_id();
                        crp.incorporate(b, fresh)?;
                    }
                }
            }
        }

        let mut views: BTreeMap<usize, View> = BTreeMap::new();
        let view_ids: Vec<usize> = crp.counts().keys().copied().collect();
        for v in view_ids {
            let view_alpha = view_alphas.get(&v).copied().unwrap_or(1.0);
            let view = match row_partitions.get(&v) {
                Some(zs) => {
                    if zs.len() != n_rows {
                        return Err(StateError::RowPartitionLength {
                            view: v,
                            expected: n_rows,
                            got: zs.len(),
                        });
                    }
                    View::from_partition(LATENT_VAR_BASE + v, view_alpha, zs)?
                }
                None => View::from_prior(
                    LATENT_VAR_BASE + v,
                    view_alpha,
                    n_rows,
                    rng,
                )?,
            };
            views.insert(v, view);
        }

        for &col in &outputs {
            let mut dim = Dim::new(col, coltypes[&col], Vec::new());
            if let Some(h) = hypers.get(&col) {
                dim.set_hypers(h.clone());
            }
            let v = crp
                .assignment(col)
                .ok_or(StateError::UnknownColumn(col))?;
            let view = views
                .get_mut(&v)
                .ok_or(StateError::UnknownColumn(col))?;
            let asgn: Vec<(usize, usize)> =
                view.crp.asgn().iter().map(|(&r, &z)| (r, z)).collect();
            let column = &x[&col];
            for (rowid, z) in asgn {
                dim.incorporate(rowid, column[rowid], z);
            }
            dim.transition_hyper_grids();
            view.incorporate_dim(dim, false);
        }

        Ok(State {
            x,
            outputs,
            crp,
            views,
            independence,
            hooked: BTreeMap::new(),
            next_token: TOKEN_BASE,
            diagnostics: StateDiagnostics::default(),
        })
    }
}

pub struct State {
    /// column id → cell values in row order, NaN for missing
    x: BTreeMap<usize, Vec<f64>>,
    /// column ids in insertion order
    outputs: Vec<usize>,
    /// Column partition; cluster ids double as view ids
    crp: Crp,
    views: BTreeMap<usize, View>,
    /// Column pairs constrained to never share a view
    independence: Vec<(usize, usize)>,
    /// token → hooked foreign component
    hooked: BTreeMap<usize, Box<dyn Gpm>>,
    next_token: usize,
    diagnostics: StateDiagnostics,
}

// hooked components are trait objects, so this cannot be derived
impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("x", &self.x)
            .field("outputs", &self.outputs)
            .field("crp", &self.crp)
            .field("views", &self.views)
            .field("independence", &self.independence)
            .field(
                "hooked",
                &self.hooked.keys().copied().collect::<Vec<usize>>(),
            )
            .field("next_token", &self.next_token)
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

impl State {
    /// A state with both partitions drawn from their CRP priors.
    pub fn from_prior<R: Rng>(
        x: BTreeMap<usize, Vec<f64>>,
        coltypes: BTreeMap<usize, ColType>,
        rng: &mut R,
    ) -> Result<Self, StateError> {
        StateBuilder::new(x, coltypes).build(rng)
    }

    pub fn n_rows(&self) -> usize {
        self.x.values().next().map_or(0, Vec::len)
    }

    pub fn n_cols(&self) -> usize {
        self.x.len()
    }

    pub fn outputs(&self) -> &[usize] {
        &self.outputs
    }

    pub fn alpha(&self) -> f64 {
        self.crp.alpha()
    }

    pub fn views(&self) -> &BTreeMap<usize, View> {
        &self.views
    }

    /// The view a column is assigned to
    pub fn view_of(&self, col: usize) -> Result<usize, StateError> {
        self.crp
            .assignment(col)
            .ok_or(StateError::UnknownColumn(col))
    }

    pub fn diagnostics(&self) -> &StateDiagnostics {
        &self.diagnostics
    }

    /// The recorded, non-missing value of a cell
    fn cell(&self, rowid: usize, col: usize) -> Option<f64> {
        self.x
            .get(&col)
            .and_then(|xs| xs.get(rowid))
            .copied()
            .filter(|value| !value.is_nan())
    }

    fn latent_view(&self, var: usize) -> Option<usize> {
        var.checked_sub(LATENT_VAR_BASE)
            .filter(|v| self.views.contains_key(v))
    }

    /// Route a variable to the view that generates it.
    pub(crate) fn view_for_var(
        &self,
        var: usize,
    ) -> Result<usize, QueryError> {
        if let Some(v) = self.crp.assignment(var) {
            return Ok(v);
        }
        self.latent_view(var).ok_or(QueryError::UnknownVariable(var))
    }

    /// Composite states host foreign components or conditional columns and
    /// lose the closed-form query path.
    pub fn is_composite(&self) -> bool {
        !self.hooked.is_empty()
            || self
                .views
                .values()
                .any(|view| view.dims.values().any(Dim::is_conditional))
    }

    fn components(&self) -> Vec<&dyn Gpm> {
        self.views
            .values()
            .map(|view| view as &dyn Gpm)
            .chain(self.hooked.values().map(|c| c.as_ref()))
            .collect()
    }

    fn known_output(&self, var: usize) -> bool {
        self.x.contains_key(&var)
            || self.latent_view(var).is_some()
            || self.hooked.values().any(|c| c.outputs().contains(&var))
    }

    fn exogenous_input(&self, var: usize) -> bool {
        self.components().iter().any(|c| c.inputs().contains(&var))
    }

    /// Log marginal of the partitions, all columns, and hooked components.
    pub fn logpdf_score(&self) -> f64 {
        self.crp.logpdf_score()
            + self.views.values().map(View::logpdf_score).sum::<f64>()
            + self.hooked.values().map(|c| c.logpdf_score()).sum::<f64>()
    }

    // ------------------------------------------------------------------
    // Incorporate / unincorporate

    /// Append a row. Rows are append-only: `rowid` must equal the current
    /// row count. `values` maps column ids to cell values; absent or NaN
    /// cells are missing. A view's latent variable may be pinned to a
    /// cluster id; unpinned views seat the row by a Gibbs step.
    pub fn incorporate<R: Rng>(
        &mut self,
        rowid: usize,
        values: &Values,
        rng: &mut R,
    ) -> Result<(), StateError> {
        let expected = self.n_rows();
        if rowid != expected {
            return Err(StateError::NonContiguousRow {
                expected,
                got: rowid,
            });
        }
        for (&var, &value) in values {
            if self.x.contains_key(&var) {
                continue;
            }
            if self.latent_view(var).is_some() {
                let valid = value.is_finite()
                    && value >= 0.0
                    && value.fract() == 0.0;
                if !valid {
                    return Err(QueryError::InvalidValue {
                        col: var,
                        value,
                    }
                    .into());
                }
            } else {
                return Err(QueryError::UnknownVariable(var).into());
            }
        }
        for view in self.views.values_mut() {
            let latent = view.latent();
            let mut subset: Values = view
                .dims
                .keys()
                .filter_map(|col| values.get(col).map(|&x| (*col, x)))
                .collect();
            if let Some(&z) = values.get(&latent) {
                subset.insert(latent, z);
            }
            view.incorporate(rowid, &subset, rng)?;
        }
        for (&col, xs) in self.x.iter_mut() {
            xs.push(values.get(&col).copied().unwrap_or(f64::NAN));
        }
        Ok(())
    }

    /// Remove the last row. The final remaining row cannot be removed.
    pub fn unincorporate(&mut self, rowid: usize) -> Result<(), StateError> {
        let n = self.n_rows();
        if n <= 1 {
            return Err(StateError::LastRemainingRow);
        }
        if rowid != n - 1 {
            return Err(StateError::NotLastRow {
                last: n - 1,
                got: rowid,
            });
        }
        for view in self.views.values_mut() {
            view.unincorporate(rowid)?;
        }
        for xs in self.x.values_mut() {
            xs.pop();
        }
        Ok(())
    }

    /// Add a column. With `view` pinned the column joins that view,
    /// creating it from the prior if absent; otherwise the column is seated
    /// by a Gibbs step over the existing views.
    pub fn incorporate_dim<R: Rng>(
        &mut self,
        col: usize,
        values: Vec<f64>,
        ctype: ColType,
        inputs: Vec<usize>,
        view: Option<usize>,
        rng: &mut R,
    ) -> Result<(), StateError> {
        if self.x.contains_key(&col) {
            return Err(StateError::DuplicateColumn(col));
        }
        let n = self.n_rows();
        if values.len() != n {
            return Err(StateError::ColumnLengthMismatch {
                col,
                expected: n,
                got: values.len(),
            });
        }
        let conditional = !inputs.is_empty();
        let target = match view {
            Some(v) => {
                if !self.views.contains_key(&v) {
                    let fresh =
                        View::from_prior(LATENT_VAR_BASE + v, 1.0, n, rng)?;
                    self.views.insert(v, fresh);
                }
                v
            }
            None => *self
                .views
                .keys()
                .next()
                .ok_or(StateError::EmptyTable)?,
        };
        self.crp.incorporate(col, target)?;

        let mut dim = Dim::new(col, ctype, inputs);
        {
            let home = self
                .views
                .get_mut(&target)
                .ok_or(StateError::UnknownColumn(col))?;
            let asgn: Vec<(usize, usize)> =
                home.crp.asgn().iter().map(|(&r, &z)| (r, z)).collect();
            for (rowid, z) in asgn {
                dim.incorporate(rowid, values[rowid], z);
            }
            dim.transition_hyper_grids();
            home.incorporate_dim(dim, false);
        }
        self.x.insert(col, values);
        self.outputs.push(col);

        if view.is_none() && !conditional {
            self.transition_columns(Some(&[col]), M_AUX, rng)?;
            self.transition_dim_hypers(Some(&[col]), rng);
        }
        Ok(())
    }

    /// Remove a column. The final remaining column cannot be removed.
    pub fn unincorporate_dim(
        &mut self,
        col: usize,
    ) -> Result<(), StateError> {
        if !self.x.contains_key(&col) {
            return Err(StateError::UnknownColumn(col));
        }
        if self.x.len() == 1 {
            return Err(StateError::LastRemainingColumn);
        }
        let (v, emptied) = self.crp.unincorporate(col)?;
        if let Some(view) = self.views.get_mut(&v) {
            view.unincorporate_dim(col);
        }
        if emptied {
            self.views.remove(&v);
        }
        self.x.remove(&col);
        self.outputs.retain(|&c| c != col);
        Ok(())
    }

    /// Swap a column's statistical type in place, keeping its view and the
    /// row partition; hyperparameters are re-resampled for the new type.
    pub fn update_coltype<R: Rng>(
        &mut self,
        col: usize,
        ctype: ColType,
        rng: &mut R,
    ) -> Result<(), StateError> {
        let v = self.view_of(col)?;
        let view = self
            .views
            .get_mut(&v)
            .ok_or(StateError::UnknownColumn(col))?;
        let old = view
            .unincorporate_dim(col)
            .ok_or(StateError::UnknownColumn(col))?;
        let mut dim = Dim::new(col, ctype, old.inputs().to_vec());
        let asgn: Vec<(usize, usize)> =
            view.crp.asgn().iter().map(|(&r, &z)| (r, z)).collect();
        let column = &self.x[&col];
        for (rowid, z) in asgn {
            dim.incorporate(rowid, column[rowid], z);
        }
        dim.transition_hyper_grids();
        dim.transition_hypers(rng);
        view.incorporate_dim(dim, false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Foreign components

    /// Hook a foreign component into the state, returning its token. The
    /// composed graph must stay acyclic with unique outputs; a rejected
    /// component leaves the state untouched.
    pub fn compose_gpm(
        &mut self,
        component: Box<dyn Gpm>,
    ) -> Result<usize, StateError> {
        let token = self.next_token;
        self.hooked.insert(token, component);
        if let Err(err) = Network::new(self.components(), 1) {
            self.hooked.remove(&token);
            return Err(err.into());
        }
        self.next_token += 1;
        Ok(token)
    }

    /// Unhook a foreign component, returning it to the caller.
    pub fn decompose_gpm(
        &mut self,
        token: usize,
    ) -> Result<Box<dyn Gpm>, StateError> {
        self.hooked
            .remove(&token)
            .ok_or(StateError::UnknownToken(token))
    }

    // ------------------------------------------------------------------
    // Queries

    fn validate_query_evidence(
        &self,
        rowid: usize,
        query_vars: &BTreeSet<usize>,
        evidence: &Values,
        simulate: bool,
    ) -> Result<(), QueryError> {
        let overlap: Vec<usize> = query_vars
            .iter()
            .filter(|var| evidence.contains_key(var))
            .copied()
            .collect();
        if !overlap.is_empty() {
            return Err(QueryError::QueryEvidenceOverlap(overlap));
        }
        for &var in query_vars {
            if !self.known_output(var) {
                return Err(QueryError::UnknownVariable(var));
            }
        }
        for &var in evidence.keys() {
            if !self.known_output(var) && !self.exogenous_input(var) {
                return Err(QueryError::UnknownVariable(var));
            }
        }
        if rowid >= self.n_rows() {
            return Ok(());
        }
        // observed rows: recorded cells may not be queried under logpdf or
        // contradicted by evidence, and their cluster assignments are
        // determined by the partition
        for &var in query_vars {
            if self.latent_view(var).is_some() {
                return Err(QueryError::ClusterConstraintOnObservedRow(
                    rowid,
                ));
            }
            if !simulate && self.cell(rowid, var).is_some() {
                return Err(QueryError::QueryTargetsObservedCell {
                    row: rowid,
                    col: var,
                });
            }
        }
        for (&var, &value) in evidence {
            if self.latent_view(var).is_some() {
                return Err(QueryError::ClusterConstraintOnObservedRow(
                    rowid,
                ));
            }
            if let Some(recorded) = self.cell(rowid, var) {
                if !allclose(recorded, value) {
                    return Err(
                        QueryError::EvidenceContradictsObservedCell {
                            row: rowid,
                            col: var,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// For an observed row, extend the evidence with every recorded cell
    /// not already in the query or evidence.
    fn populate_evidence(
        &self,
        rowid: usize,
        query_vars: &BTreeSet<usize>,
        evidence: &Values,
    ) -> Values {
        let mut out = evidence.clone();
        if rowid < self.n_rows() {
            for &col in &self.outputs {
                if query_vars.contains(&col) || out.contains_key(&col) {
                    continue;
                }
                if let Some(value) = self.cell(rowid, col) {
                    out.insert(col, value);
                }
            }
        }
        out
    }

    /// Log density of `query` given `evidence` and the dataset. Exact for a
    /// plain state; estimated with `accuracy` importance samples per
    /// density for a composite one.
    pub fn logpdf<R: Rng>(
        &self,
        rowid: usize,
        query: &Values,
        evidence: &Values,
        accuracy: Option<usize>,
        rng: &mut R,
    ) -> Result<f64, StateError> {
        let query_vars: BTreeSet<usize> = query.keys().copied().collect();
        self.validate_query_evidence(rowid, &query_vars, evidence, false)?;
        if !self.is_composite() {
            return sampling::state_logpdf(self, rowid, query, evidence)
                .map_err(StateError::from);
        }
        let evidence = self.populate_evidence(rowid, &query_vars, evidence);
        let network =
            Network::new(self.components(), accuracy.unwrap_or(1))?;
        network
            .logpdf(rowid, query, &evidence, rng)
            .map_err(StateError::from)
    }

    /// Draw `n` joint records of `targets` given `evidence`.
    pub fn simulate<R: Rng>(
        &self,
        rowid: usize,
        targets: &[usize],
        evidence: &Values,
        n: usize,
        accuracy: Option<usize>,
        rng: &mut R,
    ) -> Result<Vec<Values>, StateError> {
        let mut seen = BTreeSet::new();
        for &var in targets {
            if !seen.insert(var) {
                return Err(QueryError::DuplicateTarget(var).into());
            }
        }
        self.validate_query_evidence(rowid, &seen, evidence, true)?;
        if !self.is_composite() {
            return sampling::state_simulate(
                self, rowid, targets, evidence, n, rng,
            )
            .map_err(StateError::from);
        }
        let evidence = self.populate_evidence(rowid, &seen, evidence);
        let network =
            Network::new(self.components(), accuracy.unwrap_or(1))?;
        network
            .simulate(rowid, targets, &evidence, n, rng)
            .map_err(StateError::from)
    }

    /// Evaluate many queries; the argument slices are parallel.
    pub fn logpdf_bulk<R: Rng>(
        &self,
        rowids: &[usize],
        queries: &[Values],
        evidences: &[Values],
        accuracy: Option<usize>,
        rng: &mut R,
    ) -> Result<Vec<f64>, StateError> {
        if rowids.len() != queries.len() {
            return Err(StateError::BulkLengthMismatch(
                rowids.len(),
                queries.len(),
            ));
        }
        if evidences.len() != queries.len() {
            return Err(StateError::BulkLengthMismatch(
                evidences.len(),
                queries.len(),
            ));
        }
        rowids
            .iter()
            .zip(queries)
            .zip(evidences)
            .map(|((&rowid, query), evidence)| {
                self.logpdf(rowid, query, evidence, accuracy, rng)
            })
            .collect()
    }

    /// Run many simulations; the argument slices are parallel and `counts`
    /// gives the number of draws for each.
    pub fn simulate_bulk<R: Rng>(
        &self,
        rowids: &[usize],
        targets: &[Vec<usize>],
        evidences: &[Values],
        counts: &[usize],
        accuracy: Option<usize>,
        rng: &mut R,
    ) -> Result<Vec<Vec<Values>>, StateError> {
        for other in [targets.len(), evidences.len(), counts.len()] {
            if other != rowids.len() {
                return Err(StateError::BulkLengthMismatch(
                    rowids.len(),
                    other,
                ));
            }
        }
        rowids
            .iter()
            .zip(targets)
            .zip(evidences)
            .zip(counts)
            .map(|(((&rowid, targets), evidence), &n)| {
                self.simulate(rowid, targets, evidence, n, accuracy, rng)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Structure queries

    /// Whether two columns are structurally dependent under the current
    /// partition: 1.0 when any generative path connects them, else 0.0.
    pub fn dependence_probability(
        &self,
        col0: usize,
        col1: usize,
    ) -> Result<f64, StateError> {
        let zv0 = self.crp.assignment(col0);
        let zv1 = self.crp.assignment(col1);
        if let (Some(v0), Some(v1)) = (zv0, zv1) {
            return Ok(if v0 == v1 { 1.0 } else { 0.0 });
        }
        for (col, zv) in [(col0, zv0), (col1, zv1)] {
            if zv.is_none() && !self.known_output(col) {
                return Err(StateError::UnknownColumn(col));
            }
        }
        let components = self.components();
        // one component producing both
        if components.iter().any(|c| {
            let outs = c.outputs();
            outs.contains(&col0) && outs.contains(&col1)
        }) {
            return Ok(1.0);
        }
        // a column's in-view peers play the role of its ancestors
        let ancestors = |col: usize, zv: Option<usize>| -> BTreeSet<usize> {
            match zv {
                Some(v) => self
                    .crp
                    .asgn()
                    .iter()
                    .filter(|(_, &z)| z == v)
                    .map(|(&c, _)| c)
                    .collect(),
                None => ancestor_vars(&components, col),
            }
        };
        let a0 = ancestors(col0, zv0);
        let a1 = ancestors(col1, zv1);
        if !a0.is_disjoint(&a1) {
            return Ok(1.0);
        }
        // shared view reachable through the ancestries
        let touched_views = |vars: &BTreeSet<usize>| -> BTreeSet<usize> {
            vars.iter()
                .filter_map(|&c| self.crp.assignment(c))
                .collect()
        };
        let v0 = touched_views(&a0);
        let v1 = touched_views(&a1);
        Ok(if v0.is_disjoint(&v1) { 0.0 } else { 1.0 })
    }

    /// Fraction of the views over `cols` in which two observed rows share
    /// a cluster. `None` means all columns.
    pub fn row_similarity(
        &self,
        row0: usize,
        row1: usize,
        cols: Option<&[usize]>,
    ) -> Result<f64, StateError> {
        let n = self.n_rows();
        for row in [row0, row1] {
            if row >= n {
                return Err(QueryError::UnknownRow(row).into());
            }
        }
        let cols: Vec<usize> = match cols {
            Some(cols) if !cols.is_empty() => cols.to_vec(),
            _ => self.outputs.clone(),
        };
        let mut view_ids = BTreeSet::new();
        for col in cols {
            view_ids.insert(self.view_of(col)?);
        }
        let agree = view_ids
            .iter()
            .filter(|v| {
                let view = &self.views[v];
                view.cluster_of(row0) == view.cluster_of(row1)
            })
            .count();
        Ok(agree as f64 / view_ids.len() as f64)
    }

    /// Monte Carlo estimate of the mutual information between two variable
    /// sets, which must be equal (yielding the entropy) or disjoint.
    ///
    /// Evidence values of `None` are marginalized over `t` posterior draws;
    /// each estimate uses `n` samples. Variable sets in unconnected
    /// component blocks contribute zero exactly.
    pub fn mutual_information<R: Rng>(
        &self,
        col0: &[usize],
        col1: &[usize],
        evidence: &BTreeMap<usize, Option<f64>>,
        t: usize,
        n: usize,
        rng: &mut R,
    ) -> Result<f64, StateError> {
        let s0: BTreeSet<usize> = col0.iter().copied().collect();
        let s1: BTreeSet<usize> = col1.iter().copied().collect();
        if s0.is_empty() || s1.is_empty() {
            return Err(StateError::EmptyTargets);
        }
        if s0 != s1 {
            if let Some(&shared) = s0.intersection(&s1).next() {
                return Err(QueryError::DuplicateTarget(shared).into());
            }
        }
        let overlap: Vec<usize> = s0
            .union(&s1)
            .filter(|var| evidence.contains_key(var))
            .copied()
            .collect();
        if !overlap.is_empty() {
            return Err(QueryError::QueryEvidenceOverlap(overlap).into());
        }

        let pinned: Values = evidence
            .iter()
            .filter_map(|(&var, value)| value.map(|v| (var, v)))
            .collect();
        let marginalized: Vec<usize> = evidence
            .iter()
            .filter_map(|(&var, value)| value.is_none().then_some(var))
            .collect();
        if marginalized.is_empty() {
            return self.compute_mi(&s0, &s1, &pinned, n, rng);
        }
        let hypothetical = self.n_rows();
        let draws = self.simulate(
            hypothetical,
            &marginalized,
            &pinned,
            t.max(1),
            None,
            rng,
        )?;
        let mut total = 0.0;
        for draw in &draws {
            let mut ev = pinned.clone();
            ev.extend(draw.iter().map(|(&var, &value)| (var, value)));
            total += self.compute_mi(&s0, &s1, &ev, n, rng)?;
        }
        Ok(total / draws.len() as f64)
    }

    fn compute_mi<R: Rng>(
        &self,
        s0: &BTreeSet<usize>,
        s1: &BTreeSet<usize>,
        evidence: &Values,
        n: usize,
        rng: &mut R,
    ) -> Result<f64, StateError> {
        let components = self.components();
        let owners = variable_owners(&components);
        let blocks = connected_blocks(&components);
        let n_blocks = blocks.iter().copied().max().map_or(0, |b| b + 1);
        let block_of = |var: usize| owners.get(&var).map(|&ix| blocks[ix]);

        let mut total = 0.0;
        for b in 0..n_blocks {
            let b0: Vec<usize> = s0
                .iter()
                .filter(|&&var| block_of(var) == Some(b))
                .copied()
                .collect();
            let b1: Vec<usize> = s1
                .iter()
                .filter(|&&var| block_of(var) == Some(b))
                .copied()
                .collect();
            if b0.is_empty() || b1.is_empty() {
                continue;
            }
            let ev: Values = evidence
                .iter()
                .filter(|(&var, _)| block_of(var) == Some(b))
                .map(|(&var, &value)| (var, value))
                .collect();
            total += self.mi_estimate(&b0, &b1, &ev, n, rng)?;
        }
        Ok(total)
    }

    fn mi_estimate<R: Rng>(
        &self,
        c0: &[usize],
        c1: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut R,
    ) -> Result<f64, StateError> {
        let hypothetical = self.n_rows();
        let n = n.max(1);
        if c0 == c1 {
            // MI of a set with itself is its entropy
            let draws = self
                .simulate(hypothetical, c0, evidence, n, None, rng)?;
            let mut h = 0.0;
            for draw in &draws {
                h += self.logpdf(hypothetical, draw, evidence, None, rng)?;
            }
            return Ok(-h / n as f64);
        }
        let targets: Vec<usize> =
            c0.iter().chain(c1.iter()).copied().collect();
        let draws =
            self.simulate(hypothetical, &targets, evidence, n, None, rng)?;
        let mut mi = 0.0;
        for draw in &draws {
            let q0: Values = c0
                .iter()
                .filter_map(|var| draw.get(var).map(|&v| (*var, v)))
                .collect();
            let q1: Values = c1
                .iter()
                .filter_map(|var| draw.get(var).map(|&v| (*var, v)))
                .collect();
            let joint =
                self.logpdf(hypothetical, draw, evidence, None, rng)?;
            let lp0 = self.logpdf(hypothetical, &q0, evidence, None, rng)?;
            let lp1 = self.logpdf(hypothetical, &q1, evidence, None, rng)?;
            mi += joint - lp0 - lp1;
        }
        Ok(mi / n as f64)
    }

    // ------------------------------------------------------------------
    // Inference kernels

    /// Run the configured kernel schedule, recording diagnostics at each
    /// checkpoint. Stops at whichever of the iteration and wall-clock
    /// budgets trips first.
    pub fn update<R: Rng>(
        &mut self,
        config: StateUpdateConfig,
        rng: &mut R,
    ) -> Result<(), StateError> {
        let started = Instant::now();
        let mut iter = 0;
        loop {
            if config.check_over_iters(iter) || config.check_over_time(started)
            {
                break;
            }
            for &transition in &config.transitions {
                self.step(transition, rng)?;
                *self
                    .diagnostics
                    .iterations
                    .entry(transition.name().to_string())
                    .or_insert(0) += 1;
                if config.check_over_time(started) {
                    break;
                }
            }
            if config.checkpoint_due(iter) {
                self.push_diagnostics();
            }
            iter += 1;
        }
        Ok(())
    }

    fn step<R: Rng>(
        &mut self,
        transition: StateTransition,
        rng: &mut R,
    ) -> Result<(), StateError> {
        match transition {
            StateTransition::ColumnAssignment => {
                self.transition_columns(None, M_AUX, rng)?;
            }
            StateTransition::RowAssignment => self.transition_rows(rng),
            StateTransition::ColumnAlpha => {
                self.crp.transition_alpha(rng);
            }
            StateTransition::ViewAlphas => {
                self.transition_view_alphas(rng);
            }
            StateTransition::ColumnHypers => {
                self.transition_dim_hypers(None, rng);
            }
            StateTransition::Foreign => self.transition_foreign(rng),
        }
        Ok(())
    }

    fn push_diagnostics(&mut self) {
        self.diagnostics.loglike.push(self.logpdf_score());
        self.diagnostics.column_alpha.push(self.crp.alpha());
        self.diagnostics.column_partition.push(
            self.crp.asgn().iter().map(|(&c, &v)| (c, v)).collect(),
        );
    }

    pub fn transition_rows<R: Rng>(&mut self, rng: &mut R) {
        for view in self.views.values_mut() {
            view.transition_rows(None, rng);
        }
    }

    pub fn transition_view_alphas<R: Rng>(&mut self, rng: &mut R) {
        for view in self.views.values_mut() {
            view.transition_alpha(rng);
        }
    }

    pub fn transition_dim_hypers<R: Rng>(
        &mut self,
        cols: Option<&[usize]>,
        rng: &mut R,
    ) {
        match cols {
            None => {
                for view in self.views.values_mut() {
                    view.transition_hypers(rng);
                }
            }
            Some(cols) => {
                for &col in cols {
                    let dim = self.crp.assignment(col).and_then(|v| {
                        self.views
                            .get_mut(&v)
                            .and_then(|view| view.dims.get_mut(&col))
                    });
                    if let Some(dim) = dim {
                        dim.transition_hypers(rng);
                    }
                }
            }
        }
    }

    pub fn transition_foreign<R: Rng>(&mut self, rng: &mut R) {
        for component in self.hooked.values_mut() {
            component.transition(&mut *rng);
        }
    }

    /// Gibbs-reassign columns to views. `None` covers every unconditional
    /// column in shuffled order; naming a conditional column is an error.
    /// `m` auxiliary views are entertained per column.
    pub fn transition_columns<R: Rng>(
        &mut self,
        cols: Option<&[usize]>,
        m: usize,
        rng: &mut R,
    ) -> Result<(), StateError> {
        let mut cols: Vec<usize> = match cols {
            Some(cols) => {
                for &col in cols {
                    if !self.x.contains_key(&col) {
                        return Err(StateError::UnknownColumn(col));
                    }
                    if self.dim_is_conditional(col) {
                        return Err(StateError::ConditionalColumn(col));
                    }
                }
                cols.to_vec()
            }
            None => self
                .outputs
                .iter()
                .copied()
                .filter(|&col| !self.dim_is_conditional(col))
                .collect(),
        };
        cols.shuffle(rng);
        for col in cols {
            self.transition_column_gibbs(col, m, rng)?;
        }
        Ok(())
    }

    fn dim_is_conditional(&self, col: usize) -> bool {
        self.crp
            .assignment(col)
            .and_then(|v| self.views.get(&v))
            .and_then(|view| view.dims.get(&col))
            .map_or(false, Dim::is_conditional)
    }

    fn transition_column_gibbs<R: Rng>(
        &mut self,
        col: usize,
        m: usize,
        rng: &mut R,
    ) -> Result<(), StateError> {
        let current = self
            .crp
            .assignment(col)
            .ok_or(StateError::UnknownColumn(col))?;
        let tables = self.crp.gibbs_tables(col, m);
        let mut logps = self.crp.gibbs_logps(col, m);

        let mut dim = self
            .views
            .get_mut(&current)
            .and_then(|view| view.unincorporate_dim(col))
            .ok_or(StateError::UnknownColumn(col))?;

        // auxiliary views drawn from the prior
        let n_rows = self.n_rows();
        let mut fresh: BTreeMap<usize, View> = BTreeMap::new();
        for &t in &tables {
            if !self.views.contains_key(&t) {
                let view =
                    View::from_prior(LATENT_VAR_BASE + t, 1.0, n_rows, rng)?;
                fresh.insert(t, view);
            }
        }

        // marginal of the column under each candidate row partition
        for (ix, &t) in tables.iter().enumerate() {
            let view = self.views.get(&t).or_else(|| fresh.get(&t));
            if let Some(view) = view {
                dim.reassign(view.crp.asgn());
                logps[ix] += dim.logpdf_score();
            }
        }

        // independence constraints zero out the partner's view
        for &(a, b) in &self.independence {
            let partner = if a == col {
                Some(b)
            } else if b == col {
                Some(a)
            } else {
                None
            };
            if let Some(pv) = partner.and_then(|p| self.crp.assignment(p)) {
                for (ix, &t) in tables.iter().enumerate() {
                    if t == pv {
                        logps[ix] = f64::NEG_INFINITY;
                    }
                }
            }
        }

        let pick = ln_pflip(&logps, 1, false, rng)[0];
        let choice = tables[pick];

        let (prev, emptied) = self.crp.unincorporate(col)?;
        self.crp.incorporate(col, choice)?;
        if emptied && choice != prev {
            self.views.remove(&prev);
        }
        if let Some(view) = fresh.remove(&choice) {
            self.views.insert(choice, view);
        }
        if let Some(view) = self.views.get_mut(&choice) {
            view.incorporate_dim(dim, true);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Validation and serialization

    /// Deep structural check of both partition levels.
    pub fn check_partitions(&self) -> Result<(), ConsistencyError> {
        self.crp.validate()?;
        for (&v, &count) in self.crp.counts() {
            let n_dims = self.views.get(&v).map_or(0, |view| view.dims.len());
            if n_dims != count {
                return Err(ConsistencyError::OccupancyMismatch {
                    cluster: v,
                    counted: n_dims,
                    recorded: count,
                });
            }
        }
        for view in self.views.values() {
            view.check_partitions()?;
        }
        Ok(())
    }

    pub fn to_metadata(&self) -> Result<StateMetadata, MetadataError> {
        let x = self
            .x
            .iter()
            .map(|(&col, xs)| {
                let cells = xs
                    .iter()
                    .map(|&v| if v.is_nan() { None } else { Some(v) })
                    .collect();
                (col, cells)
            })
            .collect();
        let hooked = self
            .hooked
            .iter()
            .map(|(&token, component)| {
                component.to_metadata().map(|m| (token, m))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StateMetadata {
            factory: STATE_FACTORY.to_string(),
            x,
            outputs: self.outputs.clone(),
            column_crp: self.crp.clone(),
            views: self
                .views
                .iter()
                .map(|(&v, view)| (v, view.clone()))
                .collect(),
            independence: self.independence.clone(),
            diagnostics: self.diagnostics.clone(),
            hooked,
            next_token: self.next_token,
        })
    }

    /// Revive a state from its metadata; hooked components are rebuilt
    /// through the registry.
    pub fn from_metadata(
        metadata: StateMetadata,
        registry: &FactoryRegistry,
    ) -> Result<Self, MetadataError> {
        if metadata.factory != STATE_FACTORY {
            return Err(MetadataError::InvalidPayload {
                factory: metadata.factory,
                reason: "not a state record".into(),
            });
        }
        let x = metadata
            .x
            .into_iter()
            .map(|(col, cells)| {
                let xs = cells
                    .into_iter()
                    .map(|v| v.unwrap_or(f64::NAN))
                    .collect();
                (col, xs)
            })
            .collect();
        let views: BTreeMap<usize, View> =
            metadata.views.into_iter().collect();
        let hooked = metadata
            .hooked
            .into_iter()
            .map(|(token, m)| registry.build(&m).map(|c| (token, c)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(State {
            x,
            outputs: metadata.outputs,
            crp: metadata.column_crp,
            views,
            independence: metadata.independence,
            hooked,
            next_token: metadata.next_token,
            diagnostics: metadata.diagnostics,
        })
    }
}

impl Gpm for State {
    fn outputs(&self) -> Vec<usize> {
        self.outputs
            .iter()
            .copied()
            .chain(self.views.keys().map(|&v| LATENT_VAR_BASE + v))
            .chain(self.hooked.values().flat_map(|c| c.outputs()))
            .collect()
    }

    fn inputs(&self) -> Vec<usize> {
        let components = self.components();
        let produced: BTreeSet<usize> =
            components.iter().flat_map(|c| c.outputs()).collect();
        let mut inputs: Vec<usize> = components
            .iter()
            .flat_map(|c| c.inputs())
            .filter(|var| !produced.contains(var))
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
        State::incorporate(self, rowid, query, &mut &mut *rng)
    }

    fn unincorporate(&mut self, rowid: usize) -> Result<(), StateError> {
        State::unincorporate(self, rowid)
    }

    fn logpdf(
        &self,
        rowid: usize,
        query: &Values,
        evidence: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<f64, QueryError> {
        State::logpdf(self, rowid, query, evidence, None, &mut &mut *rng)
            .map_err(|err| match err {
                StateError::Query(err) => err,
                err => QueryError::Dispatch(err.to_string()),
            })
    }

    fn simulate(
        &self,
        rowid: usize,
        targets: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Values>, QueryError> {
        State::simulate(
            self,
            rowid,
            targets,
            evidence,
            n,
            None,
            &mut &mut *rng,
        )
        .map_err(|err| match err {
            StateError::Query(err) => err,
            err => QueryError::Dispatch(err.to_string()),
        })
    }

    fn logpdf_score(&self) -> f64 {
        self.logpdf_score()
    }

    fn transition(&mut self, rng: &mut dyn RngCore) {
        let _ = self.update(StateUpdateConfig::new(), &mut &mut *rng);
    }

    fn to_metadata(&self) -> Result<GpmMetadata, MetadataError> {
        let metadata = State::to_metadata(self)?;
        Ok(GpmMetadata {
            factory: STATE_FACTORY.to_string(),
            payload: serde_json::to_value(&metadata)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use maplit::btreemap;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn rng() -> Xoshiro256Plus {
        Xoshiro256Plus::seed_from_u64(0x0505)
    }

    /// Two Bernoulli columns in one view, three rows in two clusters.
    fn one_view_state() -> State {
        StateBuilder::new(
            btreemap! {
                0 => vec![1.0, 0.0, 1.0],
                1 => vec![0.0, 0.0, 1.0],
            },
            btreemap! {
                0 => ColType::Bernoulli,
                1 => ColType::Bernoulli,
            },
        )
        .column_partition(btreemap! {0 => 0, 1 => 0})
        .row_partition(0, vec![0, 0, 1])
        .build(&mut rng())
        .unwrap()
    }

    /// Two Bernoulli columns in separate views.
    fn two_view_state() -> State {
        StateBuilder::new(
            btreemap! {
                0 => vec![1.0, 0.0, 1.0],
                1 => vec![0.0, 0.0, 1.0],
            },
            btreemap! {
                0 => ColType::Bernoulli,
                1 => ColType::Bernoulli,
            },
        )
        .column_partition(btreemap! {0 => 0, 1 => 1})
        .row_partition(0, vec![0, 0, 1])
        .row_partition(1, vec![0, 1, 1])
        .build(&mut rng())
        .unwrap()
    }

    /// Like `one_view_state`, but cell (0, 1) is missing.
    fn missing_cell_state() -> State {
        StateBuilder::new(
            btreemap! {
                0 => vec![1.0, 0.0, 1.0],
                1 => vec![f64::NAN, 0.0, 1.0],
            },
            btreemap! {
                0 => ColType::Bernoulli,
                1 => ColType::Bernoulli,
            },
        )
        .column_partition(btreemap! {0 => 0, 1 => 0})
        .row_partition(0, vec![0, 0, 1])
        .build(&mut rng())
        .unwrap()
    }

    mod builder {
        use super::*;

        #[test]
        fn empty_table_is_an_error() {
            let err = StateBuilder::new(BTreeMap::new(), BTreeMap::new())
                .build(&mut rng())
                .unwrap_err();
            assert_eq!(err, StateError::EmptyTable);
        }

        #[test]
        fn ragged_columns_are_an_error() {
            let err = StateBuilder::new(
                btreemap! {0 => vec![1.0, 0.0], 1 => vec![1.0]},
                btreemap! {
                    0 => ColType::Bernoulli,
                    1 => ColType::Bernoulli,
                },
            )
            .build(&mut rng())
            .unwrap_err();
            assert_eq!(
                err,
                StateError::ColumnLengthMismatch {
                    col: 1,
                    expected: 2,
                    got: 1
                }
            );
        }

        #[test]
        fn missing_coltype_is_an_error() {
            let err = StateBuilder::new(
                btreemap! {0 => vec![1.0]},
                BTreeMap::new(),
            )
            .build(&mut rng())
            .unwrap_err();
            assert_eq!(err, StateError::UnknownColumn(0));
        }

        #[test]
        fn self_independence_is_an_error() {
            let err = StateBuilder::new(
                btreemap! {0 => vec![1.0]},
                btreemap! {0 => ColType::Bernoulli},
            )
            .independent(0, 0)
            .build(&mut rng())
            .unwrap_err();
            assert_eq!(err, StateError::SelfConstraint(0));
        }

        #[test]
        fn pinned_partition_must_honor_independence() {
            let err = StateBuilder::new(
                btreemap! {0 => vec![1.0], 1 => vec![0.0]},
                btreemap! {
                    0 => ColType::Bernoulli,
                    1 => ColType::Bernoulli,
                },
            )
            .column_partition(btreemap! {0 => 0, 1 => 0})
            .independent(0, 1)
            .build(&mut rng())
            .unwrap_err();
            assert_eq!(err, StateError::ConstraintViolation(0, 1));
        }

        #[test]
        fn random_partition_repairs_independence() {
            let mut rng = rng();
            for _ in 0..20 {
                let state = StateBuilder::new(
                    btreemap! {
                        0 => vec![1.0, 0.0],
                        1 => vec![0.0, 1.0],
                    },
                    btreemap! {
                        0 => ColType::Bernoulli,
                        1 => ColType::Bernoulli,
                    },
                )
                .independent(0, 1)
                .build(&mut rng)
                .unwrap();
                assert_ne!(
                    state.view_of(0).unwrap(),
                    state.view_of(1).unwrap()
                );
            }
        }

        #[test]
        fn pinned_structure_is_kept() {
            let state = two_view_state();
            assert_eq!(state.n_rows(), 3);
            assert_eq!(state.n_cols(), 2);
            assert_eq!(state.view_of(0).unwrap(), 0);
            assert_eq!(state.view_of(1).unwrap(), 1);
            assert_eq!(state.views()[&0].cluster_of(2), Some(1));
            assert_eq!(state.views()[&1].cluster_of(0), Some(0));
            state.check_partitions().unwrap();
        }
    }

    mod rows {
        use super::*;

        #[test]
        fn rows_are_append_only() {
            let mut state = one_view_state();
            let err = state
                .incorporate(7, &btreemap! {0 => 1.0}, &mut rng())
                .unwrap_err();
            assert_eq!(
                err,
                StateError::NonContiguousRow { expected: 3, got: 7 }
            );
        }

        #[test]
        fn unknown_variable_is_rejected() {
            let mut state = one_view_state();
            let err = state
                .incorporate(3, &btreemap! {9 => 1.0}, &mut rng())
                .unwrap_err();
            assert_eq!(
                err,
                StateError::Query(QueryError::UnknownVariable(9))
            );
        }

        #[test]
        fn incorporate_then_unincorporate_restores_the_score() {
            let mut state = one_view_state();
            let before = state.logpdf_score();
            state
                .incorporate(
                    3,
                    &btreemap! {0 => 1.0, LATENT_VAR_BASE => 0.0},
                    &mut rng(),
                )
                .unwrap();
            assert_eq!(state.n_rows(), 4);
            state.unincorporate(3).unwrap();
            assert_eq!(state.n_rows(), 3);
            assert_relative_eq!(
                state.logpdf_score(),
                before,
                epsilon = 1e-12
            );
            state.check_partitions().unwrap();
        }

        #[test]
        fn pinned_latent_seats_the_row() {
            let mut state = one_view_state();
            state
                .incorporate(
                    3,
                    &btreemap! {0 => 0.0, LATENT_VAR_BASE => 1.0},
                    &mut rng(),
                )
                .unwrap();
            assert_eq!(state.views()[&0].cluster_of(3), Some(1));
        }

        #[test]
        fn only_the_last_row_may_leave() {
            let mut state = one_view_state();
            let err = state.unincorporate(0).unwrap_err();
            assert_eq!(err, StateError::NotLastRow { last: 2, got: 0 });
        }

        #[test]
        fn the_last_remaining_row_stays() {
            let mut state = StateBuilder::new(
                btreemap! {0 => vec![1.0]},
                btreemap! {0 => ColType::Bernoulli},
            )
            .build(&mut rng())
            .unwrap();
            assert_eq!(
                state.unincorporate(0).unwrap_err(),
                StateError::LastRemainingRow
            );
        }

        #[test]
        fn missing_cells_are_recorded_as_nan() {
            let mut state = one_view_state();
            state
                .incorporate(3, &btreemap! {1 => 1.0}, &mut rng())
                .unwrap();
            assert!(state.cell(3, 0).is_none());
            assert_eq!(state.cell(3, 1), Some(1.0));
        }
    }

    mod columns {
        use super::*;

        #[test]
        fn incorporate_dim_into_pinned_view() {
            let mut state = one_view_state();
            state
                .incorporate_dim(
                    2,
                    vec![0.5, 1.5, -0.5],
                    ColType::Gaussian,
                    Vec::new(),
                    Some(0),
                    &mut rng(),
                )
                .unwrap();
            assert_eq!(state.n_cols(), 3);
            assert_eq!(state.view_of(2).unwrap(), 0);
            state.check_partitions().unwrap();
        }

        #[test]
        fn incorporate_dim_without_view_finds_a_home() {
            let mut state = two_view_state();
            state
                .incorporate_dim(
                    2,
                    vec![1.0, 1.0, 0.0],
                    ColType::Bernoulli,
                    Vec::new(),
                    None,
                    &mut rng(),
                )
                .unwrap();
            assert!(state.view_of(2).is_ok());
            state.check_partitions().unwrap();
        }

        #[test]
        fn duplicate_column_is_an_error() {
            let mut state = one_view_state();
            let err = state
                .incorporate_dim(
                    0,
                    vec![0.0; 3],
                    ColType::Bernoulli,
                    Vec::new(),
                    None,
                    &mut rng(),
                )
                .unwrap_err();
            assert_eq!(err, StateError::DuplicateColumn(0));
        }

        #[test]
        fn unincorporate_dim_drops_emptied_views() {
            let mut state = two_view_state();
            state.unincorporate_dim(1).unwrap();
            assert_eq!(state.n_cols(), 1);
            assert!(!state.views().contains_key(&1));
            state.check_partitions().unwrap();
        }

        #[test]
        fn the_last_column_stays() {
            let mut state = StateBuilder::new(
                btreemap! {0 => vec![1.0, 0.0]},
                btreemap! {0 => ColType::Bernoulli},
            )
            .build(&mut rng())
            .unwrap();
            assert_eq!(
                state.unincorporate_dim(0).unwrap_err(),
                StateError::LastRemainingColumn
            );
        }

        #[test]
        fn update_coltype_keeps_the_partition() {
            let mut state = one_view_state();
            let zs_before: Vec<_> =
                (0..3).map(|r| state.views()[&0].cluster_of(r)).collect();
            state
                .update_coltype(1, ColType::Gaussian, &mut rng())
                .unwrap();
            let zs_after: Vec<_> =
                (0..3).map(|r| state.views()[&0].cluster_of(r)).collect();
            assert_eq!(zs_before, zs_after);
            assert!(state.logpdf_score().is_finite());
        }
    }

    mod queries {
        use super::*;

        #[test]
        fn logpdf_factorizes_across_views() {
            let state = two_view_state();
            let mut rng = rng();
            let joint = state
                .logpdf(
                    3,
                    &btreemap! {0 => 1.0, 1 => 0.0},
                    &Values::new(),
                    None,
                    &mut rng,
                )
                .unwrap();
            let lp0 = state
                .logpdf(3, &btreemap! {0 => 1.0}, &Values::new(), None, &mut rng)
                .unwrap();
            let lp1 = state
                .logpdf(3, &btreemap! {1 => 0.0}, &Values::new(), None, &mut rng)
                .unwrap();
            assert_relative_eq!(joint, lp0 + lp1, epsilon = 1e-12);
        }

        #[test]
        fn state_logpdf_matches_the_view() {
            let state = one_view_state();
            let mut rng = rng();
            let from_state = state
                .logpdf(3, &btreemap! {0 => 1.0}, &Values::new(), None, &mut rng)
                .unwrap();
            let from_view = state.views()[&0]
                .logpdf(3, &btreemap! {0 => 1.0}, &Values::new())
                .unwrap();
            assert_relative_eq!(from_state, from_view, epsilon = 1e-12);
        }

        #[test]
        fn latent_variables_are_queryable() {
            let state = one_view_state();
            let mut rng = rng();
            // hypothetical member: P(z=0) + P(z=1) + P(z fresh) = 1
            let logps: Vec<f64> = [0.0, 1.0, 2.0]
                .iter()
                .map(|&z| {
                    state
                        .logpdf(
                            3,
                            &btreemap! {LATENT_VAR_BASE => z},
                            &Values::new(),
                            None,
                            &mut rng,
                        )
                        .unwrap()
                })
                .collect();
            let total: f64 = logps.iter().map(|lp| lp.exp()).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }

        #[test]
        fn observed_cells_cannot_be_queried_under_logpdf() {
            let state = one_view_state();
            let err = state
                .logpdf(
                    0,
                    &btreemap! {0 => 1.0},
                    &Values::new(),
                    None,
                    &mut rng(),
                )
                .unwrap_err();
            assert_eq!(
                err,
                StateError::Query(QueryError::QueryTargetsObservedCell {
                    row: 0,
                    col: 0
                })
            );
        }

        #[test]
        fn observed_cells_may_be_simulated() {
            let state = one_view_state();
            let draws = state
                .simulate(0, &[0], &Values::new(), 8, None, &mut rng())
                .unwrap();
            assert_eq!(draws.len(), 8);
            for draw in draws {
                let x = draw[&0];
                assert!(x == 0.0 || x == 1.0);
            }
        }

        #[test]
        fn evidence_must_agree_with_recorded_cells() {
            // cell (0, 1) is missing, so querying it is legal; the
            // evidence still contradicts the recorded (0, 0) = 1
            let state = missing_cell_state();
            let err = state
                .logpdf(
                    0,
                    &btreemap! {1 => 1.0},
                    &btreemap! {0 => 0.0},
                    None,
                    &mut rng(),
                )
                .unwrap_err();
            assert_eq!(
                err,
                StateError::Query(
                    QueryError::EvidenceContradictsObservedCell {
                        row: 0,
                        col: 0
                    }
                )
            );
        }

        #[test]
        fn cluster_constraints_on_observed_rows_are_rejected() {
            let state = missing_cell_state();
            let err = state
                .logpdf(
                    0,
                    &btreemap! {1 => 1.0},
                    &btreemap! {LATENT_VAR_BASE => 0.0},
                    None,
                    &mut rng(),
                )
                .unwrap_err();
            assert_eq!(
                err,
                StateError::Query(
                    QueryError::ClusterConstraintOnObservedRow(0)
                )
            );
        }

        #[test]
        fn simulate_respects_the_support() {
            let state = two_view_state();
            let draws = state
                .simulate(3, &[0, 1], &Values::new(), 16, None, &mut rng())
                .unwrap();
            assert_eq!(draws.len(), 16);
            for draw in draws {
                assert_eq!(draw.len(), 2);
                for col in [0, 1] {
                    let x = draw[&col];
                    assert!(x == 0.0 || x == 1.0);
                }
            }
        }

        #[test]
        fn bulk_queries_zip_their_arguments() {
            let state = one_view_state();
            let mut rng = rng();
            let lps = state
                .logpdf_bulk(
                    &[3, 3],
                    &[btreemap! {0 => 1.0}, btreemap! {0 => 0.0}],
                    &[Values::new(), Values::new()],
                    None,
                    &mut rng,
                )
                .unwrap();
            assert_eq!(lps.len(), 2);
            assert_relative_eq!(
                lps[0].exp() + lps[1].exp(),
                1.0,
                epsilon = 1e-9
            );

            let err = state
                .logpdf_bulk(
                    &[3],
                    &[],
                    &[],
                    None,
                    &mut rng,
                )
                .unwrap_err();
            assert_eq!(err, StateError::BulkLengthMismatch(1, 0));
        }

        #[test]
        fn simulate_bulk_honors_counts() {
            let state = one_view_state();
            let draws = state
                .simulate_bulk(
                    &[3, 3],
                    &[vec![0], vec![1]],
                    &[Values::new(), Values::new()],
                    &[2, 5],
                    None,
                    &mut rng(),
                )
                .unwrap();
            assert_eq!(draws[0].len(), 2);
            assert_eq!(draws[1].len(), 5);
        }
    }

    mod structure {
        use super::*;

        #[test]
        fn dependence_probability_tracks_the_partition() {
            let one = one_view_state();
            assert_eq!(one.dependence_probability(0, 1).unwrap(), 1.0);
            let two = two_view_state();
            assert_eq!(two.dependence_probability(0, 1).unwrap(), 0.0);
        }

        #[test]
        fn row_similarity_counts_agreeing_views() {
            let state = two_view_state();
            // view 0 partition [0,0,1], view 1 partition [0,1,1]
            assert_relative_eq!(
                state.row_similarity(0, 1, None).unwrap(),
                0.5
            );
            assert_relative_eq!(
                state.row_similarity(0, 1, Some(&[0])).unwrap(),
                1.0
            );
            assert_relative_eq!(
                state.row_similarity(1, 2, Some(&[1])).unwrap(),
                1.0
            );
        }

        #[test]
        fn row_similarity_requires_observed_rows() {
            let state = one_view_state();
            assert!(matches!(
                state.row_similarity(0, 9, None),
                Err(StateError::Query(QueryError::UnknownRow(9)))
            ));
        }

        #[test]
        fn self_mutual_information_is_an_entropy() {
            let state = one_view_state();
            let h = state
                .mutual_information(
                    &[0],
                    &[0],
                    &BTreeMap::new(),
                    1,
                    64,
                    &mut rng(),
                )
                .unwrap();
            // the predictive puts mass on both points, so every sampled
            // surprisal lies strictly between 0 and -ln min(p0, p1) < 1
            assert!(h > 0.0);
            assert!(h < 1.0);
        }

        #[test]
        fn unconnected_views_carry_no_information() {
            let state = two_view_state();
            let mi = state
                .mutual_information(
                    &[0],
                    &[1],
                    &BTreeMap::new(),
                    1,
                    16,
                    &mut rng(),
                )
                .unwrap();
            assert_eq!(mi, 0.0);
        }

        #[test]
        fn mutual_information_rejects_overlapping_sets() {
            let state = one_view_state();
            assert!(matches!(
                state.mutual_information(
                    &[0, 1],
                    &[1],
                    &BTreeMap::new(),
                    1,
                    4,
                    &mut rng(),
                ),
                Err(StateError::Query(QueryError::DuplicateTarget(1)))
            ));
        }
    }

    mod kernels {
        use super::*;

        #[test]
        fn update_counts_kernel_applications() {
            let mut state = one_view_state();
            let config = StateUpdateConfig::with_iters(3);
            state.update(config, &mut rng()).unwrap();
            for transition in crate::transition::DEFAULT_STATE_TRANSITIONS {
                assert_eq!(
                    state.diagnostics().iterations[transition.name()],
                    3
                );
            }
            state.check_partitions().unwrap();
        }

        #[test]
        fn checkpoints_record_diagnostics() {
            let mut state = one_view_state();
            let config = StateUpdateConfig {
                checkpoint: Some(2),
                ..StateUpdateConfig::with_iters(4)
            };
            state.update(config, &mut rng()).unwrap();
            let diagnostics = state.diagnostics();
            assert_eq!(diagnostics.loglike.len(), 2);
            assert_eq!(diagnostics.column_alpha.len(), 2);
            assert_eq!(diagnostics.column_partition.len(), 2);
            assert!(diagnostics.loglike.iter().all(|lp| lp.is_finite()));
        }

        #[test]
        fn column_kernel_keeps_the_state_coherent() {
            let mut state = two_view_state();
            let mut rng = rng();
            for _ in 0..20 {
                state.transition_columns(None, 1, &mut rng).unwrap();
                state.check_partitions().unwrap();
            }
            assert!(state.logpdf_score().is_finite());
        }

        #[test]
        fn fixed_seed_updates_are_deterministic() {
            let run = || {
                let mut state = two_view_state();
                let mut rng = Xoshiro256Plus::seed_from_u64(1337);
                state
                    .update(StateUpdateConfig::with_iters(5), &mut rng)
                    .unwrap();
                state.logpdf_score()
            };
            assert_eq!(run(), run());
        }
    }
}
