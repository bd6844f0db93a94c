//! The generic capability contract for composable population models.
//!
//! Everything that can be wired into a dependency network speaks this
//! interface: views, whole states, and caller-supplied foreign components.
//! Variables are identified by `usize` ids; a record of values is a sorted
//! map from variable id to `f64`, with `f64::NAN` as the missing sentinel.
use std::collections::BTreeMap;

use rand::RngCore;

use crate::error::{QueryError, StateError};
use crate::metadata::{GpmMetadata, MetadataError};

/// A partial record: variable id → value
pub type Values = BTreeMap<usize, f64>;

/// A composable generative population model.
///
/// Row ids index a shared population. A rowid at or above the number of
/// incorporated rows denotes a hypothetical member. `logpdf` and `simulate`
/// condition on the model's full dataset plus the given evidence; query and
/// evidence variables must be disjoint.
pub trait Gpm {
    /// Variables this model generates
    fn outputs(&self) -> Vec<usize>;

    /// Variables this model requires as exogenous input
    fn inputs(&self) -> Vec<usize> {
        Vec::new()
    }

    /// Number of incorporated rows
    fn n_rows(&self) -> usize;

    /// Record observed values for a row. `inputs` carries exogenous input
    /// values for components that condition on them; models without inputs
    /// ignore it.
    fn incorporate(
        &mut self,
        rowid: usize,
        query: &Values,
        inputs: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<(), StateError>;

    /// Forget a previously incorporated row
    fn unincorporate(&mut self, rowid: usize) -> Result<(), StateError>;

    /// Log density of `query` given `evidence` and the dataset
    fn logpdf(
        &self,
        rowid: usize,
        query: &Values,
        evidence: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<f64, QueryError>;

    /// Draw `n` joint records of the `targets` given `evidence`
    fn simulate(
        &self,
        rowid: usize,
        targets: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Values>, QueryError>;

    /// Log marginal likelihood of all incorporated data
    fn logpdf_score(&self) -> f64;

    /// Run one sweep of the model's own inference kernels
    fn transition(&mut self, rng: &mut dyn RngCore);

    /// Serialize to a factory-tagged record
    fn to_metadata(&self) -> Result<GpmMetadata, MetadataError>;
}
