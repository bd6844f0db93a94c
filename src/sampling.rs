//! Closed-form queries against a non-composite state.
//!
//! When no foreign components are hooked and no column is conditional, the
//! views are mutually independent given the column partition, so a joint
//! query factorizes exactly: route each variable to its view, answer
//! per-view, and combine. No importance sampling is involved.
use std::collections::BTreeMap;

use itertools::Itertools;
use rand::Rng;

use crate::error::QueryError;
use crate::gpm::Values;
use crate::state::State;

/// Group variables by the view that generates them.
fn group_by_view(
    state: &State,
    vars: impl IntoIterator<Item = usize>,
) -> Result<BTreeMap<usize, Vec<usize>>, QueryError> {
    let routed: Vec<(usize, usize)> = vars
        .into_iter()
        .map(|var| state.view_for_var(var).map(|view| (view, var)))
        .collect::<Result<_, _>>()?;
    Ok(routed
        .into_iter()
        .into_group_map()
        .into_iter()
        .collect())
}

/// Exact log density of `query` given `evidence`, factorized over views.
///
/// Evidence for views that hold no query variable is irrelevant by
/// independence and is dropped.
pub fn state_logpdf(
    state: &State,
    rowid: usize,
    query: &Values,
    evidence: &Values,
) -> Result<f64, QueryError> {
    let query_views = group_by_view(state, query.keys().copied())?;
    let evidence_views = group_by_view(state, evidence.keys().copied())?;

    let mut logp = 0.0;
    for (view_id, vars) in &query_views {
        let view = &state.views()[view_id];
        let view_query: Values =
            vars.iter().map(|var| (*var, query[var])).collect();
        let view_evidence: Values = evidence_views
            .get(view_id)
            .map(|vars| vars.iter().map(|var| (*var, evidence[var])).collect())
            .unwrap_or_default();
        logp += view.logpdf(rowid, &view_query, &view_evidence)?;
    }
    Ok(logp)
}

/// Exact joint samples of `targets` given `evidence`, factorized over views.
///
/// Each view draws its share of the targets independently; the i-th records
/// from every view are merged into the i-th joint sample.
pub fn state_simulate<R: Rng>(
    state: &State,
    rowid: usize,
    targets: &[usize],
    evidence: &Values,
    n: usize,
    rng: &mut R,
) -> Result<Vec<Values>, QueryError> {
    for (ix, var) in targets.iter().enumerate() {
        if targets[..ix].contains(var) {
            return Err(QueryError::DuplicateTarget(*var));
        }
    }
    let target_views = group_by_view(state, targets.iter().copied())?;
    let evidence_views = group_by_view(state, evidence.keys().copied())?;

    let mut samples: Vec<Values> = vec![Values::new(); n];
    for (view_id, vars) in &target_views {
        let view = &state.views()[view_id];
        let view_evidence: Values = evidence_views
            .get(view_id)
            .map(|vars| vars.iter().map(|var| (*var, evidence[var])).collect())
            .unwrap_or_default();
        let draws = view.simulate(rowid, vars, &view_evidence, n, rng)?;
        for (sample, draw) in samples.iter_mut().zip(draws) {
            sample.extend(draw);
        }
    }
    Ok(samples)
}
