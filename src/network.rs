//! An importance-sampling network over composed components.
//!
//! When a state hosts foreign components or conditional columns, queries no
//! longer have a closed form. The network wires every component's inputs to
//! the outputs that produce them, walks the components in topological
//! order, and estimates densities with self-normalized importance sampling:
//! pinned outputs are scored exactly, unpinned ancestors are simulated only
//! where a downstream input needs them.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use rand::RngCore;
use rv::misc::ln_pflip;

use crate::error::{NetworkError, QueryError};
use crate::gpm::{Gpm, Values};
use crate::misc::logmeanexp;

pub struct Network<'a> {
    components: Vec<&'a dyn Gpm>,
    /// Number of importance samples per density estimate
    accuracy: usize,
    /// Component indices in dependency order
    topo: Vec<usize>,
    outputs: Vec<BTreeSet<usize>>,
    inputs: Vec<BTreeSet<usize>>,
    /// variable → index of the component producing it
    producers: BTreeMap<usize, usize>,
}

// components are borrowed trait objects, so this cannot be derived
impl fmt::Debug for Network<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("accuracy", &self.accuracy)
            .field("topo", &self.topo)
            .field("outputs", &self.outputs)
            .field("inputs", &self.inputs)
            .field("producers", &self.producers)
            .finish()
    }
}

impl<'a> Network<'a> {
    pub fn new(
        components: Vec<&'a dyn Gpm>,
        accuracy: usize,
    ) -> Result<Self, NetworkError> {
        let outputs: Vec<BTreeSet<usize>> = components
            .iter()
            .map(|c| c.outputs().into_iter().collect())
            .collect();
        let inputs: Vec<BTreeSet<usize>> = components
            .iter()
            .map(|c| c.inputs().into_iter().collect())
            .collect();

        let mut producers: BTreeMap<usize, usize> = BTreeMap::new();
        for (ix, outs) in outputs.iter().enumerate() {
            for &var in outs {
                if producers.insert(var, ix).is_some() {
                    return Err(NetworkError::DuplicateOutput(var));
                }
            }
        }

        let topo = toposort(&outputs, &inputs, &producers)?;
        Ok(Network {
            components,
            accuracy: accuracy.max(1),
            topo,
            outputs,
            inputs,
            producers,
        })
    }

    /// Log density of `query` given `evidence`, estimated as the ratio of
    /// the mean importance weights of the joint and the evidence alone.
    pub fn logpdf(
        &self,
        rowid: usize,
        query: &Values,
        evidence: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<f64, QueryError> {
        let overlap: Vec<usize> = query
            .keys()
            .filter(|var| evidence.contains_key(var))
            .copied()
            .collect();
        if !overlap.is_empty() {
            return Err(QueryError::QueryEvidenceOverlap(overlap));
        }
        let mut joint = evidence.clone();
        joint.extend(query.iter().map(|(&var, &value)| (var, value)));

        let lp_joint = self.weight_estimate(rowid, &joint, rng)?;
        if evidence.is_empty() {
            Ok(lp_joint)
        } else {
            let lp_evidence = self.weight_estimate(rowid, evidence, rng)?;
            Ok(lp_joint - lp_evidence)
        }
    }

    fn weight_estimate(
        &self,
        rowid: usize,
        constraints: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<f64, QueryError> {
        let weights: Vec<f64> = (0..self.accuracy)
            .map(|_| {
                self.weighted_sample(rowid, &[], constraints, rng)
                    .map(|(_, w)| w)
            })
            .collect::<Result<_, _>>()?;
        Ok(logmeanexp(&weights))
    }

    /// Draw `n` records of `targets` by importance resampling of forward
    /// passes.
    pub fn simulate(
        &self,
        rowid: usize,
        targets: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Values>, QueryError> {
        let mut seen = BTreeSet::new();
        for &var in targets {
            if !seen.insert(var) {
                return Err(QueryError::DuplicateTarget(var));
            }
            if evidence.contains_key(&var) {
                return Err(QueryError::QueryEvidenceOverlap(vec![var]));
            }
        }
        let n_passes = self.accuracy * n.max(1);
        let mut samples = Vec::with_capacity(n_passes);
        let mut weights = Vec::with_capacity(n_passes);
        for _ in 0..n_passes {
            let (sample, weight) =
                self.weighted_sample(rowid, targets, evidence, rng)?;
            samples.push(sample);
            weights.push(weight);
        }
        let picks = ln_pflip(&weights, n, false, &mut &mut *rng);
        Ok(picks
            .into_iter()
            .map(|ix| {
                targets
                    .iter()
                    .filter_map(|var| {
                        samples[ix].get(var).map(|&value| (*var, value))
                    })
                    .collect()
            })
            .collect())
    }

    /// One forward pass: walk relevant components in topological order,
    /// score constrained outputs, simulate targets and whatever downstream
    /// inputs require. Returns the accumulated record and its log weight.
    fn weighted_sample(
        &self,
        rowid: usize,
        targets: &[usize],
        constraints: &Values,
        rng: &mut dyn RngCore,
    ) -> Result<(Values, f64), QueryError> {
        let relevant = self.relevant_components(
            targets.iter().chain(constraints.keys()).copied(),
        );
        let mut needed: BTreeSet<usize> = targets.iter().copied().collect();
        for &ix in &relevant {
            needed.extend(self.inputs[ix].iter().copied());
        }

        let mut sample = constraints.clone();
        let mut weight = 0.0;
        for &ix in &self.topo {
            if !relevant.contains(&ix) {
                continue;
            }
            let component = self.components[ix];
            let mut input_values = Values::new();
            let mut missing = Vec::new();
            for &var in &self.inputs[ix] {
                match sample.get(&var) {
                    Some(&value) => {
                        input_values.insert(var, value);
                    }
                    None => missing.push(var),
                }
            }
            if !missing.is_empty() {
                return Err(QueryError::MissingInputs(missing));
            }

            let constrained: Values = self.outputs[ix]
                .iter()
                .filter_map(|var| {
                    constraints.get(var).map(|&value| (*var, value))
                })
                .collect();
            let wanted: Vec<usize> = self.outputs[ix]
                .iter()
                .filter(|var| {
                    needed.contains(var) && !constrained.contains_key(var)
                })
                .copied()
                .collect();

            if !constrained.is_empty() {
                weight += component.logpdf(
                    rowid,
                    &constrained,
                    &input_values,
                    rng,
                )?;
            }
            if !wanted.is_empty() {
                let mut given = input_values;
                given.extend(
                    constrained.iter().map(|(&var, &value)| (var, value)),
                );
                let record = component
                    .simulate(rowid, &wanted, &given, 1, rng)?
                    .pop()
                    .unwrap_or_default();
                sample.extend(record);
            }
        }
        Ok((sample, weight))
    }

    /// Components owning any of `vars`, closed over ancestry.
    fn relevant_components(
        &self,
        vars: impl Iterator<Item = usize>,
    ) -> BTreeSet<usize> {
        let mut stack: Vec<usize> = vars
            .filter_map(|var| self.producers.get(&var).copied())
            .collect();
        let mut relevant = BTreeSet::new();
        while let Some(ix) = stack.pop() {
            if !relevant.insert(ix) {
                continue;
            }
            for var in &self.inputs[ix] {
                if let Some(&parent) = self.producers.get(var) {
                    stack.push(parent);
                }
            }
        }
        relevant
    }
}

/// Kahn's algorithm; a leftover node means a cycle.
fn toposort(
    outputs: &[BTreeSet<usize>],
    inputs: &[BTreeSet<usize>],
    producers: &BTreeMap<usize, usize>,
) -> Result<Vec<usize>, NetworkError> {
    let n = outputs.len();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree: Vec<usize> = vec![0; n];
    for (ix, ins) in inputs.iter().enumerate() {
        let mut parents = BTreeSet::new();
        for var in ins {
            if let Some(&parent) = producers.get(var) {
                if parent != ix {
                    parents.insert(parent);
                }
            }
        }
        in_degree[ix] = parents.len();
        for parent in parents {
            children[parent].push(ix);
        }
    }
    let mut ready: Vec<usize> =
        (0..n).filter(|&ix| in_degree[ix] == 0).collect();
    let mut topo = Vec::with_capacity(n);
    while let Some(ix) = ready.pop() {
        topo.push(ix);
        for &child in &children[ix] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.push(child);
            }
        }
    }
    if topo.len() == n {
        Ok(topo)
    } else {
        Err(NetworkError::Cycle)
    }
}

/// All variables upstream of `var`: the producer's inputs, their producers'
/// outputs, and so on. Exogenous inputs with no producer are included.
pub fn ancestor_vars(
    components: &[&dyn Gpm],
    var: usize,
) -> BTreeSet<usize> {
    let producers = variable_owners(components);
    let mut ancestors = BTreeSet::new();
    let mut stack: Vec<usize> = match producers.get(&var) {
        Some(&ix) => components[ix].inputs(),
        None => return ancestors,
    };
    while let Some(v) = stack.pop() {
        if !ancestors.insert(v) {
            continue;
        }
        if let Some(&ix) = producers.get(&v) {
            stack.extend(components[ix].inputs());
        }
    }
    ancestors
}

/// variable → index of the component that outputs it
pub fn variable_owners(components: &[&dyn Gpm]) -> BTreeMap<usize, usize> {
    let mut owners = BTreeMap::new();
    for (ix, component) in components.iter().enumerate() {
        for var in component.outputs() {
            owners.insert(var, ix);
        }
    }
    owners
}

/// Partition components into weakly connected blocks: two components share
/// a block when any variable appears in both signatures.
pub fn connected_blocks(components: &[&dyn Gpm]) -> Vec<usize> {
    let n = components.len();
    let signatures: Vec<BTreeSet<usize>> = components
        .iter()
        .map(|c| {
            c.outputs().into_iter().chain(c.inputs()).collect()
        })
        .collect();
    let mut block: Vec<Option<usize>> = vec![None; n];
    let mut next_block = 0;
    for start in 0..n {
        if block[start].is_some() {
            continue;
        }
        let mut stack = vec![start];
        while let Some(ix) = stack.pop() {
            if block[ix].is_some() {
                continue;
            }
            block[ix] = Some(next_block);
            for other in 0..n {
                if block[other].is_none()
                    && !signatures[ix].is_disjoint(&signatures[other])
                {
                    stack.push(other);
                }
            }
        }
        next_block += 1;
    }
    block.into_iter().map(|b| b.unwrap_or(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{GpmMetadata, MetadataError};
    use approx::assert_relative_eq;
    use maplit::btreemap;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256Plus;

    /// A linear-Gaussian node: out = in + noise(0, 1).
    struct Shift {
        out: usize,
        input: usize,
    }

    impl Gpm for Shift {
        fn outputs(&self) -> Vec<usize> {
            vec![self.out]
        }
        fn inputs(&self) -> Vec<usize> {
            vec![self.input]
        }
        fn n_rows(&self) -> usize {
            0
        }
        fn incorporate(
            &mut self,
            _rowid: usize,
            _query: &Values,
            _inputs: &Values,
            _rng: &mut dyn RngCore,
        ) -> Result<(), crate::error::StateError> {
            Ok(())
        }
        fn unincorporate(
            &mut self,
            _rowid: usize,
        ) -> Result<(), crate::error::StateError> {
            Ok(())
        }
        fn logpdf(
            &self,
            _rowid: usize,
            query: &Values,
            evidence: &Values,
            _rng: &mut dyn RngCore,
        ) -> Result<f64, QueryError> {
            let x = *evidence
                .get(&self.input)
                .ok_or(QueryError::MissingInputs(vec![self.input]))?;
            let y = query[&self.out];
            let z = y - x;
            Ok(-0.5 * z * z - 0.5 * (2.0 * std::f64::consts::PI).ln())
        }
        fn simulate(
            &self,
            _rowid: usize,
            _targets: &[usize],
            evidence: &Values,
            n: usize,
            rng: &mut dyn RngCore,
        ) -> Result<Vec<Values>, QueryError> {
            let x = *evidence
                .get(&self.input)
                .ok_or(QueryError::MissingInputs(vec![self.input]))?;
            Ok((0..n)
                .map(|_| {
                    let eps: f64 =
                        rng.sample(rand_distr::StandardNormal);
                    btreemap! {self.out => x + eps}
                })
                .collect())
        }
        fn logpdf_score(&self) -> f64 {
            0.0
        }
        fn transition(&mut self, _rng: &mut dyn RngCore) {}
        fn to_metadata(&self) -> Result<GpmMetadata, MetadataError> {
            Ok(GpmMetadata {
                factory: "test::Shift".into(),
                payload: serde_json::json!({
                    "out": self.out, "input": self.input
                }),
            })
        }
    }

    #[test]
    fn duplicate_outputs_are_rejected() {
        let a = Shift { out: 5, input: 0 };
        let b = Shift { out: 5, input: 1 };
        let err = Network::new(vec![&a, &b], 1).unwrap_err();
        assert_eq!(err, NetworkError::DuplicateOutput(5));
    }

    #[test]
    fn cycles_are_rejected() {
        let a = Shift { out: 1, input: 2 };
        let b = Shift { out: 2, input: 1 };
        let err = Network::new(vec![&a, &b], 1).unwrap_err();
        assert_eq!(err, NetworkError::Cycle);
    }

    #[test]
    fn chain_logpdf_scores_each_hop() {
        let mut rng = Xoshiro256Plus::seed_from_u64(11);
        let a = Shift { out: 1, input: 0 };
        let b = Shift { out: 2, input: 1 };
        let network = Network::new(vec![&a, &b], 1).unwrap();
        // with both hops pinned the weight is exact
        let lp = network
            .logpdf(
                0,
                &btreemap! {2 => 1.0},
                &btreemap! {0 => 0.0, 1 => 1.0},
                &mut rng,
            )
            .unwrap();
        let expected =
            -0.5 * (2.0 * std::f64::consts::PI).ln();
        assert_relative_eq!(lp, expected, epsilon = 1E-8);
    }

    #[test]
    fn missing_exogenous_input_is_an_error() {
        let mut rng = Xoshiro256Plus::seed_from_u64(11);
        let a = Shift { out: 1, input: 0 };
        let network = Network::new(vec![&a], 1).unwrap();
        let err = network
            .logpdf(0, &btreemap! {1 => 0.0}, &Values::new(), &mut rng)
            .unwrap_err();
        assert_eq!(err, QueryError::MissingInputs(vec![0]));
    }

    #[test]
    fn simulate_walks_the_chain() {
        let mut rng = Xoshiro256Plus::seed_from_u64(23);
        let a = Shift { out: 1, input: 0 };
        let b = Shift { out: 2, input: 1 };
        let network = Network::new(vec![&a, &b], 4).unwrap();
        let records = network
            .simulate(0, &[2], &btreemap! {0 => 100.0}, 50, &mut rng)
            .unwrap();
        assert_eq!(records.len(), 50);
        let mean: f64 =
            records.iter().map(|r| r[&2]).sum::<f64>() / 50.0;
        // two unit-variance hops from 100
        assert!((mean - 100.0).abs() < 1.0);
    }

    #[test]
    fn ancestors_cross_components() {
        let a = Shift { out: 1, input: 0 };
        let b = Shift { out: 2, input: 1 };
        let comps: Vec<&dyn Gpm> = vec![&a, &b];
        let ancestors = ancestor_vars(&comps, 2);
        assert!(ancestors.contains(&1));
        assert!(ancestors.contains(&0));
        assert!(!ancestors.contains(&2));
    }

    #[test]
    fn connected_blocks_split_independent_chains() {
        let a = Shift { out: 1, input: 0 };
        let b = Shift { out: 2, input: 1 };
        let c = Shift { out: 11, input: 10 };
        let comps: Vec<&dyn Gpm> = vec![&a, &b, &c];
        let blocks = connected_blocks(&comps);
        assert_eq!(blocks[0], blocks[1]);
        assert_ne!(blocks[0], blocks[2]);
    }
}
