//! Hooking foreign components into a state and querying across the seam.
use approx::assert_relative_eq;
use cgpm::dist::ColType;
use cgpm::error::{NetworkError, StateError};
use cgpm::gpm::{Gpm, Values};
use cgpm::metadata::{FactoryRegistry, GpmMetadata, MetadataError};
use cgpm::{State, StateBuilder};
use maplit::btreemap;
use rand::{Rng, RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// A unit-variance Gaussian copy of its input variable.
#[derive(Clone)]
struct NoisyCopy {
    out: usize,
    input: usize,
}

impl NoisyCopy {
    const FACTORY: &'static str = "tests::NoisyCopy";
}

impl Gpm for NoisyCopy {
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
    ) -> Result<(), StateError> {
        Ok(())
    }
    fn unincorporate(&mut self, _rowid: usize) -> Result<(), StateError> {
        Ok(())
    }
    fn logpdf(
        &self,
        _rowid: usize,
        query: &Values,
        evidence: &Values,
        _rng: &mut dyn RngCore,
    ) -> Result<f64, cgpm::error::QueryError> {
        let x = *evidence.get(&self.input).ok_or(
            cgpm::error::QueryError::MissingInputs(vec![self.input]),
        )?;
        let z = query[&self.out] - x;
        Ok(-0.5 * z * z - 0.5 * LN_2PI)
    }
    fn simulate(
        &self,
        _rowid: usize,
        _targets: &[usize],
        evidence: &Values,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Values>, cgpm::error::QueryError> {
        let x = *evidence.get(&self.input).ok_or(
            cgpm::error::QueryError::MissingInputs(vec![self.input]),
        )?;
        Ok((0..n)
            .map(|_| {
                let eps: f64 = rng.sample(rand_distr::StandardNormal);
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
            factory: Self::FACTORY.into(),
            payload: serde_json::json!({
                "out": self.out,
                "input": self.input,
            }),
        })
    }
}

fn registry() -> FactoryRegistry {
    let mut registry = FactoryRegistry::new();
    registry.register(NoisyCopy::FACTORY, |payload| {
        let get = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .ok_or_else(|| MetadataError::InvalidPayload {
                    factory: NoisyCopy::FACTORY.into(),
                    reason: format!("missing field {key:?}"),
                })
        };
        Ok(Box::new(NoisyCopy {
            out: get("out")?,
            input: get("input")?,
        }) as Box<dyn Gpm>)
    });
    registry
}

fn base_state(rng: &mut Xoshiro256Plus) -> State {
    StateBuilder::new(
        btreemap! {
            0 => vec![0.1, -0.4, 1.3, 0.7],
            1 => vec![1.0, 0.0, 1.0, 0.0],
        },
        btreemap! {0 => ColType::Gaussian, 1 => ColType::Bernoulli},
    )
    .column_partition(btreemap! {0 => 0, 1 => 0})
    .row_partition(0, vec![0, 0, 1, 1])
    .build(rng)
    .unwrap()
}

#[test]
fn tokens_are_issued_in_sequence() {
    let mut rng = Xoshiro256Plus::seed_from_u64(11);
    let mut state = base_state(&mut rng);
    assert!(!state.is_composite());

    let first = state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();
    let second = state
        .compose_gpm(Box::new(NoisyCopy { out: 51, input: 50 }))
        .unwrap();
    assert_eq!(first, 57481);
    assert_eq!(second, 57482);
    assert!(state.is_composite());
}

#[test]
fn colliding_outputs_are_rejected_and_leave_no_trace() {
    let mut rng = Xoshiro256Plus::seed_from_u64(12);
    let mut state = base_state(&mut rng);
    let err = state
        .compose_gpm(Box::new(NoisyCopy { out: 1, input: 0 }))
        .unwrap_err();
    assert_eq!(
        err,
        StateError::Network(NetworkError::DuplicateOutput(1))
    );
    assert!(!state.is_composite());
    // the failed hook did not burn a token
    let token = state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();
    assert_eq!(token, 57481);
}

#[test]
fn pinned_inputs_make_the_network_density_exact() {
    let mut rng = Xoshiro256Plus::seed_from_u64(13);
    let mut state = base_state(&mut rng);
    state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();

    let rowid = state.n_rows();
    let lp = state
        .logpdf(
            rowid,
            &btreemap! {50 => 1.5},
            &btreemap! {0 => 1.0},
            None,
            &mut rng,
        )
        .unwrap();
    assert_relative_eq!(lp, -0.5 * 0.25 - 0.5 * LN_2PI, epsilon = 1e-12);
}

#[test]
fn simulation_flows_through_the_seam() {
    let mut rng = Xoshiro256Plus::seed_from_u64(14);
    let mut state = base_state(&mut rng);
    state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();

    let rowid = state.n_rows();
    let draws = state
        .simulate(
            rowid,
            &[50],
            &btreemap! {0 => 10.0},
            200,
            None,
            &mut rng,
        )
        .unwrap();
    assert_eq!(draws.len(), 200);
    let mean: f64 =
        draws.iter().map(|draw| draw[&50]).sum::<f64>() / 200.0;
    assert!((mean - 10.0).abs() < 0.5);
}

#[test]
fn decompose_returns_the_component_and_the_closed_form() {
    let mut rng = Xoshiro256Plus::seed_from_u64(15);
    let mut state = base_state(&mut rng);
    let token = state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();

    let component = state.decompose_gpm(token).unwrap();
    assert_eq!(component.outputs(), vec![50]);
    assert!(!state.is_composite());
    assert!(matches!(
        state.decompose_gpm(token),
        Err(StateError::UnknownToken(57481))
    ));
}

#[test]
fn hooked_components_revive_through_the_registry() {
    let mut rng = Xoshiro256Plus::seed_from_u64(16);
    let mut state = base_state(&mut rng);
    state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();

    let metadata = state.to_metadata().unwrap();
    let text = serde_json::to_string(&metadata).unwrap();
    let back = serde_json::from_str(&text).unwrap();

    // without the factory the record is unusable
    assert!(matches!(
        State::from_metadata(
            serde_json::from_str(&text).unwrap(),
            &FactoryRegistry::new()
        ),
        Err(MetadataError::UnknownFactory(_))
    ));

    let revived = State::from_metadata(back, &registry()).unwrap();
    assert!(revived.is_composite());
    let rowid = revived.n_rows();
    let lp = revived
        .logpdf(
            rowid,
            &btreemap! {50 => 0.0},
            &btreemap! {0 => 0.0},
            None,
            &mut rng,
        )
        .unwrap();
    assert_relative_eq!(lp, -0.5 * LN_2PI, epsilon = 1e-12);
}

#[test]
fn foreign_kernel_is_scheduled() {
    let mut rng = Xoshiro256Plus::seed_from_u64(17);
    let mut state = base_state(&mut rng);
    state
        .compose_gpm(Box::new(NoisyCopy { out: 50, input: 0 }))
        .unwrap();

    let config = cgpm::StateUpdateConfig {
        transitions: vec![cgpm::transition::StateTransition::Foreign],
        ..cgpm::StateUpdateConfig::with_iters(2)
    };
    state.update(config, &mut rng).unwrap();
    assert_eq!(state.diagnostics().iterations["foreign"], 2);
}
