//! Factory-tagged serialization records.
//!
//! Foreign components serialize to a `(factory, payload)` pair; a
//! caller-supplied registry maps factory names back to constructors when a
//! state is revived. The registry is explicit; there is no global lookup
//! table.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crp::Crp;
use crate::gpm::Gpm;
use crate::state::StateDiagnostics;
use crate::view::View;

/// Factory tag recorded in state metadata
pub const STATE_FACTORY: &str = "cgpm::state::State";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("no factory registered for {0:?}")]
    UnknownFactory(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("invalid payload for factory {factory:?}: {reason}")]
    InvalidPayload { factory: String, reason: String },
}

/// A serialized component tagged with the factory that can revive it
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GpmMetadata {
    pub factory: String,
    pub payload: serde_json::Value,
}

type BuildFn = Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Gpm>, MetadataError>>;

/// Maps factory names to constructors for foreign components.
#[derive(Default)]
pub struct FactoryRegistry {
    builders: BTreeMap<String, BuildFn>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, factory: impl Into<String>, build: F)
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Gpm>, MetadataError>
            + 'static,
    {
        self.builders.insert(factory.into(), Box::new(build));
    }

    pub fn build(
        &self,
        metadata: &GpmMetadata,
    ) -> Result<Box<dyn Gpm>, MetadataError> {
        let build = self
            .builders
            .get(&metadata.factory)
            .ok_or_else(|| {
                MetadataError::UnknownFactory(metadata.factory.clone())
            })?;
        build(&metadata.payload)
    }
}

/// The full serialization record of a `State`.
///
/// Missing cells are encoded as `None` so the record survives JSON, which
/// has no NaN. Views serialize whole (partition, concentration, column
/// types, hyperparameters, sufficient statistics), making the round trip
/// lossless.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StateMetadata {
    pub factory: String,
    /// column id → cell values in row order
    pub x: BTreeMap<usize, Vec<Option<f64>>>,
    /// column order
    pub outputs: Vec<usize>,
    /// column partition
    pub column_crp: Crp,
    /// view id → view
    pub views: Vec<(usize, View)>,
    /// column pairs constrained to be independent
    pub independence: Vec<(usize, usize)>,
    pub diagnostics: StateDiagnostics,
    /// token → serialized foreign component
    pub hooked: Vec<(usize, GpmMetadata)>,
    pub next_token: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_factory_is_an_error() {
        let registry = FactoryRegistry::new();
        let metadata = GpmMetadata {
            factory: "nope".into(),
            payload: serde_json::Value::Null,
        };
        assert!(matches!(
            registry.build(&metadata),
            Err(MetadataError::UnknownFactory(_))
        ));
    }

    #[test]
    fn gpm_metadata_round_trips_through_json() {
        let metadata = GpmMetadata {
            factory: "cgpm::view::View".into(),
            payload: serde_json::json!({"latent": 17}),
        };
        let text = serde_json::to_string(&metadata).unwrap();
        let back: GpmMetadata = serde_json::from_str(&text).unwrap();
        assert_eq!(back, metadata);
    }
}
