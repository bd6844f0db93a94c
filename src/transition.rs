//! The named inference kernels a `State` can run.
use serde::{Deserialize, Serialize};

/// The default kernel schedule for `State::update`
pub const DEFAULT_STATE_TRANSITIONS: [StateTransition; 5] = [
    StateTransition::ColumnAssignment,
    StateTransition::ColumnAlpha,
    StateTransition::RowAssignment,
    StateTransition::ViewAlphas,
    StateTransition::ColumnHypers,
];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateTransition {
    /// Reassign columns to views
    #[serde(rename = "column_assignment")]
    ColumnAssignment,
    /// Reassign rows to clusters within each view
    #[serde(rename = "row_assignment")]
    RowAssignment,
    /// Update the column-partition CRP concentration
    #[serde(rename = "column_alpha")]
    ColumnAlpha,
    /// Update each view's row-partition CRP concentration
    #[serde(rename = "view_alphas")]
    ViewAlphas,
    /// Update column hyperparameters
    #[serde(rename = "column_hypers")]
    ColumnHypers,
    /// Run the hooked foreign components' own kernels
    #[serde(rename = "foreign")]
    Foreign,
}

impl StateTransition {
    pub fn name(&self) -> &'static str {
        match self {
            StateTransition::ColumnAssignment => "column_assignment",
            StateTransition::RowAssignment => "row_assignment",
            StateTransition::ColumnAlpha => "column_alpha",
            StateTransition::ViewAlphas => "view_alphas",
            StateTransition::ColumnHypers => "column_hypers",
            StateTransition::Foreign => "foreign",
        }
    }
}
