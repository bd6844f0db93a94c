#![warn(
    clippy::all,
    clippy::imprecise_flops,
    clippy::suboptimal_flops,
    clippy::unseparated_literal_suffix,
    clippy::unreadable_literal,
    clippy::option_option,
    clippy::implicit_clone
)]
//! Composable generative population models built around CrossCat.
//!
//! A [`state::State`] is a Dirichlet process mixture over columns whose
//! components are [`view::View`]s, each a Dirichlet process mixture over
//! rows. Anything implementing [`gpm::Gpm`], whether a view, a whole
//! state, or a caller-supplied component, can be composed into a
//! dependency [`network::Network`] and queried jointly.

pub mod config;
pub mod crp;
pub mod dim;
pub mod dist;
pub mod error;
pub mod gpm;
pub mod metadata;
pub mod misc;
pub mod network;
pub mod sampling;
pub mod state;
pub mod transition;
pub mod view;

pub use config::StateUpdateConfig;
pub use gpm::{Gpm, Values};
pub use state::{State, StateBuilder};
pub use view::View;

/// A view's row-cluster assignment is queryable under the variable id
/// `LATENT_VAR_BASE + view_id`. Data columns must stay below this base.
pub const LATENT_VAR_BASE: usize = 10_000_000;
