//! Collapsed Beta-Bernoulli component model.
//!
//! Sufficient statistics are integer counts, so incorporate/unincorporate
//! round-trips are exact.
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{count_grid, ColumnModel, HyperGrids, Hypers};
use crate::misc::ln_beta;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Bernoulli {
    /// Number of incorporated values
    n: u32,
    /// Number of incorporated ones
    k: u32,
    alpha: f64,
    beta: f64,
}

/// The support is exactly {0, 1}.
fn as_success(x: f64) -> Option<bool> {
    if x == 0.0 {
        Some(false)
    } else if x == 1.0 {
        Some(true)
    } else {
        None
    }
}

impl Bernoulli {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Bernoulli {
            n: 0,
            k: 0,
            alpha,
            beta,
        }
    }

    pub fn from_hypers(hypers: &Hypers) -> Self {
        Bernoulli::new(
            hypers.get("alpha").copied().unwrap_or(1.0),
            hypers.get("beta").copied().unwrap_or(1.0),
        )
    }

    pub fn default_hypers() -> Hypers {
        let mut hypers = Hypers::new();
        hypers.insert("alpha".into(), 1.0);
        hypers.insert("beta".into(), 1.0);
        hypers
    }

    pub fn hyper_grids(xs: &[f64], n_grid: usize) -> HyperGrids {
        let grid = count_grid(xs.len(), n_grid);
        let mut grids = HyperGrids::new();
        grids.insert("alpha".into(), grid.clone());
        grids.insert("beta".into(), grid);
        grids
    }

    /// (number of members, number of successes)
    pub fn suffstats(&self) -> (u32, u32) {
        (self.n, self.k)
    }
}

impl ColumnModel for Bernoulli {
    fn incorporate(&mut self, x: f64) {
        debug_assert!(as_success(x).is_some());
        self.n += 1;
        if x == 1.0 {
            self.k += 1;
        }
    }

    fn unincorporate(&mut self, x: f64) {
        debug_assert!(self.n > 0);
        self.n -= 1;
        if x == 1.0 {
            debug_assert!(self.k > 0);
            self.k -= 1;
        }
    }

    fn predictive_logp(&self, x: f64) -> f64 {
        let success = match as_success(x) {
            Some(s) => s,
            None => return f64::NEG_INFINITY,
        };
        let denom = (f64::from(self.n) + self.alpha + self.beta).ln();
        if success {
            (f64::from(self.k) + self.alpha).ln() - denom
        } else {
            (f64::from(self.n - self.k) + self.beta).ln() - denom
        }
    }

    fn marginal_logp(&self) -> f64 {
        ln_beta(
            f64::from(self.k) + self.alpha,
            f64::from(self.n - self.k) + self.beta,
        ) - ln_beta(self.alpha, self.beta)
    }

    fn simulate(&self, rng: &mut impl Rng) -> f64 {
        let p = (f64::from(self.k) + self.alpha)
            / (f64::from(self.n) + self.alpha + self.beta);
        if rng.gen::<f64>() < p {
            1.0
        } else {
            0.0
        }
    }

    fn n(&self) -> usize {
        self.n as usize
    }

    fn hypers(&self) -> Hypers {
        let mut hypers = Hypers::new();
        hypers.insert("alpha".into(), self.alpha);
        hypers.insert("beta".into(), self.beta);
        hypers
    }

    fn set_hypers(&mut self, hypers: &Hypers) {
        if let Some(&alpha) = hypers.get("alpha") {
            self.alpha = alpha;
        }
        if let Some(&beta) = hypers.get("beta") {
            self.beta = beta;
        }
    }

    fn is_collapsed(&self) -> bool {
        true
    }
}
