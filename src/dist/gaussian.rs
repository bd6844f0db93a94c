//! Collapsed Normal-Gamma Gaussian component model.
use rand::Rng;
use rand_distr::StudentT;
use serde::{Deserialize, Serialize};

use super::{count_grid, ColumnModel, HyperGrids, Hypers};
use crate::misc::{linspace, ln_gamma, log_linspace};

const LOG2: f64 = std::f64::consts::LN_2;
const LOGPI: f64 = 1.144_729_885_849_400_2;
const LOG2PI: f64 = LOG2 + LOGPI;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Gaussian {
    n: u32,
    sum_x: f64,
    sum_x_sq: f64,
    /// Prior mean
    m: f64,
    /// Relative precision of the mean
    r: f64,
    /// Scale of the precision prior
    s: f64,
    /// Degrees of freedom of the precision prior
    nu: f64,
}

impl Gaussian {
    pub fn new(m: f64, r: f64, s: f64, nu: f64) -> Self {
        Gaussian {
            n: 0,
            sum_x: 0.0,
            sum_x_sq: 0.0,
            m,
            r,
            s,
            nu,
        }
    }

    pub fn from_hypers(hypers: &Hypers) -> Self {
        Gaussian::new(
            hypers.get("m").copied().unwrap_or(0.0),
            hypers.get("r").copied().unwrap_or(1.0),
            hypers.get("s").copied().unwrap_or(1.0),
            hypers.get("nu").copied().unwrap_or(1.0),
        )
    }

    pub fn default_hypers() -> Hypers {
        let mut hypers = Hypers::new();
        hypers.insert("m".into(), 0.0);
        hypers.insert("r".into(), 1.0);
        hypers.insert("s".into(), 1.0);
        hypers.insert("nu".into(), 1.0);
        hypers
    }

    pub fn hyper_grids(xs: &[f64], n_grid: usize) -> HyperGrids {
        let n = xs.len();
        let (xmin, xmax) = xs.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY),
            |(lo, hi), &x| (lo.min(x), hi.max(x)),
        );
        let (m_lo, m_hi) = if n == 0 || xmin == xmax {
            (xmin.min(0.0) - 1.0, xmax.max(0.0) + 1.0)
        } else {
            (xmin, xmax)
        };
        let mean = if n == 0 {
            0.0
        } else {
            xs.iter().sum::<f64>() / n as f64
        };
        let ssqdev = xs
            .iter()
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>()
            .max(1.0);

        let mut grids = HyperGrids::new();
        grids.insert("m".into(), linspace(m_lo, m_hi, n_grid));
        grids.insert("r".into(), count_grid(n, n_grid));
        grids.insert("s".into(), log_linspace(ssqdev / 100.0, ssqdev, n_grid));
        grids.insert("nu".into(), count_grid(n, n_grid));
        grids
    }

    fn posterior_hypers(&self) -> (f64, f64, f64, f64) {
        let n = f64::from(self.n);
        let rn = self.r + n;
        let nun = self.nu + n;
        let mn = self.r.mul_add(self.m, self.sum_x) / rn;
        let sn = self.s + self.sum_x_sq + self.r * self.m * self.m
            - rn * mn * mn;
        // guard against cancellation collapsing the scale
        let sn = if sn <= 0.0 { self.s } else { sn };
        (rn, nun, mn, sn)
    }

    fn log_z(r: f64, s: f64, nu: f64) -> f64 {
        ((nu + 1.0) / 2.0) * LOG2 + 0.5 * LOGPI - 0.5 * r.ln()
            - (nu / 2.0) * s.ln()
            + ln_gamma(nu / 2.0)
    }
}

impl ColumnModel for Gaussian {
    fn incorporate(&mut self, x: f64) {
        debug_assert!(x.is_finite());
        self.n += 1;
        self.sum_x += x;
        self.sum_x_sq += x * x;
    }

    fn unincorporate(&mut self, x: f64) {
        debug_assert!(self.n > 0);
        self.n -= 1;
        if self.n == 0 {
            self.sum_x = 0.0;
            self.sum_x_sq = 0.0;
        } else {
            self.sum_x -= x;
            self.sum_x_sq -= x * x;
        }
    }

    fn predictive_logp(&self, x: f64) -> f64 {
        if !x.is_finite() {
            return f64::NEG_INFINITY;
        }
        let mut with_x = self.clone();
        with_x.incorporate(x);
        with_x.marginal_logp() - self.marginal_logp()
    }

    fn marginal_logp(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let (rn, nun, _mn, sn) = self.posterior_hypers();
        -(f64::from(self.n) / 2.0) * LOG2PI
            + Self::log_z(rn, sn, nun)
            - Self::log_z(self.r, self.s, self.nu)
    }

    fn simulate(&self, rng: &mut impl Rng) -> f64 {
        let (rn, nun, mn, sn) = self.posterior_hypers();
        let coeff = (sn / 2.0) * (rn + 1.0) / ((nun / 2.0) * rn);
        let t = StudentT::new(nun).unwrap();
        rng.sample::<f64, _>(t).mul_add(coeff.sqrt(), mn)
    }

    fn n(&self) -> usize {
        self.n as usize
    }

    fn hypers(&self) -> Hypers {
        let mut hypers = Hypers::new();
        hypers.insert("m".into(), self.m);
        hypers.insert("r".into(), self.r);
        hypers.insert("s".into(), self.s);
        hypers.insert("nu".into(), self.nu);
        hypers
    }

    fn set_hypers(&mut self, hypers: &Hypers) {
        if let Some(&m) = hypers.get("m") {
            self.m = m;
        }
        if let Some(&r) = hypers.get("r") {
            self.r = r;
        }
        if let Some(&s) = hypers.get("s") {
            self.s = s;
        }
        if let Some(&nu) = hypers.get("nu") {
            self.nu = nu;
        }
    }

    fn is_collapsed(&self) -> bool {
        true
    }
}
