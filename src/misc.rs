//! Log-space math helpers shared by the partition primitive and samplers.
use rand::Rng;
use rv::misc::pflip;

/// ln Γ(x)
pub fn ln_gamma(x: f64) -> f64 {
    ::special::Gamma::ln_gamma(x).0
}

/// ln B(a, b)
pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// ln Σ exp(x)
pub fn logsumexp(logps: &[f64]) -> f64 {
    if logps.is_empty() {
        return f64::NEG_INFINITY;
    }
    let maxval = logps.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if maxval == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else if maxval.is_infinite() {
        f64::INFINITY
    } else {
        maxval
            + logps
                .iter()
                .map(|lp| (lp - maxval).exp())
                .sum::<f64>()
                .ln()
    }
}

/// ln (1/n) Σ exp(x)
pub fn logmeanexp(logps: &[f64]) -> f64 {
    logsumexp(logps) - (logps.len() as f64).ln()
}

/// Normalize log weights so they exponentiate to a distribution.
pub fn log_normalize(logps: &[f64]) -> Vec<f64> {
    let z = logsumexp(logps);
    logps.iter().map(|lp| lp - z).collect()
}

/// `n` points evenly spaced on [a, b].
pub fn linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![a];
    }
    let dx = (b - a) / (n as f64 - 1.0);
    (0..n).map(|i| a + dx * (i as f64)).collect()
}

/// `n` points evenly spaced on [a, b] in log space. Requires a, b > 0.
pub fn log_linspace(a: f64, b: f64, n: usize) -> Vec<f64> {
    linspace(a.ln(), b.ln(), n)
        .iter()
        .map(|x| x.exp())
        .collect()
}

/// Log marginal of a CRP partition with cluster sizes `counts` over `n`
/// items: Σ_k ln Γ(n_k) + K ln α + ln Γ(α) − ln Γ(n + α).
pub fn lcrp<'a>(
    n: usize,
    counts: impl Iterator<Item = &'a usize>,
    alpha: f64,
) -> f64 {
    let mut k: usize = 0;
    let gsum = counts.fold(0.0, |acc, &ct| {
        k += 1;
        acc + ln_gamma(ct as f64)
    });
    gsum + (k as f64).mul_add(alpha.ln(), ln_gamma(alpha))
        - ln_gamma(n as f64 + alpha)
}

/// Approximate float equality for evidence-consistency checks.
pub fn allclose(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrpDraw {
    pub asgn: Vec<usize>,
    pub counts: Vec<usize>,
    pub n_cats: usize,
}

/// Draw a partition of `n` items from the CRP prior.
pub fn crp_draw<R: Rng>(n: usize, alpha: f64, rng: &mut R) -> CrpDraw {
    let mut asgn: Vec<usize> = Vec::with_capacity(n);
    let mut counts: Vec<usize> = Vec::new();

    for _ in 0..n {
        // each seated customer by count, plus one fresh table at alpha
        let mut weights: Vec<f64> =
            counts.iter().map(|&ct| ct as f64).collect();
        weights.push(alpha);
        let k = pflip(&weights, 1, rng)[0];
        if k == counts.len() {
            counts.push(1);
        } else {
            counts[k] += 1;
        }
        asgn.push(k);
    }

    let n_cats = counts.len();
    CrpDraw {
        asgn,
        counts,
        n_cats,
    }
}
