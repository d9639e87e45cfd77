//! Numerically stable log-space reductions shared by the HMM and
//! `BestPath2`.
//!
//! `rv::misc::logsumexp` already gives us a stable `log(sum(exp(xs)))`;
//! `logadd` is the pairwise specialization used on every hot HMM loop
//! iteration, where allocating a slice for two elements would be wasteful.

/// A value so negative that `exp(ALMOST_NEG_INF)` underflows to zero in
/// `f64`, yet arithmetic on it (addition, comparison) never produces NaN,
/// unlike `f64::NEG_INFINITY` combined with itself.
pub const ALMOST_NEG_INF: f64 = -1e10;

/// `log(exp(a) + exp(b))`, with the identity `logadd(-inf, x) == x`.
#[inline]
pub fn logadd(a: f64, b: f64) -> f64 {
    if a.is_infinite() && a < 0.0 {
        return b;
    }
    if b.is_infinite() && b < 0.0 {
        return a;
    }
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// `log(sum_i exp(xs[i]))` via pairwise reduction, routed through
/// [`rv::misc::logsumexp`] for the actual reduction.
pub fn logadd_array(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return f64::NEG_INFINITY;
    }
    rv::misc::logsumexp(xs)
}

/// Decide whether a row's total log-mass is so small it should be treated
/// as numeric underflow.
#[inline]
pub fn is_underflowed(total: f64) -> bool {
    total < ALMOST_NEG_INF / 2.0
}
