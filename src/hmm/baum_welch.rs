use std::ops::Range;

use ndarray::Array2;
use rayon::prelude::*;

use crate::error::{HmmKernelError, Result};
use crate::logmath::{is_underflowed, logadd, ALMOST_NEG_INF};

use super::Hmm;

/// Per-partition numerator accumulators for one block of sequences,
/// combined into the destination model in partition order (fixed-order reduce).
struct BwPartial {
    p: Vec<f64>,
    q: Vec<f64>,
    a: Array2<f64>,
    b: Array2<f64>,
    logprob_sum: f64,
}

fn partition_ranges(num: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1).min(num.max(1));
    (0..workers)
        .map(|w| (num * w / workers)..(num * (w + 1) / workers))
        .collect()
}

impl Hmm {
    /// `p(x_d)` under the current parameters, via the forward marginal.
    pub fn model_probability(&mut self, d: usize) -> f64 {
        self.forward(usize::MAX, 0, d)
    }

    /// As [`Hmm::model_probability`], but escalates to
    /// `NumericUnderflow` if the row's total mass is still below
    /// `ALMOST_NEG_INF/2` after a single renormalization attempt.
    pub fn model_probability_checked(&mut self, d: usize) -> Result<f64> {
        let logp = self.model_probability(d);
        if !is_underflowed(logp) {
            return Ok(logp);
        }
        log::warn!("model_probability underflowed for sequence {d}, retrying after normalize");
        self.normalize(true);
        self.invalidate_caches();
        let retried = self.model_probability(d);
        if is_underflowed(retried) {
            return Err(HmmKernelError::NumericUnderflow);
        }
        Ok(retried)
    }

    fn check_compatible(&self, train: &Hmm) -> Result<()> {
        if self.n != train.n || self.m != train.m {
            return Err(HmmKernelError::DimensionMismatch(
                "baum-welch requires matching N/M between source and destination".into(),
            ));
        }
        Ok(())
    }

    /// `estimate_model_baum_welch`: reestimates `self` (used purely as a
    /// numerator accumulator) from `train`'s forward/backward caches,
    /// then normalizes. Returns the summed sequence log-likelihood under
    /// `train` (calling this repeatedly, alternating
    /// source/destination, must not decrease that sum).
    pub fn estimate_baum_welch(&mut self, train: &mut Hmm) -> Result<f64> {
        self.check_compatible(train)?;
        let num = train
            .observations
            .as_ref()
            .ok_or_else(|| HmmKernelError::BadArgument("no observations bound on source model".into()))?
            .num();

        log::info!("baum-welch sweep start: {num} sequences, {} workers", self.options.num_parallel);
        for d in 0..num {
            train.forward(usize::MAX, 0, d);
            train.backward(-1, 0, d);
        }
        train.ensure_transition_lists();

        self.reset_numerators(train);

        let n = self.n;
        let m = self.m;
        let train_ref: &Hmm = train;
        let partials: Vec<BwPartial> = partition_ranges(num, self.options.num_parallel)
            .into_par_iter()
            .map(|range| train_ref.bw_partial(range, n, m))
            .collect();

        let mut fullmodprob = 0.0;
        for partial in partials {
            fullmodprob += partial.logprob_sum;
            for i in 0..n {
                self.p[i] = logadd(self.p[i], partial.p[i]);
                self.q[i] = logadd(self.q[i], partial.q[i]);
                for j in 0..n {
                    self.a[[i, j]] = logadd(self.a[[i, j]], partial.a[[i, j]]);
                }
                for o in 0..m {
                    self.b[[i, o]] = logadd(self.b[[i, o]], partial.b[[i, o]]);
                }
            }
        }

        self.normalize(true);
        log::debug!("baum-welch sweep done: logprob_sum={fullmodprob}");
        Ok(fullmodprob)
    }

    /// Resets `p`/`q`/`a`/`b` to `log(pseudo)` wherever `train` has a
    /// finite (non-floor) value there, and copies `train`'s floor value
    /// through otherwise, so disallowed transitions/emissions stay
    /// disallowed across reestimation rounds.
    fn reset_numerators(&mut self, train: &Hmm) {
        let pseudo = self.options.pseudo.ln();
        for i in 0..self.n {
            self.p[i] = if train.p[i] > ALMOST_NEG_INF { pseudo } else { train.p[i] };
            self.q[i] = if train.q[i] > ALMOST_NEG_INF { pseudo } else { train.q[i] };
            for j in 0..self.n {
                self.a[[i, j]] = if train.a[[i, j]] > ALMOST_NEG_INF {
                    pseudo
                } else {
                    train.a[[i, j]]
                };
            }
            for o in 0..self.m {
                self.b[[i, o]] = if train.b[[i, o]] > ALMOST_NEG_INF {
                    pseudo
                } else {
                    train.b[[i, o]]
                };
            }
        }
        self.is_log = true;
    }

    /// Accumulates the unconstrained numerators for the sequences in
    /// `range`, reading only already-warmed alpha/beta caches (safe to
    /// call concurrently across disjoint ranges of the same `&Hmm`).
    fn bw_partial(&self, range: Range<usize>, n: usize, m: usize) -> BwPartial {
        let mut p = vec![f64::NEG_INFINITY; n];
        let mut q = vec![f64::NEG_INFINITY; n];
        let mut a = Array2::from_elem((n, n), f64::NEG_INFINITY);
        let mut b = Array2::from_elem((n, m), f64::NEG_INFINITY);
        let mut logprob_sum = 0.0;

        let obs = self.observations.as_ref().unwrap();
        let succ = self.succ.as_ref().unwrap();

        for d in range {
            let seq = obs.get(d);
            let t_len = seq.len();
            let dimmodprob = self.alpha_cache[d].as_ref().unwrap().sum;
            logprob_sum += dimmodprob;

            for i in 0..n {
                p[i] = logadd(
                    p[i],
                    self.p[i] + self.get_b(i, seq[0] as usize) + self.beta_at(d, 0, i) - dimmodprob,
                );
                q[i] = logadd(
                    q[i],
                    self.alpha_at(d, t_len - 1, i) + self.q[i] - dimmodprob,
                );

                for &(j, a_ij) in &succ[i] {
                    let mut a_sum = f64::NEG_INFINITY;
                    for t in 0..t_len.saturating_sub(1) {
                        a_sum = logadd(
                            a_sum,
                            self.alpha_at(d, t, i) + a_ij + self.get_b(j, seq[t + 1] as usize) + self.beta_at(d, t + 1, j),
                        );
                    }
                    a[[i, j]] = logadd(a[[i, j]], a_sum - dimmodprob);
                }

                for o in 0..m {
                    let mut b_sum = f64::NEG_INFINITY;
                    for t in 0..t_len {
                        if seq[t] as usize == o {
                            b_sum = logadd(b_sum, self.alpha_at(d, t, i) + self.beta_at(d, t, i));
                        }
                    }
                    b[[i, o]] = logadd(b[[i, o]], b_sum - dimmodprob);
                }
            }
        }

        BwPartial { p, q, a, b, logprob_sum }
    }

    fn alpha_at(&self, d: usize, t: usize, i: usize) -> f64 {
        self.alpha_cache[d].as_ref().unwrap().table[[t, i]]
    }

    fn beta_at(&self, d: usize, t: usize, i: usize) -> f64 {
        self.beta_cache[d].as_ref().unwrap().table[[t, i]]
    }

    /// `estimate_model_baum_welch_defined`: as [`Hmm::estimate_baum_welch`]
    /// but only the positions in `train`'s [`super::Constraints`] are
    /// touched; everything else is copied through unreestimated.
    pub fn estimate_baum_welch_defined(&mut self, train: &mut Hmm) -> Result<f64> {
        self.check_compatible(train)?;
        let num = train
            .observations
            .as_ref()
            .ok_or_else(|| HmmKernelError::BadArgument("no observations bound on source model".into()))?
            .num();
        for d in 0..num {
            train.forward(usize::MAX, 0, d);
            train.backward(-1, 0, d);
        }

        let pseudo = self.options.pseudo.ln();
        let constraints = train.constraints.clone();
        for &i in &constraints.learn_p {
            self.p[i] = pseudo;
        }
        for &(i, v) in &constraints.const_p {
            self.p[i] = v;
        }
        for &i in &constraints.learn_q {
            self.q[i] = pseudo;
        }
        for &(i, v) in &constraints.const_q {
            self.q[i] = v;
        }
        for &(i, j) in &constraints.learn_a {
            self.a[[i, j]] = pseudo;
        }
        for &(i, j, v) in &constraints.const_a {
            self.a[[i, j]] = v;
        }
        for &(i, j) in &constraints.learn_b {
            self.b[[i, j]] = pseudo;
        }
        for &(i, j, v) in &constraints.const_b {
            self.b[[i, j]] = v;
        }
        self.is_log = true;

        let mut fullmodprob = 0.0;
        let mut a_denom = vec![f64::NEG_INFINITY; self.n];
        let mut b_denom = vec![f64::NEG_INFINITY; self.n];

        for d in 0..num {
            let seq = train.observations.as_ref().unwrap().get(d).to_vec();
            let t_len = seq.len();
            let dimmodprob = train.alpha_cache[d].as_ref().unwrap().sum;
            fullmodprob += dimmodprob;

            for &i in &constraints.learn_p {
                self.p[i] = logadd(
                    self.p[i],
                    train.forward(0, i, d) + train.backward(0, i, d) - dimmodprob,
                );
            }
            for &i in &constraints.learn_q {
                self.q[i] = logadd(
                    self.q[i],
                    train.forward(t_len - 1, i, d) + train.backward((t_len - 1) as i64, i, d) - dimmodprob,
                );
            }

            // The denominator only depends on i, not on the (i, j) edge, so
            // accumulate it once per distinct i touched by learn_a this d.
            let mut seen_a = std::collections::HashSet::new();
            for &(i, _) in &constraints.learn_a {
                if !seen_a.insert(i) {
                    continue;
                }
                let mut sum = f64::NEG_INFINITY;
                for t in 0..t_len.saturating_sub(1) {
                    sum = logadd(sum, train.forward(t, i, d) + train.backward(t as i64, i, d) - dimmodprob);
                }
                a_denom[i] = logadd(a_denom[i], sum);
            }

            for &(i, j) in &constraints.learn_a {
                let mut a_sum = f64::NEG_INFINITY;
                for t in 0..t_len.saturating_sub(1) {
                    a_sum = logadd(
                        a_sum,
                        train.forward(t, i, d)
                            + train.get_a(i, j)
                            + train.get_b(j, seq[t + 1] as usize)
                            + train.backward((t + 1) as i64, j, d),
                    );
                }
                self.a[[i, j]] = logadd(self.a[[i, j]], a_sum - dimmodprob);
            }

            let mut seen_b = std::collections::HashSet::new();
            for &(i, _) in &constraints.learn_b {
                if !seen_b.insert(i) {
                    continue;
                }
                let mut sum = f64::NEG_INFINITY;
                for t in 0..t_len {
                    sum = logadd(sum, train.forward(t, i, d) + train.backward(t as i64, i, d) - dimmodprob);
                }
                b_denom[i] = logadd(b_denom[i], sum);
            }

            for &(i, j) in &constraints.learn_b {
                let mut b_sum = f64::NEG_INFINITY;
                for t in 0..t_len {
                    if seq[t] as usize == j {
                        b_sum = logadd(b_sum, train.forward(t, i, d) + train.backward(t as i64, i, d));
                    }
                }
                self.b[[i, j]] = logadd(self.b[[i, j]], b_sum - dimmodprob);
            }
        }

        for &i in &constraints.learn_p {
            self.p[i] -= (num as f64 + self.n as f64 * self.options.pseudo).ln();
        }
        for &i in &constraints.learn_q {
            self.q[i] -= (num as f64 + self.n as f64 * self.options.pseudo).ln();
        }
        for &(i, j) in &constraints.learn_a {
            self.a[[i, j]] -= a_denom[i];
        }
        for &(i, j) in &constraints.learn_b {
            self.b[[i, j]] -= b_denom[i];
        }

        self.invalidate_transition_lists();
        self.invalidate_caches();
        Ok(fullmodprob)
    }
}

#[cfg(test)]
mod test {
    use ndarray::Array2;

    use crate::{hmm::Hmm, sequence_store::StringStore};

    fn dna_like(n: usize, m: usize) -> Hmm {
        let p = vec![1.0 / n as f64; n];
        let q = vec![1.0 / n as f64; n];
        let a = Array2::from_elem((n, n), 1.0 / n as f64);
        let b = Array2::from_elem((n, m), 1.0 / m as f64);
        let mut hmm = Hmm::from_dense(p, q, a, b).unwrap();
        hmm.normalize(false);
        hmm
    }

    #[test]
    fn h4_baum_welch_does_not_decrease_likelihood() {
        let obs = StringStore::new(vec![
            vec![0, 1, 2, 3, 0, 1],
            vec![1, 1, 2, 2, 3, 3],
            vec![3, 2, 1, 0, 0, 1],
        ]);

        let mut model_a = dna_like(3, 4);
        model_a.set_observations(obs.clone(), None);

        let mut model_b = Hmm::like(&model_a);
        model_b.set_observations(obs.clone(), None);
        let ll_round0 = model_b.estimate_baum_welch(&mut model_a).unwrap();

        let mut model_c = Hmm::like(&model_b);
        model_c.set_observations(obs, None);
        let ll_round1 = model_c.estimate_baum_welch(&mut model_b).unwrap();

        assert!(ll_round1 >= ll_round0 - 1e-6, "{ll_round1} should be >= {ll_round0}");
    }

    #[test]
    fn model_probability_checked_escalates_on_truly_infeasible_observation() {
        // Symbol 3 has zero emission probability from every state, so any
        // sequence containing it has a forward marginal of exactly
        // `f64::NEG_INFINITY`, which no renormalization can repair.
        let mut hmm = dna_like(3, 4);
        for i in 0..3 {
            hmm.set_b(i, 3, f64::NEG_INFINITY);
        }
        hmm.normalize(true);
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 3, 2]]), None);
        let err = hmm.model_probability_checked(0).unwrap_err();
        assert!(matches!(err, crate::error::HmmKernelError::NumericUnderflow));
    }

    #[test]
    fn model_probability_checked_passes_through_feasible_observation() {
        let mut hmm = dna_like(3, 4);
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 2, 3]]), None);
        let logp = hmm.model_probability_checked(0).unwrap();
        assert!(logp.is_finite());
    }
}
