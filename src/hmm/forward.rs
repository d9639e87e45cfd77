use crate::logmath::logadd;

use super::Hmm;

impl Hmm {
    /// `forward(t, state, d)`: returns the full marginal
    /// `p(x_d)` when `t` is at or past the end of the sequence, the
    /// initialization value when `t < 1`, or the cached cell
    /// `alpha[t, state]` otherwise. Table writes go through
    /// `alpha_cache[d]` once a cache has been bound via
    /// `set_observations`.
    pub fn forward(&mut self, time: usize, state: usize, d: usize) -> f64 {
        let t_len = self.observations.as_ref().expect("no observations bound").len(d);
        if time < 1 {
            let first = self.observations.as_ref().unwrap().get(d)[0] as usize;
            return self.get_p(state) + self.get_b(state, first);
        }
        let fast = self.options.fast_forward;
        self.forward_fill(d, fast);
        let cache = self.alpha_cache[d].as_ref().unwrap();
        if time >= t_len {
            cache.sum
        } else {
            cache.table[[time, state]]
        }
    }

    /// The sequence-index-ordered canonical path when `sequence_ordered`
    /// is true, and the alternate reduction order otherwise; both populate the same cache shape so callers can
    /// cross-check them.
    fn forward_fill(&mut self, d: usize, fast: bool) {
        if let Some(c) = &self.alpha_cache[d] {
            if c.updated {
                return;
            }
        }
        let seq = self.observations.as_ref().unwrap().get(d).to_vec();
        let t_len = seq.len();
        let n = self.n;
        log::trace!("forward_fill d={d} T={t_len} N={n} fast={fast}");
        self.ensure_transition_lists();
        self.alpha_cache[d].get_or_insert_with(|| super::AlphaBetaCache::new(t_len, n));

        let mut table = ndarray::Array2::from_elem((t_len, n), f64::NEG_INFINITY);
        for i in 0..n {
            table[[0, i]] = self.get_p(i) + self.get_b(i, seq[0] as usize);
        }

        let pred = self.pred.clone().unwrap();
        for t in 1..t_len {
            for j in 0..n {
                let sum = if fast {
                    // Alternate order: iterate all predecessors 0..n
                    // regardless of sparsity, matching forward_comp_old's
                    // reduction order rather than the sparse list order.
                    (0..n).fold(f64::NEG_INFINITY, |acc, i| {
                        logadd(acc, table[[t - 1, i]] + self.a[[i, j]])
                    })
                } else {
                    pred[j]
                        .iter()
                        .fold(f64::NEG_INFINITY, |acc, &(i, a_ij)| logadd(acc, table[[t - 1, i]] + a_ij))
                };
                table[[t, j]] = sum + self.get_b(j, seq[t] as usize);
            }
        }

        let mut sum = f64::NEG_INFINITY;
        for i in 0..n {
            sum = logadd(sum, table[[t_len - 1, i]] + self.get_q(i));
        }

        let cache = self.alpha_cache[d].as_mut().unwrap();
        cache.table = table;
        cache.sum = sum;
        cache.updated = true;
    }
}

#[cfg(test)]
mod test {
    use ndarray::Array2;

    use crate::{hmm::Hmm, sequence_store::StringStore};

    fn left_to_right(n: usize, m: usize) -> Hmm {
        let mut p = vec![0.0; n];
        p[0] = 1.0;
        let mut q = vec![0.0; n];
        q[n - 1] = 1.0;
        let mut a = Array2::zeros((n, n));
        for i in 0..n - 1 {
            a[[i, i + 1]] = 1.0;
        }
        let b = Array2::from_elem((n, m), 1.0 / m as f64);
        Hmm::from_dense(p, q, a, b).unwrap()
    }

    #[test]
    fn scenario_1_hmm_round_trip() {
        let mut hmm = left_to_right(5, 4);
        hmm.convert_to_log();
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 2, 3]]), None);
        let logp = hmm.forward(usize::MAX, 0, 0);
        let expected = (1.0f64 / 256.0).ln();
        assert!((logp - expected).abs() < 1e-9, "{logp} vs {expected}");
    }

    #[test]
    fn fast_forward_matches_canonical_within_tolerance() {
        let mut canonical = left_to_right(4, 3);
        canonical.convert_to_log();
        canonical.set_observations(StringStore::new(vec![vec![0, 1, 2, 0, 1]]), None);
        let p1 = canonical.forward(usize::MAX, 0, 0);

        let mut fast = left_to_right(4, 3);
        fast.convert_to_log();
        fast.options.fast_forward = true;
        fast.set_observations(StringStore::new(vec![vec![0, 1, 2, 0, 1]]), None);
        let p2 = fast.forward(usize::MAX, 0, 0);

        assert!((p1 - p2).abs() < 1e-9, "{p1} vs {p2}");
    }
}
