use crate::logmath::logadd;

use super::Hmm;

impl Hmm {
    /// `backward(t, state, d)`, symmetric to
    /// [`Hmm::forward`] using `succ(i)`. `beta[T-1,i] = q[i]`. The first
    /// call with `t < 0` eagerly computes the whole backward table and
    /// returns the full marginal (which must equal `forward`'s marginal
    /// up to round-off).
    pub fn backward(&mut self, time: i64, state: usize, d: usize) -> f64 {
        self.backward_fill(d);
        let cache = self.beta_cache[d].as_ref().unwrap();
        if time < 0 {
            cache.sum
        } else {
            cache.table[[time as usize, state]]
        }
    }

    fn backward_fill(&mut self, d: usize) {
        if let Some(c) = &self.beta_cache[d] {
            if c.updated {
                return;
            }
        }
        let seq = self.observations.as_ref().unwrap().get(d).to_vec();
        let t_len = seq.len();
        let n = self.n;
        log::trace!("backward_fill d={d} T={t_len} N={n}");
        self.ensure_transition_lists();
        self.beta_cache[d].get_or_insert_with(|| super::AlphaBetaCache::new(t_len, n));

        let mut table = ndarray::Array2::from_elem((t_len, n), f64::NEG_INFINITY);
        for i in 0..n {
            table[[t_len - 1, i]] = self.get_q(i);
        }

        let succ = self.succ.clone().unwrap();
        for t in (0..t_len - 1).rev() {
            for i in 0..n {
                let sum = succ[i].iter().fold(f64::NEG_INFINITY, |acc, &(j, a_ij)| {
                    logadd(acc, a_ij + self.get_b(j, seq[t + 1] as usize) + table[[t + 1, j]])
                });
                table[[t, i]] = sum;
            }
        }

        let mut sum = f64::NEG_INFINITY;
        for i in 0..n {
            sum = logadd(sum, self.get_p(i) + self.get_b(i, seq[0] as usize) + table[[0, i]]);
        }

        let cache = self.beta_cache[d].as_mut().unwrap();
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
    fn forward_backward_agree_h1() {
        let mut hmm = left_to_right(5, 4);
        hmm.convert_to_log();
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 2, 3]]), None);
        let fwd = hmm.forward(usize::MAX, 0, 0);
        let bwd = hmm.backward(-1, 0, 0);
        let t = 4.0;
        assert!((fwd - bwd).abs() < 1e-6 * t, "{fwd} vs {bwd}");
    }
}
