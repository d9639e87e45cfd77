use std::collections::HashSet;

use crate::error::{HmmKernelError, Result};
use crate::logmath::ALMOST_NEG_INF;

use super::Hmm;

/// Added to `delta[t,j]` for cells the caller forbids via
/// `best_path_with_forbidden`.
pub const DISALLOWED_PENALTY: f64 = ALMOST_NEG_INF;

impl Hmm {
    /// `max_pi p(x_d, pi)`. `dimension < 0` returns the mean
    /// of Viterbi log-probabilities over all sequences and caches it. Ties in the recursion are broken by the lowest
    /// predecessor index.
    pub fn best_path(&mut self, dimension: i64) -> Result<f64> {
        self.best_path_with_forbidden(dimension, &[])
    }

    /// As [`Hmm::best_path`], but every `(t, state)` cell in `forbidden`
    /// has [`DISALLOWED_PENALTY`] added to its `delta` before the
    /// recursion proceeds.
    pub fn best_path_with_forbidden(
        &mut self,
        dimension: i64,
        forbidden: &[(usize, usize)],
    ) -> Result<f64> {
        if dimension < 0 {
            if forbidden.is_empty() {
                if let Some(avg) = self.all_path_prob_cached() {
                    return Ok(avg);
                }
            }
            let num = self
                .observations
                .as_ref()
                .ok_or_else(|| HmmKernelError::BadArgument("no observations bound".into()))?
                .num();
            let mut sum = 0.0;
            for d in 0..num {
                sum += self.best_path_with_forbidden(d as i64, forbidden)?;
            }
            let avg = sum / num.max(1) as f64;
            if forbidden.is_empty() {
                self.set_all_path_prob_cache(avg);
            }
            return Ok(avg);
        }

        let d = dimension as usize;
        if forbidden.is_empty() {
            if let Some(p) = self.path_prob[d] {
                return Ok(p);
            }
        }
        let prob = self.viterbi_fill(d, forbidden)?;
        if forbidden.is_empty() {
            self.path_prob[d] = Some(prob);
        }
        Ok(prob)
    }

    /// The decoded state sequence for `d`, materialized on every call to
    /// [`Hmm::best_path`].
    pub fn path(&self, d: usize) -> &[usize] {
        self.path[d].as_deref().unwrap_or(&[])
    }

    fn viterbi_fill(&mut self, d: usize, forbidden: &[(usize, usize)]) -> Result<f64> {
        let seq = self
            .observations
            .as_ref()
            .ok_or_else(|| HmmKernelError::BadArgument("no observations bound".into()))?
            .get(d)
            .to_vec();
        let t_len = seq.len();
        let n = self.n;
        let forbidden_set: HashSet<(usize, usize)> = forbidden.iter().copied().collect();

        let mut delta = ndarray::Array2::from_elem((t_len, n), f64::NEG_INFINITY);
        let mut psi = ndarray::Array2::<usize>::zeros((t_len, n));

        for i in 0..n {
            delta[[0, i]] = self.get_p(i) + self.get_b(i, seq[0] as usize);
        }

        for t in 1..t_len {
            for j in 0..n {
                let mut maxj = delta[[t - 1, 0]] + self.get_a(0, j);
                let mut argmax = 0usize;
                for i in 1..n {
                    let temp = delta[[t - 1, i]] + self.get_a(i, j);
                    if temp > maxj {
                        maxj = temp;
                        argmax = i;
                    }
                }
                let mut value = maxj + self.get_b(j, seq[t] as usize);
                if forbidden_set.contains(&(t, j)) {
                    value += DISALLOWED_PENALTY;
                }
                delta[[t, j]] = value;
                psi[[t, j]] = argmax;
            }
        }

        let mut maxj = delta[[t_len - 1, 0]] + self.get_q(0);
        let mut argmax = 0usize;
        for i in 1..n {
            let temp = delta[[t_len - 1, i]] + self.get_q(i);
            if temp > maxj {
                maxj = temp;
                argmax = i;
            }
        }

        let mut path = vec![0usize; t_len];
        path[t_len - 1] = argmax;
        for t in (1..t_len).rev() {
            path[t - 1] = psi[[t, path[t]]];
        }

        self.psi[d] = Some(psi);
        self.path[d] = Some(path);
        Ok(maxj)
    }

    fn all_path_prob_cached(&self) -> Option<f64> {
        self.all_path_prob
    }

    fn set_all_path_prob_cache(&mut self, v: f64) {
        self.all_path_prob = Some(v);
    }
}

#[cfg(test)]
mod test {
    use ndarray::Array2;

    use crate::{hmm::Hmm, sequence_store::StringStore};

    #[test]
    fn scenario_2_viterbi_tie_break() {
        let p = vec![0.5, 0.5];
        let q = vec![0.5, 0.5];
        let a = Array2::from_elem((2, 2), 0.25);
        let b = Array2::from_elem((2, 2), 0.5);
        let mut hmm = Hmm::from_dense(p, q, a, b).unwrap();
        hmm.convert_to_log();
        hmm.set_observations(StringStore::new(vec![vec![0, 1]]), None);
        hmm.best_path(0).unwrap();
        assert_eq!(hmm.path(0), &[0, 0]);
    }

    #[test]
    fn h3_viterbi_leq_forward() {
        let n = 4;
        let m = 3;
        let mut p = vec![0.1; n];
        p[0] = 0.7;
        let q = vec![0.25; n];
        let a = Array2::from_elem((n, n), 1.0 / n as f64);
        let b = Array2::from_elem((n, m), 1.0 / m as f64);
        let mut hmm = Hmm::from_dense(p, q, a, b).unwrap();
        hmm.normalize(false);
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 2, 0, 1]]), None);
        let vit = hmm.best_path(0).unwrap();
        let fwd = hmm.forward(usize::MAX, 0, 0);
        assert!(vit <= fwd + 1e-9);
    }

    #[test]
    fn h5_mean_matches_per_sequence_average() {
        let n = 3;
        let m = 2;
        let p = vec![1.0 / 3.0; n];
        let q = vec![1.0 / 3.0; n];
        let a = Array2::from_elem((n, n), 1.0 / (n + 1) as f64);
        let b = Array2::from_elem((n, m), 0.5);
        let mut hmm = Hmm::from_dense(p, q, a, b).unwrap();
        hmm.normalize(false);
        hmm.set_observations(
            StringStore::new(vec![vec![0, 1, 0], vec![1, 1], vec![0, 0, 1, 1]]),
            None,
        );
        let mean = hmm.best_path(-1).unwrap();
        let manual = (hmm.best_path(0).unwrap() + hmm.best_path(1).unwrap() + hmm.best_path(2).unwrap()) / 3.0;
        assert!((mean - manual).abs() < 1e-9);
    }
}
