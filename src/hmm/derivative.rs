use crate::logmath::logadd;

use super::Hmm;

impl Hmm {
    /// `∂log p(x_d)/∂log p_i`: the posterior mass of state
    /// `i` being the start state, in closed form from beta.
    pub fn model_derivative_p(&mut self, i: usize, d: usize) -> f64 {
        let first = self.observations.as_ref().unwrap().get(d)[0] as usize;
        let beta0 = self.backward(0, i, d);
        let logp = self.model_probability(d);
        self.get_p(i) + self.get_b(i, first) + beta0 - logp
    }

    /// `∂log p(x_d)/∂log q_i`, symmetric via alpha at the last time step.
    pub fn model_derivative_q(&mut self, i: usize, d: usize) -> f64 {
        let t_len = self.observations.as_ref().unwrap().len(d);
        let alpha_last = self.forward(t_len - 1, i, d);
        let logp = self.model_probability(d);
        alpha_last + self.get_q(i) - logp
    }

    /// `∂log p(x_d)/∂log a_ij`: summed over every time step the edge
    /// `(i,j)` could have been taken.
    pub fn model_derivative_a(&mut self, i: usize, j: usize, d: usize) -> f64 {
        let seq = self.observations.as_ref().unwrap().get(d).to_vec();
        let t_len = seq.len();
        let a_ij = self.get_a(i, j);
        let mut sum = f64::NEG_INFINITY;
        for t in 0..t_len.saturating_sub(1) {
            let alpha_t = self.forward(t, i, d);
            let beta_t1 = self.backward((t + 1) as i64, j, d);
            sum = logadd(sum, alpha_t + a_ij + self.get_b(j, seq[t + 1] as usize) + beta_t1);
        }
        let logp = self.model_probability(d);
        sum - logp
    }

    /// `∂log p(x_d)/∂log b_io`: summed over every time step that emitted
    /// symbol `o` from state `i`.
    pub fn model_derivative_b(&mut self, i: usize, o: usize, d: usize) -> f64 {
        let seq = self.observations.as_ref().unwrap().get(d).to_vec();
        let t_len = seq.len();
        let mut sum = f64::NEG_INFINITY;
        for t in 0..t_len {
            if seq[t] as usize == o {
                let alpha_t = self.forward(t, i, d);
                let beta_t = self.backward(t as i64, i, d);
                sum = logadd(sum, alpha_t + beta_t);
            }
        }
        let logp = self.model_probability(d);
        sum - logp
    }

    /// `∂log p(x_d, π*)/∂log p_i`: the Viterbi path's analogue of
    /// [`Hmm::model_derivative_p`], a 0/1 usage count.
    pub fn path_derivative_p(&mut self, i: usize, d: usize) -> Result<f64, crate::error::HmmKernelError> {
        self.best_path(d as i64)?;
        Ok(if self.path(d).first() == Some(&i) { 1.0 } else { 0.0 })
    }

    pub fn path_derivative_q(&mut self, i: usize, d: usize) -> Result<f64, crate::error::HmmKernelError> {
        self.best_path(d as i64)?;
        Ok(if self.path(d).last() == Some(&i) { 1.0 } else { 0.0 })
    }

    /// Count of `t` where the decoded path takes the edge `(i, j)`.
    pub fn path_derivative_a(&mut self, i: usize, j: usize, d: usize) -> Result<f64, crate::error::HmmKernelError> {
        self.best_path(d as i64)?;
        let path = self.path(d);
        let count = path.windows(2).filter(|w| w[0] == i && w[1] == j).count();
        Ok(count as f64)
    }

    /// Count of `t` where the decoded path is in state `i` while emitting
    /// symbol `o`.
    pub fn path_derivative_b(&mut self, i: usize, o: usize, d: usize) -> Result<f64, crate::error::HmmKernelError> {
        self.best_path(d as i64)?;
        let seq = self.observations.as_ref().unwrap().get(d).to_vec();
        let path = self.path(d).to_vec();
        let count = path
            .iter()
            .zip(seq.iter())
            .filter(|(&p, &s)| p == i && s as usize == o)
            .count();
        Ok(count as f64)
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
    fn model_derivative_p_is_one_for_the_only_feasible_start_state() {
        let mut hmm = left_to_right(4, 3);
        hmm.convert_to_log();
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 2]]), None);
        let d0 = hmm.model_derivative_p(0, 0);
        assert!((d0.exp() - 1.0).abs() < 1e-9, "{}", d0.exp());
    }

    #[test]
    fn path_derivative_a_counts_edge_usage_on_decoded_path() {
        let mut hmm = left_to_right(4, 3);
        hmm.convert_to_log();
        hmm.set_observations(StringStore::new(vec![vec![0, 1, 2]]), None);
        let count = hmm.path_derivative_a(0, 1, 0).unwrap();
        assert_eq!(count, 1.0);
    }
}
