//! Two-pass Viterbi-with-PLiF decoder for segmentation-style problems:
//! n-best backtracking over `(time, state, rank)` cells, with
//! position-aware transition penalties and segment-sum state scores.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;

use crate::error::{HmmKernelError, Result};
use crate::kernel::Plif;
use crate::logmath::ALMOST_NEG_INF;

/// A working-set byte estimate above which [`BestPath2::decode`] logs a
/// warning instead of proceeding silently (large-memory mode).
const LARGE_MEMORY_BYTES: usize = 200 * 1024 * 1024;
const LARGE_MEMORY_T: usize = 5000;
const CANCEL_POLL_DIVISOR: usize = 1000;
/// `SEQ[j,t] < -10^20` is treated as an infeasible observation.
const INFEASIBLE_THRESHOLD: f64 = -1e20;

/// Options controlling the decoder, following the teacher's `Options`
/// builder idiom.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BestPath2Options {
    /// `K`, the number of best paths tracked per `(t, j)` cell.
    pub n_best: usize,
}

impl Default for BestPath2Options {
    fn default() -> Self {
        Self { n_best: 1 }
    }
}

impl BestPath2Options {
    pub fn n_best(&mut self, v: usize) -> &mut Self {
        self.n_best = v;
        self
    }
}

/// `lookback(i,j)`: the largest `pos[t] - pos[ts]` gap the decoder will
/// consider when searching for a predecessor cell on transition `(i,j)`.
/// A dense `N x N` table, following the teacher's `Array2`-of-parameters
/// convention.
pub struct LookbackTable(Array2<usize>);

impl LookbackTable {
    pub fn uniform(n: usize, value: usize) -> Self {
        Self(Array2::from_elem((n, n), value))
    }

    pub fn from_matrix(values: Array2<usize>) -> Self {
        Self(values)
    }

    pub fn get(&self, i: usize, j: usize) -> usize {
        self.0[[i, j]]
    }
}

/// `pen[i][j]` is the PLiF annotating transition `(i, j)`, or `None` for
/// an unpenalized transition (PEN).
pub struct PenaltyTable(Vec<Vec<Option<Plif>>>);

impl PenaltyTable {
    pub fn new(n: usize) -> Self {
        Self((0..n).map(|_| (0..n).map(|_| None).collect()).collect())
    }

    pub fn set(&mut self, i: usize, j: usize, plif: Plif) {
        self.0[i][j] = Some(plif);
    }

    fn lookup(&self, i: usize, j: usize, delta_pos: f64, svm_value: f64) -> (f64, f64) {
        match &self.0[i][j] {
            Some(plif) => plif.lookup(delta_pos, svm_value),
            None => (0.0, 0.0),
        }
    }

    /// Whether any transition is annotated with an SVM-weighted PLiF,
    /// in which case `decode` requires one `svm_values` entry per time
    /// step.
    fn any_uses_svm(&self) -> bool {
        self.0.iter().flatten().flatten().any(|p| p.uses_svm())
    }
}

#[derive(Debug, Clone)]
pub struct BestPath2Result {
    /// `prob_nbest[k]`, the k-th best terminal log-score.
    pub prob_nbest: Vec<f64>,
    /// `my_state_seq`: one decoded state sequence per rank, chronological.
    pub state_seq: Vec<Vec<usize>>,
    /// `my_pos_seq`: the matching position sequence per rank.
    pub pos_seq: Vec<Vec<usize>>,
    /// `PEN_values`: penalty contribution credited at each backtracked step.
    pub pen_values: Vec<Vec<f64>>,
    /// `PEN_input_values`: the PLiF input actually looked up at each step.
    pub pen_input_values: Vec<Vec<f64>>,
}

/// Backpointer triple `(ψ, κ, π)`: predecessor state, predecessor rank,
/// predecessor time index. `usize::MAX` marks "no predecessor" (path start).
#[derive(Debug, Clone, Copy)]
struct BackPointer {
    state: usize,
    rank: usize,
    time: usize,
    pen_value: f64,
    pen_input: f64,
}

const NO_PRED: usize = usize::MAX;

/// Two-pass decoder: pass one fills `δ`/backpointers forward in time,
/// pass two backtracks from the `K` best terminal cells.
pub struct BestPath2 {
    n: usize,
    options: BestPath2Options,
    lookback: LookbackTable,
    cancel: Arc<AtomicBool>,
}

impl BestPath2 {
    pub fn new(n: usize, lookback: LookbackTable, options: BestPath2Options) -> Self {
        Self {
            n,
            options,
            lookback,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clonable handle the caller can flip from another thread to
    /// abort a long-running `decode` (Cancellation is checked
    /// every 1/1000 of T).
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Decodes `seq` (`N x T` emission log-scores), with `pos[t]` giving
    /// each column's genomic position, `trans_a`/`term_q` the HMM's
    /// transition and termination log-parameters, `pen` the per-edge
    /// PLiFs, `svm_values[t]` an optional SVM feature per position, and
    /// `segment_sum[j][t]` a per-state prefix sum used to price
    /// `segment_sum[j, ts..t]` as `segment_sum[j][t] - segment_sum[j][ts]`
    /// in O(1).
    pub fn decode(
        &self,
        seq: &Array2<f64>,
        pos: &[usize],
        trans_a: &Array2<f64>,
        term_q: &[f64],
        pen: &PenaltyTable,
        svm_values: &[f64],
        segment_sum: &Array2<f64>,
    ) -> Result<BestPath2Result> {
        let n = self.n;
        let t_len = seq.ncols();
        if seq.nrows() != n || trans_a.shape() != [n, n] || term_q.len() != n {
            return Err(HmmKernelError::DimensionMismatch(
                "BestPath2 inputs disagree on N".into(),
            ));
        }
        let k = self.options.n_best.max(1);

        if pen.any_uses_svm() && svm_values.len() < t_len {
            return Err(HmmKernelError::SvmIndexOutOfRange {
                index: t_len.saturating_sub(1),
                len: svm_values.len(),
            });
        }

        let approx_bytes = n * t_len * k * std::mem::size_of::<f64>() * 2;
        if approx_bytes > LARGE_MEMORY_BYTES || t_len > LARGE_MEMORY_T {
            log::warn!(
                "BestPath2 large-memory mode: N={n} T={t_len} K={k}, working set ~{} MB",
                approx_bytes / (1024 * 1024)
            );
        } else {
            log::debug!("BestPath2 decoding N={n} T={t_len} K={k}");
        }

        let genome_span = pos.last().copied().unwrap_or(0).saturating_sub(pos.first().copied().unwrap_or(0));
        for i in 0..n {
            for j in 0..n {
                if self.lookback.get(i, j) > genome_span && genome_span > 0 {
                    return Err(HmmKernelError::LookbackExceedsGenome(format!(
                        "lookback({i},{j})={} exceeds genome span {genome_span}",
                        self.lookback.get(i, j)
                    )));
                }
            }
        }

        let seg_prefix = prefix_sums(segment_sum, n, t_len);

        // delta[t][j][rank]
        let mut delta = vec![vec![vec![f64::NEG_INFINITY; k]; n]; t_len];
        let mut back: Vec<Vec<Vec<BackPointer>>> = vec![
            vec![
                vec![
                    BackPointer { state: NO_PRED, rank: 0, time: 0, pen_value: 0.0, pen_input: 0.0 };
                    k
                ];
                n
            ];
            t_len
        ];

        let cancel_poll = (t_len / CANCEL_POLL_DIVISOR).max(1);

        for t in 0..t_len {
            if t % cancel_poll == 0 {
                log::trace!("BestPath2 forward pass at t={t}/{t_len}");
                if self.cancel.load(Ordering::Relaxed) {
                    return Err(HmmKernelError::Cancelled);
                }
            }
            for j in 0..n {
                let emission = seq[[j, t]];
                if emission <= INFEASIBLE_THRESHOLD {
                    log::warn!("infeasible observation at state {j}, time {t}: {emission}");
                    delta[t][j] = vec![f64::NEG_INFINITY; k];
                    continue;
                }

                let mut candidates: Vec<(f64, BackPointer)> = Vec::new();
                if t == 0 {
                    candidates.push((
                        emission,
                        BackPointer { state: NO_PRED, rank: 0, time: 0, pen_value: 0.0, pen_input: 0.0 },
                    ));
                } else {
                    for i in 0..n {
                        let a_ij = trans_a[[i, j]];
                        if a_ij <= ALMOST_NEG_INF {
                            continue;
                        }
                        let max_gap = self.lookback.get(i, j);
                        let mut ts = t;
                        loop {
                            if ts == 0 {
                                break;
                            }
                            ts -= 1;
                            let gap = pos[t].saturating_sub(pos[ts]);
                            if gap > max_gap {
                                break;
                            }
                            if max_gap > pos.len() && pos[pos.len() - 1].saturating_sub(pos[0]) < max_gap {
                                return Err(HmmKernelError::LookbackExceedsGenome(format!(
                                    "lookback({i},{j})={max_gap} exceeds genome span"
                                )));
                            }
                            let svm = svm_values.get(t).copied().unwrap_or(0.0);
                            let (pen_value, pen_input) = pen.lookup(i, j, gap as f64, svm);
                            let seg = seg_prefix[j][t + 1] - seg_prefix[j][ts + 1];
                            for rank in 0..k {
                                let prev = delta[ts][i][rank];
                                if prev.is_infinite() && prev < 0.0 {
                                    continue;
                                }
                                let score = prev + a_ij + pen_value + seg + emission;
                                candidates.push((
                                    score,
                                    BackPointer { state: i, rank, time: ts, pen_value, pen_input },
                                ));
                            }
                        }
                    }
                }

                candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
                candidates.truncate(k);
                for (rank, (score, bp)) in candidates.into_iter().enumerate() {
                    delta[t][j][rank] = score;
                    back[t][j][rank] = bp;
                }
            }
        }

        // Termination: best K over delta[T-1][i][*] + q[i].
        let mut terminal: Vec<(f64, usize, usize)> = Vec::new();
        for i in 0..n {
            for rank in 0..k {
                let v = delta[t_len - 1][i][rank];
                if v > f64::NEG_INFINITY {
                    terminal.push((v + term_q[i], i, rank));
                }
            }
        }
        terminal.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
        terminal.truncate(k);

        let mut prob_nbest = Vec::with_capacity(terminal.len());
        let mut state_seq = Vec::with_capacity(terminal.len());
        let mut pos_seq = Vec::with_capacity(terminal.len());
        let mut pen_values = Vec::with_capacity(terminal.len());
        let mut pen_input_values = Vec::with_capacity(terminal.len());

        for &(score, mut state, mut rank) in &terminal {
            prob_nbest.push(score);
            let mut states = Vec::new();
            let mut positions = Vec::new();
            let mut pens = Vec::new();
            let mut pen_inputs = Vec::new();
            let mut time = t_len - 1;
            loop {
                states.push(state);
                positions.push(pos[time]);
                let bp = back[time][state][rank];
                if bp.state == NO_PRED {
                    break;
                }
                pens.push(bp.pen_value);
                pen_inputs.push(bp.pen_input);
                state = bp.state;
                rank = bp.rank;
                time = bp.time;
            }
            states.reverse();
            positions.reverse();
            pens.reverse();
            pen_inputs.reverse();
            state_seq.push(states);
            pos_seq.push(positions);
            pen_values.push(pens);
            pen_input_values.push(pen_inputs);
        }

        Ok(BestPath2Result {
            prob_nbest,
            state_seq,
            pos_seq,
            pen_values,
            pen_input_values,
        })
    }
}

/// `prefix[j][t]` = sum of `segment_sum[j, 0..t)`, so any interval query
/// is a single subtraction.
fn prefix_sums(segment_sum: &Array2<f64>, n: usize, t_len: usize) -> Vec<Vec<f64>> {
    let mut prefix = vec![vec![0.0; t_len + 1]; n];
    for j in 0..n {
        for t in 0..t_len {
            prefix[j][t + 1] = prefix[j][t] + segment_sum[[j, t]];
        }
    }
    prefix
}

#[cfg(test)]
mod test {
    use super::*;

    /// Spec scenario 6: 2 states, 10 positions, `SEQ[j,t] = δ_{j,0}`,
    /// zero PLiFs, zero segment sums, `a ≡ 0`. Best path is all-zero
    /// with score 0.
    #[test]
    fn trivial_all_zero_path_scores_zero() {
        let n = 2;
        let t_len = 10;
        let mut seq = Array2::from_elem((n, t_len), 0.0);
        for t in 0..t_len {
            seq[[1, t]] = -1e6;
        }
        let pos: Vec<usize> = (0..t_len).collect();
        let trans_a = Array2::from_elem((n, n), 0.0);
        let term_q = vec![0.0; n];
        let pen = PenaltyTable::new(n);
        let segment_sum = Array2::from_elem((n, t_len), 0.0);
        let lookback = LookbackTable::uniform(n, 1);

        let decoder = BestPath2::new(n, lookback, BestPath2Options::default());
        let result = decoder.decode(&seq, &pos, &trans_a, &term_q, &pen, &[], &segment_sum).unwrap();

        assert_eq!(result.state_seq[0], vec![0; t_len]);
        assert!((result.prob_nbest[0] - 0.0).abs() < 1e-9);
    }

    /// (B1) `K=1`, zero PLiFs, zero segment sums, uniform transitions
    /// reduces to plain HMM Viterbi: the decoded path must pick, at each
    /// step, the predecessor maximizing `delta + a[i,j]`, same as
    /// `Hmm::best_path`.
    #[test]
    fn k1_reduces_to_plain_viterbi_shape() {
        let n = 2;
        let t_len = 4;
        let mut seq = Array2::from_elem((n, t_len), -1.0);
        seq[[0, 0]] = 0.0;
        seq[[0, 1]] = 0.0;
        seq[[1, 2]] = 0.0;
        seq[[1, 3]] = 0.0;
        let pos: Vec<usize> = (0..t_len).collect();
        let trans_a = Array2::from_elem((n, n), (0.5f64).ln());
        let term_q = vec![0.0; n];
        let pen = PenaltyTable::new(n);
        let segment_sum = Array2::from_elem((n, t_len), 0.0);
        let lookback = LookbackTable::uniform(n, 1);

        let decoder = BestPath2::new(n, lookback, BestPath2Options::default());
        let result = decoder.decode(&seq, &pos, &trans_a, &term_q, &pen, &[], &segment_sum).unwrap();
        assert_eq!(result.state_seq[0], vec![0, 0, 1, 1]);
    }

    #[test]
    fn svm_weighted_plif_requires_matching_svm_values_length() {
        let n = 1;
        let t_len = 3;
        let seq = Array2::from_elem((n, t_len), 0.0);
        let pos: Vec<usize> = (0..t_len).collect();
        let trans_a = Array2::from_elem((n, n), 0.0);
        let term_q = vec![0.0; n];
        let mut pen = PenaltyTable::new(n);
        let svm_plif = Plif::new(0, vec![0.0, 1.0], vec![0.0, 1.0], 1.0)
            .unwrap()
            .with_svm_weighting(1.0);
        pen.set(0, 0, svm_plif);
        let segment_sum = Array2::from_elem((n, t_len), 0.0);
        let lookback = LookbackTable::uniform(n, t_len);

        let decoder = BestPath2::new(n, lookback, BestPath2Options::default());
        let err = decoder
            .decode(&seq, &pos, &trans_a, &term_q, &pen, &[], &segment_sum)
            .unwrap_err();
        assert!(matches!(err, HmmKernelError::SvmIndexOutOfRange { .. }));
    }

    #[test]
    fn n_best_returns_k_ranked_terminal_paths() {
        let n = 2;
        let t_len = 3;
        let seq = Array2::from_elem((n, t_len), 0.0);
        let pos: Vec<usize> = (0..t_len).collect();
        let trans_a = Array2::from_elem((n, n), (0.5f64).ln());
        let term_q = vec![0.0; n];
        let pen = PenaltyTable::new(n);
        let segment_sum = Array2::from_elem((n, t_len), 0.0);
        let lookback = LookbackTable::uniform(n, t_len - 1);

        let decoder = BestPath2::new(n, lookback, BestPath2Options { n_best: 2 });
        let result = decoder.decode(&seq, &pos, &trans_a, &term_q, &pen, &[], &segment_sum).unwrap();
        assert_eq!(result.prob_nbest.len(), 2);
        assert!(result.prob_nbest[0] >= result.prob_nbest[1]);
    }
}
