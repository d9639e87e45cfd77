//! Weighted-Degree kernel over fixed-length sequences.

use itertools::Itertools;
use ndarray::Array2;

use crate::error::{HmmKernelError, Result};
use crate::sequence_store::StringStore;
use crate::trie::Trie;

/// Options controlling the kernel's compute strategy, following the
/// teacher's `Options` builder idiom.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WdKernelOptions {
    pub max_mismatch: usize,
    pub use_normalization: bool,
    pub block_computation: bool,
    pub positional: bool,
}

impl Default for WdKernelOptions {
    fn default() -> Self {
        Self {
            max_mismatch: 0,
            use_normalization: true,
            block_computation: false,
            positional: false,
        }
    }
}

impl WdKernelOptions {
    pub fn max_mismatch(&mut self, v: usize) -> &mut Self {
        self.max_mismatch = v;
        self
    }
    pub fn use_normalization(&mut self, v: bool) -> &mut Self {
        self.use_normalization = v;
        self
    }
    pub fn block_computation(&mut self, v: bool) -> &mut Self {
        self.block_computation = v;
        self
    }
    pub fn positional(&mut self, v: bool) -> &mut Self {
        self.positional = v;
        self
    }
}

/// `K(x,y) = Σ_i Σ_{j<degree} w[j] · 1[x[i..i+j+1] = y[i..i+j+1]]`,
/// with optional position-wise weights, mismatch tolerance, block-mode
/// evaluation, `√(K(x,x)K(y,y))` normalization and a trie-backed linadd
/// path for scoring many sequences against a fixed weighted
/// support-vector set.
pub struct WdKernel {
    degree: usize,
    alphabet_size: usize,
    /// Flat `degree * (max_mismatch + 1)` table: `weights[m*degree + j]`
    /// is the weight for `j` matches with `m` mismatches charged.
    weights: Vec<f64>,
    options: WdKernelOptions,
    diag_cache: Vec<Option<f64>>,
    trie: Option<Trie>,
}

impl WdKernel {
    pub fn new(degree: usize, alphabet_size: usize, options: WdKernelOptions) -> Result<Self> {
        if degree == 0 {
            return Err(HmmKernelError::BadArgument("degree must be positive".into()));
        }
        let weights = default_weights(degree, options.max_mismatch);
        Ok(Self {
            degree,
            alphabet_size,
            weights,
            options,
            diag_cache: Vec::new(),
            trie: None,
        })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn set_weights(&mut self, weights: Vec<f64>) -> Result<()> {
        let expected = self.degree * (self.options.max_mismatch + 1);
        if weights.len() != expected {
            return Err(HmmKernelError::DimensionMismatch(format!(
                "expected {expected} weights, got {}",
                weights.len()
            )));
        }
        self.weights = weights;
        Ok(())
    }

    fn check_equal_length(&self, x: &[u32], y: &[u32]) -> Result<()> {
        if x.len() != y.len() {
            return Err(HmmKernelError::UnequalLength { lhs: x.len(), rhs: y.len() });
        }
        Ok(())
    }

    /// Dispatches to the block, mismatch or plain path per
    /// [`WdKernelOptions`].
    pub fn compute(&self, x: &[u32], y: &[u32]) -> Result<f64> {
        self.check_equal_length(x, y)?;
        if self.options.max_mismatch > 0 {
            self.compute_with_mismatch(x, y)
        } else if self.options.block_computation {
            self.compute_using_block(x, y)
        } else {
            self.compute_without_mismatch(x, y)
        }
    }

    /// Plain `O(L·degree)` inner loop: runs of matching characters credit
    /// `w[0..matched)`.
    pub fn compute_without_mismatch(&self, x: &[u32], y: &[u32]) -> f64 {
        let l = x.len();
        let mut sum = 0.0;
        for i in 0..l {
            let max_j = self.degree.min(l - i);
            let mut matched = 0usize;
            for k in 0..max_j {
                if x[i + k] == y[i + k] {
                    matched += 1;
                } else {
                    break;
                }
            }
            for j in 0..matched {
                sum += self.weights[j];
            }
        }
        sum
    }

    /// As [`WdKernel::compute_without_mismatch`] but with up to
    /// `max_mismatch` allowed inside each window, at weight index
    /// `j + degree*m`.
    pub fn compute_with_mismatch(&self, x: &[u32], y: &[u32]) -> Result<f64> {
        let l = x.len();
        let mut sum = 0.0;
        for i in 0..l {
            let max_j = self.degree.min(l - i);
            let mut mismatches = 0usize;
            for k in 0..max_j {
                if x[i + k] != y[i + k] {
                    mismatches += 1;
                    if mismatches > self.options.max_mismatch {
                        break;
                    }
                }
                sum += self.weights[mismatches * self.degree + k];
            }
        }
        Ok(sum)
    }

    /// Run-length scan: for a maximal matching run of length `r`, the
    /// contribution telescopes to a single `block_weights[r]` lookup
    /// instead of `r` inner-loop iterations. `dedup_with_count` does the
    /// run splitting.
    pub fn compute_using_block(&self, x: &[u32], y: &[u32]) -> Result<f64> {
        self.check_equal_length(x, y)?;
        let block_weights = self.block_weights_table(x.len());
        let sum = x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| a == b)
            .dedup_with_count()
            .filter(|&(_, matched)| matched)
            .map(|(run_len, _)| block_weights[run_len])
            .sum();
        Ok(sum)
    }

    /// `block_weights[r] = Σ_{d=1..=min(degree,r)} w[d-1]·(r-d+1)`: the
    /// total credit a maximal run of length `r` contributes, folding in
    /// every window anchored inside it.
    fn block_weights_table(&self, max_len: usize) -> Vec<f64> {
        let mut table = vec![0.0; max_len + 1];
        for r in 1..=max_len {
            let mut sum = 0.0;
            for d in 1..=self.degree.min(r) {
                sum += self.weights[d - 1] * (r - d + 1) as f64;
            }
            table[r] = sum;
        }
        table
    }

    /// `K(x,x)`, cached per support-vector index when `x` comes from a
    /// [`StringStore`] (per-row norms cached on first use).
    pub fn diag(&mut self, store: &StringStore, idx: usize) -> Result<f64> {
        if idx >= self.diag_cache.len() {
            self.diag_cache.resize(idx + 1, None);
        }
        if let Some(v) = self.diag_cache[idx] {
            return Ok(v);
        }
        let v = self.compute(store.get(idx), store.get(idx))?;
        self.diag_cache[idx] = Some(v);
        Ok(v)
    }

    /// `K(x,y) / √(K(x,x)K(y,y))` when normalization is enabled, the raw
    /// value otherwise.
    pub fn normalized(&mut self, store: &StringStore, i: usize, j: usize) -> Result<f64> {
        let raw = self.compute(store.get(i), store.get(j))?;
        if !self.options.use_normalization {
            return Ok(raw);
        }
        let di = self.diag(store, i)?;
        let dj = self.diag(store, j)?;
        Ok(raw / (di * dj).sqrt())
    }

    /// Dense Gram matrix over every sequence in `store`.
    pub fn compute_matrix(&mut self, store: &StringStore) -> Result<Array2<f64>> {
        let n = store.num();
        let mut out = Array2::zeros((n, n));
        for i in 0..n {
            for j in i..n {
                let v = self.normalized(store, i, j)?;
                out[[i, j]] = v;
                out[[j, i]] = v;
            }
        }
        Ok(out)
    }

    /// Builds the linadd trie from a weighted support-vector set,
    /// scaling each `α_k` by `1/√K(x_k,x_k)` when normalization is on
    /// (Optimization (linadd)). Fails with
    /// [`HmmKernelError::MismatchUnsupportedHere`] when mismatch
    /// tolerance is active, since the trie only walks exact windows.
    pub fn init_optimization(&mut self, store: &StringStore, support_idx: &[usize], alpha: &[f64]) -> Result<()> {
        if self.options.max_mismatch > 0 {
            return Err(HmmKernelError::MismatchUnsupportedHere);
        }
        let mut trie = Trie::new(self.degree, self.alphabet_size, self.options.positional, true);
        for (&k, &a) in support_idx.iter().zip(alpha) {
            if trie.is_cancelled() {
                return Err(HmmKernelError::Cancelled);
            }
            let scale = if self.options.use_normalization {
                a / self.diag(store, k)?.sqrt()
            } else {
                a
            };
            let seq = store.get(k);
            for pos in 0..=seq.len().saturating_sub(self.degree) {
                trie.add(pos, &seq[pos..pos + self.degree], scale, &self.weights)?;
            }
        }
        self.trie = Some(trie);
        Ok(())
    }

    /// `K̂(y) = Σ_k α_k K(x_k, y)` via the trie built by
    /// [`WdKernel::init_optimization`].
    pub fn compute_optimized(&self, y: &[u32]) -> Result<f64> {
        let trie = self
            .trie
            .as_ref()
            .ok_or_else(|| HmmKernelError::BadArgument("init_optimization was not called".into()))?;
        let mut sum = 0.0;
        for pos in 0..=y.len().saturating_sub(self.degree) {
            sum += trie.query(pos, &y[pos..pos + self.degree], &self.weights);
        }
        Ok(sum)
    }

    pub fn num_subkernels(&self) -> usize {
        self.degree
    }

    pub fn subkernel_weights(&self) -> &[f64] {
        &self.weights[..self.degree]
    }

    pub fn set_subkernel_weights(&mut self, betas: &[f64]) -> Result<()> {
        if betas.len() != self.degree {
            return Err(HmmKernelError::DimensionMismatch(format!(
                "expected {} subkernel weights, got {}",
                self.degree,
                betas.len()
            )));
        }
        self.weights[..self.degree].copy_from_slice(betas);
        Ok(())
    }

    /// `Σ_j |w[j]|` per window length, the MKL-solver-facing summary
    /// used to seed subkernel weight search.
    pub fn compute_abs_weights(&self) -> Vec<f64> {
        self.weights[..self.degree].iter().map(|w| w.abs()).collect()
    }

    /// `scores[pos][kmer]`, the kernel-side analogue of the HMM's
    /// per-parameter derivatives: builds one trie per position from the
    /// weighted support-vector set and reads each back with
    /// [`Trie::scoring_traversal`]. Every window length's credit
    /// `w[0..max_degree-1]` is folded onto the single full-length k-mer
    /// the support vector actually has at that position, since the
    /// k-mer is already known exactly there is no ambiguity to resolve
    /// by spreading partial-length credit across a node's descendants.
    /// This satisfies (K4): summed over every `(pos, kmer)` cell, the
    /// table equals `Σ_k α_k · Σ_i w[0..max_degree-1](x_k at i)`.
    pub fn compute_scoring(
        &self,
        max_degree: usize,
        store: &StringStore,
        support_idx: &[usize],
        alpha: &[f64],
    ) -> Result<Array2<f64>> {
        if max_degree == 0 || max_degree > self.degree {
            return Err(HmmKernelError::BadArgument(
                "max_degree must be in 1..=degree".into(),
            ));
        }
        let num_pos = support_idx
            .iter()
            .map(|&k| store.get(k).len())
            .max()
            .unwrap_or(0)
            .saturating_sub(max_degree)
            + 1;
        let num_kmers = self.alphabet_size.pow(max_degree as u32);
        let mut scaled_weights = vec![0.0; max_degree];
        scaled_weights[max_degree - 1] = self.weights[..max_degree].iter().sum();
        let mut tries: Vec<Trie> = (0..num_pos)
            .map(|_| Trie::new(max_degree, self.alphabet_size, false, true))
            .collect();
        for (&k, &a) in support_idx.iter().zip(alpha) {
            if tries.first().is_some_and(|t| t.is_cancelled()) {
                return Err(HmmKernelError::Cancelled);
            }
            let seq = store.get(k);
            for pos in 0..=seq.len().saturating_sub(max_degree) {
                let window = &seq[pos..pos + max_degree];
                tries[pos].add(pos, window, a, &scaled_weights)?;
            }
        }
        let mut scores = Array2::zeros((num_pos, num_kmers));
        for (pos, trie) in tries.iter().enumerate() {
            let row = trie.scoring_traversal(max_degree);
            for (kmer, v) in row.into_iter().enumerate() {
                scores[[pos, kmer]] = v;
            }
        }
        Ok(scores)
    }
}

/// Default weight schedule: linearly decaying `degree - j` for the
/// exact-match block, plus a harsher decay per mismatch charged.
fn default_weights(degree: usize, max_mismatch: usize) -> Vec<f64> {
    let mut weights = Vec::with_capacity(degree * (max_mismatch + 1));
    for m in 0..=max_mismatch {
        let decay = 0.5f64.powi(m as i32);
        for j in 0..degree {
            weights.push(decay * (degree - j) as f64);
        }
    }
    weights
}
