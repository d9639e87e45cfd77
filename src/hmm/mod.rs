//! Discrete HMM engine: forward/backward, Viterbi, Baum-Welch, derivatives,
//! random/defined initialization, sparse transitions.

mod backward;
mod baum_welch;
mod derivative;
pub mod derivative_dump;
mod forward;
mod io;
mod viterbi;

pub use derivative_dump::{DerivativeBlock, DumpKind};
pub use io::{ConstraintFile, ModelFile};

use ndarray::Array2;

use crate::{
    error::{HmmKernelError, Result},
    logmath::{logadd, ALMOST_NEG_INF},
    sequence_store::StringStore,
};

/// Forward/backward score table for one sequence, `T x N`, plus the
/// bookkeeping needed for it (`updated` bit, cached marginal sum).
#[derive(Debug, Clone)]
pub(crate) struct AlphaBetaCache {
    pub table: Array2<f64>,
    pub updated: bool,
    pub sum: f64,
}

impl AlphaBetaCache {
    fn new(t: usize, n: usize) -> Self {
        Self {
            table: Array2::from_elem((t, n), f64::NEG_INFINITY),
            updated: false,
            sum: f64::NEG_INFINITY,
        }
    }
}

/// Learnable vs. constant position lists for one Baum-Welch parameter
/// block, kept sorted by first key (HMM constraint model).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Constraints {
    pub learn_a: Vec<(usize, usize)>,
    pub const_a: Vec<(usize, usize, f64)>,
    pub learn_b: Vec<(usize, usize)>,
    pub const_b: Vec<(usize, usize, f64)>,
    pub learn_p: Vec<usize>,
    pub const_p: Vec<(usize, f64)>,
    pub learn_q: Vec<usize>,
    pub const_q: Vec<(usize, f64)>,
}

impl Constraints {
    pub fn sort(&mut self) {
        self.learn_a.sort_unstable();
        self.const_a.sort_unstable_by_key(|&(i, j, _)| (i, j));
        self.learn_b.sort_unstable();
        self.const_b.sort_unstable_by_key(|&(i, j, _)| (i, j));
        self.learn_p.sort_unstable();
        self.const_p.sort_unstable_by_key(|&(i, _)| i);
        self.learn_q.sort_unstable();
        self.const_q.sort_unstable_by_key(|&(i, _)| i);
    }
}

/// Options controlling optional HMM behavior, following the teacher's
/// `Options` builder idiom (`score_model::Options`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HmmOptions {
    pub pseudo: f64,
    /// Enables the alternate, non-sequence-ordered reduction fast path.
    /// Disabled by default; when enabled, results must stay within 1e-9
    /// of the canonical path (see `forward.rs`'s cross-check test).
    pub fast_forward: bool,
    pub num_parallel: usize,
}

impl Default for HmmOptions {
    fn default() -> Self {
        Self {
            pseudo: 1e-10,
            fast_forward: false,
            num_parallel: 1,
        }
    }
}

impl HmmOptions {
    pub fn pseudo(&mut self, v: f64) -> &mut Self {
        self.pseudo = v;
        self
    }
    pub fn fast_forward(&mut self, v: bool) -> &mut Self {
        self.fast_forward = v;
        self
    }
    /// Sets the Baum-Welch worker count; rejects `0` with `BadArgument`
    /// (spec §7: `num_parallel <= 0`).
    pub fn num_parallel(&mut self, v: usize) -> Result<&mut Self> {
        if v == 0 {
            return Err(HmmKernelError::BadArgument("num_parallel must be positive".into()));
        }
        self.num_parallel = v;
        Ok(self)
    }
    /// Sizes `num_parallel` to the host's logical core count, matching
    /// the teacher's `num_cpus::get()` default-thread-count pattern
    /// (`src/bin/cawlr.rs`).
    pub fn auto_parallel(&mut self) -> &mut Self {
        self.num_parallel = num_cpus::get().max(1);
        self
    }
}

/// A discrete hidden Markov model over `n` states and `m` observation
/// symbols (HMM parameters).
pub struct Hmm {
    pub(crate) n: usize,
    pub(crate) m: usize,
    pub(crate) p: Vec<f64>,
    pub(crate) q: Vec<f64>,
    pub(crate) a: Array2<f64>,
    pub(crate) b: Array2<f64>,
    pub(crate) is_log: bool,
    pub(crate) options: HmmOptions,
    pub(crate) constraints: Constraints,

    pred: Option<Vec<Vec<(usize, f64)>>>,
    succ: Option<Vec<Vec<(usize, f64)>>>,

    pub(crate) observations: Option<StringStore>,
    pub(crate) alpha_cache: Vec<Option<AlphaBetaCache>>,
    pub(crate) beta_cache: Vec<Option<AlphaBetaCache>>,
    pub(crate) psi: Vec<Option<Array2<usize>>>,
    pub(crate) path: Vec<Option<Vec<usize>>>,
    pub(crate) path_prob: Vec<Option<f64>>,
    all_path_prob: Option<f64>,
}

impl Hmm {
    /// (i) Empty model with uniform-ish placeholder parameters (probability
    /// space, not yet normalized).
    pub fn new(n: usize, m: usize) -> Self {
        Self {
            n,
            m,
            p: vec![0.0; n],
            q: vec![0.0; n],
            a: Array2::zeros((n, n)),
            b: Array2::zeros((n, m)),
            is_log: false,
            options: HmmOptions::default(),
            constraints: Constraints::default(),
            pred: None,
            succ: None,
            observations: None,
            alpha_cache: Vec::new(),
            beta_cache: Vec::new(),
            psi: Vec::new(),
            path: Vec::new(),
            path_prob: Vec::new(),
            all_path_prob: None,
        }
    }

    /// (ii) New model sharing nothing but `N`/`M` with `other`; observations
    /// are bound separately.
    pub fn like(other: &Hmm) -> Self {
        Self::new(other.n, other.m)
    }

    /// Random initialization: every row of `p`, and every `(a[i,*],
    /// q[i])` and `b[i,*])` group, is drawn uniformly and renormalized to
    /// sum to one. Deterministic for a given `seed`, matching the
    /// teacher's `SmallRng::seed_from_u64` fixture pattern
    /// (`score_model.rs`).
    pub fn random(n: usize, m: usize, seed: u64) -> Self {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let mut p: Vec<f64> = (0..n).map(|_| rng.gen::<f64>() + 1e-6).collect();
        normalize_simplex(&mut p);

        let mut q = vec![0.0; n];
        let mut a = Array2::zeros((n, n));
        for i in 0..n {
            let mut row: Vec<f64> = (0..=n).map(|_| rng.gen::<f64>() + 1e-6).collect();
            normalize_simplex(&mut row);
            q[i] = row[n];
            for j in 0..n {
                a[[i, j]] = row[j];
            }
        }

        let mut b = Array2::zeros((n, m));
        for i in 0..n {
            let mut row: Vec<f64> = (0..m).map(|_| rng.gen::<f64>() + 1e-6).collect();
            normalize_simplex(&mut row);
            for o in 0..m {
                b[[i, o]] = row[o];
            }
        }

        Self::from_dense(p, q, a, b).expect("shapes constructed consistently above")
    }

    /// (iii) From raw dense matrices, already in probability space.
    pub fn from_dense(p: Vec<f64>, q: Vec<f64>, a: Array2<f64>, b: Array2<f64>) -> Result<Self> {
        let n = p.len();
        let m = b.ncols();
        if q.len() != n || a.shape() != [n, n] || b.nrows() != n {
            return Err(HmmKernelError::DimensionMismatch(
                "p/q/a/b shapes disagree on N".into(),
            ));
        }
        let mut hmm = Self::new(n, m);
        hmm.p = p;
        hmm.q = q;
        hmm.a = a;
        hmm.b = b;
        Ok(hmm)
    }

    /// (iv) From a sparse transition list `a_trans`, rows `(to, from, val)`
    /// grouped by `from`. Missing pairs default to probability zero.
    pub fn from_sparse(
        p: Vec<f64>,
        q: Vec<f64>,
        n: usize,
        a_trans: &[(usize, usize, f64)],
    ) -> Result<Self> {
        let mut a = Array2::zeros((n, n));
        for &(to, from, val) in a_trans {
            if to >= n || from >= n {
                return Err(HmmKernelError::BadArgument(format!(
                    "sparse transition ({from},{to}) out of range for N={n}"
                )));
            }
            a[[from, to]] = val;
        }
        let m = 1;
        let b = Array2::zeros((n, m));
        Self::from_dense(p, q, a, b)
    }

    pub fn n_states(&self) -> usize {
        self.n
    }

    pub fn n_symbols(&self) -> usize {
        self.m
    }

    pub fn is_log(&self) -> bool {
        self.is_log
    }

    pub fn get_p(&self, i: usize) -> f64 {
        self.p[i]
    }
    pub fn get_q(&self, i: usize) -> f64 {
        self.q[i]
    }
    pub fn get_a(&self, i: usize, j: usize) -> f64 {
        self.a[[i, j]]
    }
    pub fn get_b(&self, i: usize, o: usize) -> f64 {
        self.b[[i, o]]
    }

    pub fn set_p(&mut self, i: usize, v: f64) {
        self.p[i] = v;
    }
    pub fn set_q(&mut self, i: usize, v: f64) {
        self.q[i] = v;
    }
    pub fn set_a(&mut self, i: usize, j: usize, v: f64) {
        self.a[[i, j]] = v;
        self.invalidate_transition_lists();
    }
    pub fn set_b(&mut self, i: usize, o: usize, v: f64) {
        self.b[[i, o]] = v;
    }

    fn invalidate_transition_lists(&mut self) {
        self.pred = None;
        self.succ = None;
    }

    /// `pred(j) = {(i, a[i,j]) : a[i,j] > NEG_INF}`, rebuilt lazily after
    /// any `set_a` call.
    pub(crate) fn pred(&mut self, j: usize) -> &[(usize, f64)] {
        self.ensure_transition_lists();
        &self.pred.as_ref().unwrap()[j]
    }

    pub(crate) fn succ(&mut self, i: usize) -> &[(usize, f64)] {
        self.ensure_transition_lists();
        &self.succ.as_ref().unwrap()[i]
    }

    fn ensure_transition_lists(&mut self) {
        if self.pred.is_some() {
            return;
        }
        let floor = if self.is_log {
            ALMOST_NEG_INF
        } else {
            0.0
        };
        let mut pred = vec![Vec::new(); self.n];
        let mut succ = vec![Vec::new(); self.n];
        for i in 0..self.n {
            for j in 0..self.n {
                let v = self.a[[i, j]];
                if v > floor {
                    pred[j].push((i, v));
                    succ[i].push((j, v));
                }
            }
        }
        self.pred = Some(pred);
        self.succ = Some(succ);
    }

    /// Converts dense `p`, `q`, `a`, `b` to log space in place. No-op if
    /// already in log space.
    pub fn convert_to_log(&mut self) {
        if self.is_log {
            return;
        }
        for v in self.p.iter_mut().chain(self.q.iter_mut()) {
            *v = v.ln();
        }
        self.a.mapv_inplace(f64::ln);
        self.b.mapv_inplace(f64::ln);
        self.is_log = true;
        self.invalidate_transition_lists();
    }

    /// Binds an observation sequence set. When `share` is `Some`, this
    /// model's caches alias the sharer's tables (zero-copy reuse);
    /// otherwise fresh `T_max x N` tables are allocated. Rebinding always
    /// invalidates caches.
    pub fn set_observations(&mut self, obs: StringStore, share: Option<&Hmm>) {
        let num = obs.num();
        self.observations = Some(obs);
        self.invalidate_caches();
        if let Some(other) = share {
            self.alpha_cache = other.alpha_cache.clone();
            self.beta_cache = other.beta_cache.clone();
            self.psi = other.psi.clone();
            self.path = other.path.clone();
            self.path_prob = other.path_prob.clone();
        } else {
            self.alpha_cache = vec![None; num];
            self.beta_cache = vec![None; num];
            self.psi = vec![None; num];
            self.path = vec![None; num];
            self.path_prob = vec![None; num];
        }
    }

    pub(crate) fn invalidate_caches(&mut self) {
        for c in self.alpha_cache.iter_mut().flatten() {
            c.updated = false;
        }
        for c in self.beta_cache.iter_mut().flatten() {
            c.updated = false;
        }
        self.path = vec![None; self.path.len()];
        self.path_prob = vec![None; self.path_prob.len()];
        self.all_path_prob = None;
    }

    fn ensure_alpha_cache(&mut self, d: usize) -> &mut AlphaBetaCache {
        let t = self.observations.as_ref().unwrap().len(d);
        self.alpha_cache[d].get_or_insert_with(|| AlphaBetaCache::new(t, self.n))
    }

    fn ensure_beta_cache(&mut self, d: usize) -> &mut AlphaBetaCache {
        let t = self.observations.as_ref().unwrap().len(d);
        self.beta_cache[d].get_or_insert_with(|| AlphaBetaCache::new(t, self.n))
    }

    /// `normalize(keep_dead)`: recomputes `logsumexp` per row and shifts so
    /// every row sums to 1 (probability space) or 0 (log space). Dead rows
    /// (`sum_a <= ALMOST_NEG_INF/N`) are left untouched when `keep_dead` is
    /// true, else reinitialized to uniform over successors.
    pub fn normalize(&mut self, keep_dead: bool) {
        if !self.is_log {
            self.convert_to_log();
        }
        let mut sum_p = f64::NEG_INFINITY;
        for i in 0..self.n {
            sum_p = logadd(sum_p, self.p[i]);

            let mut sum_a = self.q[i];
            for j in 0..self.n {
                sum_a = logadd(sum_a, self.a[[i, j]]);
            }

            let dead = sum_a <= ALMOST_NEG_INF / self.n as f64;
            if !dead || !keep_dead {
                if dead {
                    log::warn!("state {i} has no surviving outgoing mass, reinitializing to uniform");
                    let uniform = -((self.n + 1) as f64).ln();
                    for j in 0..self.n {
                        self.a[[i, j]] = uniform;
                    }
                    self.q[i] = uniform;
                } else {
                    for j in 0..self.n {
                        self.a[[i, j]] -= sum_a;
                    }
                    self.q[i] -= sum_a;
                }
            }

            let mut sum_b = f64::NEG_INFINITY;
            for o in 0..self.m {
                sum_b = logadd(sum_b, self.b[[i, o]]);
            }
            for o in 0..self.m {
                self.b[[i, o]] -= sum_b;
            }
        }
        for i in 0..self.n {
            self.p[i] -= sum_p;
        }
        self.invalidate_transition_lists();
        self.invalidate_caches();
    }

    /// Floors every log-space parameter at `threshold` (below which it is
    /// treated as impossible) without renormalizing; used internally by
    /// [`Hmm::linear_train`] to avoid zero emissions.
    pub fn chop(&mut self, threshold: f64) {
        for v in self.p.iter_mut().chain(self.q.iter_mut()) {
            if *v < threshold {
                *v = threshold;
            }
        }
        self.a.mapv_inplace(|v| if v < threshold { threshold } else { v });
        self.b.mapv_inplace(|v| if v < threshold { threshold } else { v });
        self.invalidate_transition_lists();
    }

    /// Grows `N` by `extra`, appending rows/columns filled with
    /// `default_value` (log space).
    pub fn add_states(&mut self, extra: usize, default_value: f64) {
        let new_n = self.n + extra;
        let mut new_a = Array2::from_elem((new_n, new_n), default_value);
        let mut new_b = Array2::from_elem((new_n, self.m), default_value);
        for i in 0..self.n {
            for j in 0..self.n {
                new_a[[i, j]] = self.a[[i, j]];
            }
            for o in 0..self.m {
                new_b[[i, o]] = self.b[[i, o]];
            }
        }
        self.p.resize(new_n, default_value);
        self.q.resize(new_n, default_value);
        self.a = new_a;
        self.b = new_b;
        self.n = new_n;
        self.invalidate_transition_lists();
    }

    /// Concatenates `self` and `other` by block-embedding their transition
    /// matrices and wiring `q_i^self * p_j^other` into the inter-block
    /// transitions. Caller must follow with `normalize`.
    pub fn append(&mut self, other: &Hmm) -> Result<()> {
        if self.m != other.m {
            return Err(HmmKernelError::DimensionMismatch(
                "append requires matching M".into(),
            ));
        }
        if !self.is_log {
            self.convert_to_log();
        }
        let mut other = Hmm::from_dense(other.p.clone(), other.q.clone(), other.a.clone(), other.b.clone())?;
        if !other.is_log {
            other.convert_to_log();
        }

        let old_n = self.n;
        let total_n = old_n + other.n;
        let mut n_p = vec![f64::NEG_INFINITY; total_n];
        let mut n_q = vec![f64::NEG_INFINITY; total_n];
        let mut n_a = Array2::from_elem((total_n, total_n), f64::NEG_INFINITY);
        let mut n_b = Array2::from_elem((total_n, self.m), f64::NEG_INFINITY);

        for i in 0..old_n {
            n_p[i] = self.p[i];
            for j in 0..old_n {
                n_a[[i, j]] = self.a[[i, j]];
            }
            for o in 0..self.m {
                n_b[[i, o]] = self.b[[i, o]];
            }
        }
        for i in 0..other.n {
            n_q[old_n + i] = other.q[i];
            for j in 0..other.n {
                n_a[[old_n + i, old_n + j]] = other.a[[i, j]];
            }
            for o in 0..self.m {
                n_b[[old_n + i, o]] = other.b[[i, o]];
            }
        }
        for i in 0..old_n {
            for j in 0..other.n {
                n_a[[i, old_n + j]] = self.q[i] + other.p[j];
            }
        }

        self.n = total_n;
        self.p = n_p;
        self.q = n_q;
        self.a = n_a;
        self.b = n_b;
        self.invalidate_transition_lists();
        self.invalidate_caches();
        self.alpha_cache.clear();
        self.beta_cache.clear();
        self.psi.clear();
        self.path.clear();
        self.path_prob.clear();
        self.observations = None;
        Ok(())
    }

    /// Direct maximum-likelihood training for a left-to-right chain
    /// topology: sequence `d`'s symbol at time `t` is assigned to state
    /// `t` (or `N-1-...` from the end when `right_align`), `a[i,i+1] = 1`,
    /// emissions are position-wise symbol histograms plus pseudocounts.
    /// Fails with `LengthExceedsStates` if any sequence is longer than
    /// `N`.
    pub fn linear_train(&mut self, right_align: bool) -> Result<()> {
        let obs = self
            .observations
            .as_ref()
            .ok_or_else(|| HmmKernelError::BadArgument("no observations bound".into()))?;
        let n = self.n;
        let m = self.m;
        let pseudo = self.options.pseudo;

        let mut counts = Array2::from_elem((n, m), pseudo);
        let mut p = vec![pseudo; n];
        p[0] = 1.0;

        for d in 0..obs.num() {
            let seq = obs.get(d);
            if seq.len() > n {
                return Err(HmmKernelError::LengthExceedsStates {
                    length: seq.len(),
                    states: n,
                });
            }
            let offset = if right_align { n - seq.len() } else { 0 };
            for (t, &sym) in seq.iter().enumerate() {
                counts[[offset + t, sym as usize]] += 1.0;
            }
        }

        let mut a = Array2::zeros((n, n));
        let mut q = vec![0.0; n];
        for i in 0..n.saturating_sub(1) {
            a[[i, i + 1]] = 1.0;
        }
        q[n - 1] = 1.0;

        let mut b = Array2::zeros((n, m));
        for i in 0..n {
            let row_sum: f64 = counts.row(i).sum();
            for o in 0..m {
                b[[i, o]] = counts[[i, o]] / row_sum;
            }
        }

        let p_sum: f64 = p.iter().sum();
        for v in p.iter_mut() {
            *v /= p_sum;
        }

        self.p = p;
        self.q = q;
        self.a = a;
        self.b = b;
        self.is_log = false;
        self.invalidate_transition_lists();
        self.invalidate_caches();
        Ok(())
    }
}

fn normalize_simplex(v: &mut [f64]) {
    let sum: f64 = v.iter().sum();
    for x in v.iter_mut() {
        *x /= sum;
    }
}
