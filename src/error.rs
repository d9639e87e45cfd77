//! Error kinds shared by the HMM engine, the trie, the WD/WDS kernels and
//! the `BestPath2` decoder.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HmmKernelError {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("unknown symbol in alphabet histogram: {0:?}")]
    UnknownSymbol(char),

    #[error("sequence length {length} exceeds number of states {states}")]
    LengthExceedsStates { length: usize, states: usize },

    #[error("trie-based optimization requested with max_mismatch > 0")]
    MismatchUnsupportedHere,

    #[error("infeasible observation SEQ[{state},{time}] = {value} <= -1e20")]
    InfeasibleObservation {
        state: usize,
        time: usize,
        value: f64,
    },

    #[error("numeric underflow: total mass below ALMOST_NEG_INF/2 after renormalization")]
    NumericUnderflow,

    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed input at line {line}: {msg}")]
    IoMalformed { line: usize, msg: String },

    #[error("lookback window exceeds genome bounds: {0}")]
    LookbackExceedsGenome(String),

    #[error("svm weight index {index} out of range (len {len})")]
    SvmIndexOutOfRange { index: usize, len: usize },

    #[error("window larger than max sequence length: {window} > {max_len}")]
    WindowTooLarge { window: usize, max_len: usize },

    #[error("anchor position {position} out of range for sequence of length {len}")]
    WindowOutOfRange { position: usize, len: usize },

    #[error("training-constraint index {0} out of range")]
    IndexOutOfRange(i64),

    #[error("sequences have unequal length: {lhs} vs {rhs}")]
    UnequalLength { lhs: usize, rhs: usize },
}

pub type Result<T> = std::result::Result<T, HmmKernelError>;
