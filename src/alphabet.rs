//! Symbol <-> small-integer mapping and histogram validation.

use fnv::FnvHashMap;

use crate::error::{HmmKernelError, Result};

/// Reverse-complements a DNA string, delegating to the same
/// `bio::alphabets::dna::revcomp` the teacher uses for its own
/// reference-strand bookkeeping (`collapse.rs`).
pub fn revcomp_dna(seq: &str) -> String {
    String::from_utf8(bio::alphabets::dna::revcomp(seq.as_bytes())).expect("revcomp of ASCII input is ASCII")
}

/// Maps a fixed set of symbols to a dense range `0..B` and back, and keeps
/// a histogram of everything it has seen so incoming data can be
/// validated with [`Alphabet::check_alphabet`].
#[derive(Debug, Clone)]
pub struct Alphabet {
    symbols: Vec<char>,
    bin_of: FnvHashMap<char, u32>,
    histogram: FnvHashMap<char, u64>,
}

impl Alphabet {
    /// Builds an alphabet from an ordered, deduplicated symbol list. The
    /// bit width `b = ceil(log2(B))` is derived, not stored, via
    /// [`Alphabet::bit_width`].
    pub fn new(symbols: impl IntoIterator<Item = char>) -> Self {
        let symbols: Vec<char> = symbols.into_iter().collect();
        let bin_of = symbols
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i as u32))
            .collect();
        Self {
            symbols,
            bin_of,
            histogram: FnvHashMap::default(),
        }
    }

    /// The canonical four-letter DNA alphabet `{A, C, G, T}`.
    pub fn dna() -> Self {
        Self::new(['A', 'C', 'G', 'T'])
    }

    /// DNA plus the ambiguity code `N`.
    pub fn dna_with_n() -> Self {
        Self::new(['A', 'C', 'G', 'T', 'N'])
    }

    /// `B`, the alphabet size.
    pub fn size(&self) -> usize {
        self.symbols.len()
    }

    /// `b = ceil(log2(B))`.
    pub fn bit_width(&self) -> u32 {
        let b = self.size() as u32;
        if b <= 1 {
            0
        } else {
            u32::BITS - (b - 1).leading_zeros()
        }
    }

    /// `bin(c) in 0..B`, or `None` if `c` is not in the alphabet.
    pub fn bin(&self, c: char) -> Option<u32> {
        self.bin_of.get(&c).copied()
    }

    /// The inverse of [`Alphabet::bin`].
    pub fn unbin(&self, k: u32) -> Option<char> {
        self.symbols.get(k as usize).copied()
    }

    /// Records every symbol of `seq` in the running histogram.
    pub fn add_to_histogram(&mut self, seq: &str) {
        for c in seq.chars() {
            *self.histogram.entry(c).or_insert(0) += 1;
        }
    }

    /// Fails with [`HmmKernelError::UnknownSymbol`] if any histogram entry
    /// was never declared in this alphabet.
    pub fn check_alphabet(&self) -> Result<()> {
        for &c in self.histogram.keys() {
            if !self.bin_of.contains_key(&c) {
                return Err(HmmKernelError::UnknownSymbol(c));
            }
        }
        Ok(())
    }

    /// Remaps a string to its binary-coded symbol vector, failing on the
    /// first unknown symbol. Used by both the HMM training preprocessor
    /// and the kernels.
    pub fn remap_to_bin(&self, seq: &str) -> Result<Vec<u32>> {
        seq.chars()
            .map(|c| self.bin(c).ok_or(HmmKernelError::UnknownSymbol(c)))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bin_roundtrip() {
        let alpha = Alphabet::dna();
        for c in ['A', 'C', 'G', 'T'] {
            let k = alpha.bin(c).unwrap();
            assert_eq!(alpha.unbin(k), Some(c));
        }
        assert_eq!(alpha.bin('N'), None);
    }

    #[test]
    fn bit_width_for_four_symbols() {
        assert_eq!(Alphabet::dna().bit_width(), 2);
        assert_eq!(Alphabet::dna_with_n().bit_width(), 3);
    }

    #[test]
    fn histogram_catches_unknown_symbol() {
        let mut alpha = Alphabet::dna();
        alpha.add_to_histogram("ACGT");
        assert!(alpha.check_alphabet().is_ok());
        alpha.add_to_histogram("ACGTN");
        assert!(matches!(
            alpha.check_alphabet(),
            Err(HmmKernelError::UnknownSymbol('N'))
        ));
    }

    #[test]
    fn remap_to_bin_rejects_unknown() {
        let alpha = Alphabet::dna();
        assert_eq!(alpha.remap_to_bin("ACGT").unwrap(), vec![0, 1, 2, 3]);
        assert!(alpha.remap_to_bin("ACGN").is_err());
    }

    #[test]
    fn revcomp_dna_complements_and_reverses() {
        assert_eq!(revcomp_dna("ACGT"), "ACGT");
        assert_eq!(revcomp_dna("AAGG"), "CCTT");
    }
}
