//! Nucleotide sequence utilities.
//!
//! Sequences are fixed-length strings over the concrete alphabet `{A,C,G,T}`
//! plus the IUPAC ambiguity codes (`N`, `R`, `Y`, ...). An ambiguous position
//! stands for any of the concrete bases it covers, so two sequences are
//! *compatible* when the covered base sets intersect at every position.
//!
//! Everything downstream (edge lengths, the history DAG, the mutability
//! model) operates on aligned sequences of equal length; callers are expected
//! to have aligned their input before it reaches this crate.

use itertools::Itertools;
use primitive_types::U256;

/// The concrete nucleotide alphabet, in the fixed order used by substitution
/// tables.
pub const BASES: [char; 4] = ['A', 'C', 'G', 'T'];

/// Index of a concrete base in [BASES].
pub fn base_index(base: char) -> Option<usize> {
    BASES.iter().position(|b| *b == base)
}

/// The concrete bases covered by a (possibly ambiguous) IUPAC code.
///
/// Gap and unknown characters (`-`, `?`) are treated as fully ambiguous,
/// matching the posture of the upstream parsimony program's output.
pub fn base_options(code: char) -> &'static [char] {
    match code {
        'A' => &['A'],
        'C' => &['C'],
        'G' => &['G'],
        'T' => &['T'],
        'R' => &['A', 'G'],
        'Y' => &['C', 'T'],
        'S' => &['C', 'G'],
        'W' => &['A', 'T'],
        'K' => &['G', 'T'],
        'M' => &['A', 'C'],
        'B' => &['C', 'G', 'T'],
        'D' => &['A', 'G', 'T'],
        'H' => &['A', 'C', 'T'],
        'V' => &['A', 'C', 'G'],
        'N' | '-' | '?' => &BASES,
        _ => &[],
    }
}

/// True if any position of the sequence is not a concrete base.
pub fn is_ambiguous(sequence: &str) -> bool {
    sequence.chars().any(|c| base_options(c).len() != 1)
}

/// Hamming distance between two aligned sequences.
///
/// Panics if the sequences have different lengths; aligned input is an
/// invariant of every caller in this crate.
pub fn hamming_distance(a: &str, b: &str) -> u32 {
    assert_eq!(
        a.len(),
        b.len(),
        "hamming distance requires aligned sequences of equal length"
    );
    a.chars().zip(b.chars()).filter(|(x, y)| x != y).count() as u32
}

/// True if the covered base sets intersect at every position.
pub fn compatible(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.chars().zip(b.chars()).all(|(x, y)| {
            let opts = base_options(y);
            base_options(x).iter().any(|base| opts.contains(base))
        })
}

/// All concrete resolutions of a possibly ambiguous sequence, in
/// lexicographic order of the per-position option lists.
pub fn resolutions(sequence: &str) -> impl Iterator<Item = String> + '_ {
    sequence
        .chars()
        .map(|c| base_options(c).iter().copied())
        .multi_cartesian_product()
        .map(|chars| chars.into_iter().collect())
}

/// Number of concrete resolutions of the sequence, saturating at [U256::MAX].
pub fn resolution_count(sequence: &str) -> U256 {
    let mut count = U256::one();
    for c in sequence.chars() {
        let options = base_options(c).len();
        count = count.saturating_mul(U256::from(options.max(1)));
    }
    count
}

// -------------------------------------------------------------------------------------------------
// Disambiguation seam.

/// Strategy for resolving ambiguity codes in observed sequences.
///
/// The resolver is applied in preorder, so the parent sequence handed to
/// [Disambiguate::resolve] is itself already concrete. File-level
/// disambiguation (e.g. replaying the parsimony program's assignments) is an
/// external collaborator; this seam is what the core consumes.
pub trait Disambiguate {
    /// Produce a concrete resolution of `sequence`. `parent` is the already
    /// resolved parent sequence, or `None` at the root.
    fn resolve(&self, parent: Option<&str>, sequence: &str) -> String;
}

/// Default resolver: at each ambiguous position pick the parent's base when
/// it is covered, otherwise the first covered base.
///
/// Deterministic, and minimizes the Hamming distance to the parent among the
/// available resolutions of each position independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinDistanceDisambiguator;

impl Disambiguate for MinDistanceDisambiguator {
    fn resolve(&self, parent: Option<&str>, sequence: &str) -> String {
        sequence
            .chars()
            .enumerate()
            .map(|(i, c)| {
                let options = base_options(c);
                if options.len() == 1 {
                    return options[0];
                }
                parent
                    .and_then(|p| p.chars().nth(i))
                    .filter(|pb| options.contains(pb))
                    .unwrap_or_else(|| *options.first().unwrap_or(&'N'))
            })
            .collect()
    }
}

// -------------------------------------------------------------------------------------------------
// Unit tests.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_distance_counts_mismatches() {
        assert_eq!(hamming_distance("ACGT", "ACGT"), 0);
        assert_eq!(hamming_distance("ACGT", "ACGA"), 1);
        assert_eq!(hamming_distance("AAAA", "TTTT"), 4);
    }

    #[test]
    fn ambiguity_detection() {
        assert!(!is_ambiguous("ACGT"));
        assert!(is_ambiguous("ACNT"));
        assert!(is_ambiguous("ACRT"));
    }

    #[test]
    fn compatibility_intersects_per_position() {
        assert!(compatible("ACGT", "ACGT"));
        assert!(compatible("ACNT", "ACGT"));
        assert!(compatible("RCGT", "ACGT"));
        assert!(!compatible("RCGT", "CCGT"), "R covers A/G, not C");
        assert!(!compatible("ACG", "ACGT"), "length mismatch");
    }

    #[test]
    fn resolutions_enumerate_cartesian_product() {
        let all: Vec<String> = resolutions("AR").collect();
        assert_eq!(all, vec!["AA".to_string(), "AG".to_string()]);
        assert_eq!(resolution_count("AR"), 2.into());
        assert_eq!(resolution_count("NN"), 16.into());
    }

    #[test]
    fn min_distance_resolver_prefers_parent_base() {
        let resolver = MinDistanceDisambiguator;
        assert_eq!(resolver.resolve(Some("AGGT"), "ARGT"), "AGGT");
        assert_eq!(resolver.resolve(Some("ACGT"), "ARGT"), "AAGT");
        assert_eq!(resolver.resolve(None, "ARGT"), "AAGT");
    }
}
