use lazy_static::lazy_static;
use regex::Regex;

use crate::types::Algorithm;

/// Finder-output pattern for one algorithm.
///
/// Patterns run against text with every whitespace character removed, so the
/// tool vocabulary appears squashed together ("FOUNDPOSSIBLE...").
pub struct FinderPattern {
    pub algorithm: Algorithm,
    pub regex: Regex,
    /// Capture group holding the hex offset
    pub offset_group: usize,
    /// Capture group holding the key size in bits, if the tool reports one
    pub size_group: Option<usize>,
}

lazy_static! {
    pub static ref FINDER_PATTERNS: Vec<FinderPattern> = {
        let patterns = vec![
            // aeskeyfind -v: "FOUND POSSIBLE 128-BIT KEY AT BYTE 1a2b KEY: ..."
            (Algorithm::Aes, r"FOUNDPOSSIBLE(128|256)-BITKEYATBYTE([0-9A-Fa-f]+)KEY", 2, Some(1)),
            // rsakeyfind: "FOUND PRIVATE KEY AT 1a2b version = ..."
            (Algorithm::Rsa, r"FOUNDPRIVATEKEYAT([0-9A-Fa-f]+)version", 1, None),
            // interrogate -a serpent: "Found (probable) SERPENT key at offset 1a2b:"
            (Algorithm::Serpent, r"Found\(probable\)SERPENTkeyatoffset([0-9A-Fa-f]+):", 1, None),
            // interrogate -a twofish: "Twofish key found at 1a2b."
            (Algorithm::Twofish, r"Twofishkeyfoundat([0-9A-Fa-f]+)\.", 1, None),
        ];

        patterns
            .into_iter()
            .map(|(algorithm, pattern, offset_group, size_group)| FinderPattern {
                algorithm,
                regex: Regex::new(pattern).expect("Invalid finder pattern"),
                offset_group,
                size_group,
            })
            .collect()
    };
}

/// The pattern table entry for `algorithm`
pub fn pattern_for(algorithm: Algorithm) -> &'static FinderPattern {
    // Table rows follow the enum declaration order
    &FINDER_PATTERNS[algorithm as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_algorithm_has_a_pattern() {
        for algorithm in Algorithm::ALL {
            assert_eq!(pattern_for(algorithm).algorithm, algorithm);
        }
        assert_eq!(FINDER_PATTERNS.len(), Algorithm::ALL.len());
    }
}
