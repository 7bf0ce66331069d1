//! Lexicographic range splitting for the work-stealing listing engine
//!
//! A [`RangeSplitter`] divides a half-open string interval `[start, end)`
//! into balanced sub-intervals by reading both bounds as base-|alphabet|
//! numerals. The alphabet starts from a small seed and grows whenever a
//! range introduces characters it has not seen, so split points only ever
//! use characters observed in real keys.

use std::collections::HashMap;

use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::{Error, Result};

/// Splits key ranges into balanced sub-intervals over a growing alphabet.
#[derive(Debug, Clone)]
pub struct RangeSplitter {
    alphabet: Vec<char>,
    ordinals: HashMap<char, usize>,
}

/// The shortest digit length at which the two bounds, read as numerals,
/// leave room for the requested number of split points.
#[derive(Debug, PartialEq, Eq)]
struct MinimalIntRange {
    start_int: BigUint,
    end_int: BigUint,
    min_len: usize,
}

impl Default for RangeSplitter {
    /// Splitter seeded with the baseline work-stealing alphabet.
    fn default() -> Self {
        Self::from_sorted(vec!['a', 'b'])
    }
}

impl RangeSplitter {
    /// Create a splitter over the given seed alphabet.
    pub fn new(alphabet: &str) -> Result<Self> {
        if alphabet.is_empty() {
            return Err(Error::invalid_argument(
                "cannot split with an empty alphabet",
            ));
        }
        let mut chars: Vec<char> = alphabet.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        Ok(Self::from_sorted(chars))
    }

    fn from_sorted(alphabet: Vec<char>) -> Self {
        let ordinals = alphabet
            .iter()
            .copied()
            .enumerate()
            .map(|(index, c)| (c, index))
            .collect();
        Self { alphabet, ordinals }
    }

    /// Characters currently known to the splitter, in sorted order.
    pub fn alphabet(&self) -> String {
        self.alphabet.iter().collect()
    }

    /// Compute up to `num_splits` points strictly between `start` and `end`,
    /// lexicographically increasing, dividing the interval into roughly
    /// equal sub-intervals. An empty `end` is treated as unbounded.
    ///
    /// Returns an empty vector when the interval is empty or degenerate
    /// (equal bounds once right-padded with the smallest character).
    pub fn split_range(&mut self, start: &str, end: &str, num_splits: usize) -> Result<Vec<String>> {
        if num_splits < 1 {
            return Err(Error::invalid_argument(format!(
                "need at least one split point, got {num_splits}"
            )));
        }
        if !end.is_empty() && start >= end {
            return Ok(Vec::new());
        }
        if self.is_range_equal_with_padding(start, end) {
            return Ok(Vec::new());
        }

        self.add_characters(start);
        self.add_characters(end);
        if self.alphabet.len() < 2 {
            // A one-character alphabet has no interior points at any length.
            return Err(Error::invalid_argument(
                "alphabet must contain at least two characters",
            ));
        }

        let range = self.minimal_int_range(start, end, num_splits);
        Ok(self.generate_splits(&range, num_splits, start, end))
    }

    /// Grow the alphabet with every character of `characters` not already
    /// present, re-sorting and re-indexing when anything was added.
    pub fn add_characters(&mut self, characters: &str) {
        let mut added = false;
        for c in characters.chars() {
            if !self.ordinals.contains_key(&c) {
                self.alphabet.push(c);
                added = true;
            }
        }
        if added {
            self.alphabet.sort_unstable();
            self.alphabet.dedup();
            self.ordinals = self
                .alphabet
                .iter()
                .copied()
                .enumerate()
                .map(|(index, c)| (c, index))
                .collect();
        }
    }

    /// Read both bounds as numerals of growing length until the gap between
    /// them exceeds `num_splits`, guaranteeing enough distinct interior
    /// strings of that length.
    ///
    /// `start` is right-padded with the smallest character; `end` with the
    /// largest when unbounded, otherwise with the smallest.
    fn minimal_int_range(&self, start: &str, end: &str, num_splits: usize) -> MinimalIntRange {
        let alphabet_len = BigUint::from(self.alphabet.len());
        let smallest = self.alphabet[0];
        let largest = self.alphabet[self.alphabet.len() - 1];
        let end_default = if end.is_empty() { largest } else { smallest };

        let start_chars: Vec<char> = start.chars().collect();
        let end_chars: Vec<char> = end.chars().collect();
        let threshold = BigUint::from(num_splits);

        let mut start_int = BigUint::from(0u32);
        let mut end_int = BigUint::from(0u32);
        let mut len = 0;
        loop {
            let start_char = char_at_or(&start_chars, len, smallest);
            let end_char = char_at_or(&end_chars, len, end_default);
            start_int = &start_int * &alphabet_len + BigUint::from(self.ordinals[&start_char]);
            end_int = &end_int * &alphabet_len + BigUint::from(self.ordinals[&end_char]);
            len += 1;

            if end_int > &start_int + &threshold {
                return MinimalIntRange {
                    start_int,
                    end_int,
                    min_len: len,
                };
            }
        }
    }

    /// Place split points at `start + (gap * i) / (num_splits + 1)` and keep
    /// the ones strictly inside the original string interval. Integer splits
    /// are monotone and base conversion is monotone at fixed width, so the
    /// surviving points are strictly increasing.
    fn generate_splits(
        &self,
        range: &MinimalIntRange,
        num_splits: usize,
        start: &str,
        end: &str,
    ) -> Vec<String> {
        let gap = &range.end_int - &range.start_int;
        let interval = BigUint::from(num_splits + 1);

        let mut points = Vec::new();
        for i in 1..=num_splits {
            let split_int = &range.start_int + (&gap * BigUint::from(i)) / &interval;
            let candidate = self.int_to_string(&split_int, range.min_len);

            let above_start = candidate.as_str() > start;
            let below_end = end.is_empty() || candidate.as_str() < end;
            if above_start && below_end {
                points.push(candidate);
            }
        }
        points
    }

    /// Convert a base-|alphabet| integer back to a string of exactly
    /// `len` characters, most significant digit first.
    fn int_to_string(&self, value: &BigUint, len: usize) -> String {
        let alphabet_len = BigUint::from(self.alphabet.len());
        let mut value = value.clone();
        let mut digits = Vec::with_capacity(len);
        for _ in 0..len {
            let ordinal = (&value % &alphabet_len).to_usize().unwrap_or_default();
            value /= &alphabet_len;
            digits.push(self.alphabet[ordinal]);
        }
        // Assembled least significant digit first.
        digits.iter().rev().collect()
    }

    /// True when the bounds denote an empty interval because they become
    /// equal once right-padded with the smallest character (e.g. "9" vs
    /// "90" over a decimal alphabet).
    fn is_range_equal_with_padding(&self, start: &str, end: &str) -> bool {
        if end.is_empty() {
            return false;
        }
        let start_chars: Vec<char> = start.chars().collect();
        let end_chars: Vec<char> = end.chars().collect();
        let longest = start_chars.len().max(end_chars.len());
        let smallest = self.alphabet[0];

        for i in 0..longest {
            if char_at_or(&start_chars, i, smallest) != char_at_or(&end_chars, i, smallest) {
                return false;
            }
        }
        true
    }
}

fn char_at_or(chars: &[char], index: usize, default: char) -> char {
    chars.get(index).copied().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decimal_splitter() -> RangeSplitter {
        RangeSplitter::new("0123456789").unwrap()
    }

    #[test]
    fn test_empty_alphabet_rejected() {
        assert!(matches!(
            RangeSplitter::new(""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_zero_splits_rejected() {
        let mut splitter = decimal_splitter();
        assert!(matches!(
            splitter.split_range("1", "2", 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_split_range_table() {
        struct Case {
            desc: &'static str,
            start: &'static str,
            end: &'static str,
            splits: usize,
            want: Vec<&'static str>,
        }
        let cases = [
            Case {
                desc: "end smaller than start range",
                start: "456",
                end: "123",
                splits: 1,
                want: vec![],
            },
            Case {
                desc: "start and end equal after padding",
                start: "9",
                end: "90",
                splits: 100,
                want: vec![],
            },
            Case {
                desc: "tight range split",
                start: "199999",
                end: "2",
                splits: 1,
                want: vec!["1999995"],
            },
            Case {
                desc: "split full namespace",
                start: "",
                end: "",
                splits: 24,
                want: vec![
                    "03", "07", "11", "15", "19", "23", "27", "31", "35", "39", "43", "47", "51",
                    "55", "59", "63", "67", "71", "75", "79", "83", "87", "91", "95",
                ],
            },
            Case {
                desc: "split with only start range",
                start: "5555",
                end: "",
                splits: 4,
                want: vec!["63", "72", "81", "90"],
            },
            Case {
                desc: "large gap small number of splits",
                start: "0",
                end: "9",
                splits: 3,
                want: vec!["2", "4", "6"],
            },
            Case {
                desc: "split with longer prefix",
                start: "0123455111",
                end: "012347",
                splits: 1,
                want: vec!["012346"],
            },
            Case {
                desc: "split with only end range",
                start: "",
                end: "9",
                splits: 1,
                want: vec!["4"],
            },
        ];
        let mut splitter = decimal_splitter();
        for case in cases {
            let got = splitter
                .split_range(case.start, case.end, case.splits)
                .unwrap();
            assert_eq!(got, case.want, "{}", case.desc);
        }
    }

    #[test]
    fn test_add_characters() {
        let mut splitter = RangeSplitter::new("789").unwrap();
        splitter.add_characters("");
        assert_eq!(splitter.alphabet(), "789");
        splitter.add_characters("998");
        assert_eq!(splitter.alphabet(), "789");
        splitter.add_characters("102");
        assert_eq!(splitter.alphabet(), "012789");
        assert_eq!(splitter.ordinals[&'2'], 2);
        assert_eq!(splitter.ordinals[&'7'], 3);
    }

    #[test]
    fn test_int_to_string() {
        let splitter = RangeSplitter::new("0123AB").unwrap();
        assert_eq!(splitter.int_to_string(&BigUint::from(15u32), 3), "023");
        assert_eq!(splitter.int_to_string(&BigUint::from(215u32), 3), "BBB");
        // Values wider than the length wrap around modulo |alphabet|^len.
        assert_eq!(splitter.int_to_string(&BigUint::from(220u32), 3), "00A");
    }

    #[test]
    fn test_is_range_equal_with_padding() {
        let splitter = RangeSplitter::new("01A").unwrap();
        let cases = [
            ("15", "1500", true),
            ("15", "150A", false),
            ("15", "", false),
            ("", "09", false),
            ("", "0", true),
            ("", "", false),
            ("21", "12", false),
            ("21", "21", true),
        ];
        for (start, end, want) in cases {
            assert_eq!(
                splitter.is_range_equal_with_padding(start, end),
                want,
                "start={start:?} end={end:?}"
            );
        }
    }

    #[test]
    fn test_minimal_int_range() {
        struct Case {
            start: &'static str,
            end: &'static str,
            splits: usize,
            want: (u64, u64, usize),
        }
        let cases = [
            Case {
                start: "00",
                end: "20",
                splits: 3,
                want: (0, 20, 2),
            },
            Case {
                start: "06",
                end: "201",
                splits: 4,
                want: (6, 20, 2),
            },
            Case {
                start: "091",
                end: "10",
                splits: 2,
                want: (91, 100, 3),
            },
            Case {
                start: "",
                end: "10",
                splits: 2,
                want: (0, 10, 2),
            },
            Case {
                start: "",
                end: "",
                splits: 24,
                want: (0, 99, 2),
            },
            Case {
                start: "5555",
                end: "",
                splits: 4,
                want: (55, 99, 2),
            },
            Case {
                start: "199999",
                end: "2",
                splits: 1,
                want: (1_999_990, 2_000_000, 7),
            },
            Case {
                start: "8100",
                end: "9100",
                splits: 3,
                want: (81, 91, 2),
            },
        ];
        let splitter = decimal_splitter();
        for case in cases {
            let got = splitter.minimal_int_range(case.start, case.end, case.splits);
            let want = MinimalIntRange {
                start_int: BigUint::from(case.want.0),
                end_int: BigUint::from(case.want.1),
                min_len: case.want.2,
            };
            assert_eq!(got, want, "start={:?} end={:?}", case.start, case.end);
        }
    }

    #[test]
    fn test_alphabet_grows_from_ranges() {
        let mut splitter = RangeSplitter::default();
        assert_eq!(splitter.alphabet(), "ab");
        splitter.split_range("0", "9", 1).unwrap();
        assert_eq!(splitter.alphabet(), "09ab");
    }

    proptest! {
        // Split points are strictly increasing, strictly interior, and at
        // most num_splits of them come back.
        #[test]
        fn prop_splits_are_interior_and_increasing(
            start in "[0-9]{0,8}",
            end in "[0-9]{0,8}",
            num_splits in 1usize..12,
        ) {
            let mut splitter = decimal_splitter();
            let splits = splitter.split_range(&start, &end, num_splits).unwrap();
            prop_assert!(splits.len() <= num_splits);
            for point in &splits {
                prop_assert!(point.as_str() > start.as_str());
                if !end.is_empty() {
                    prop_assert!(point.as_str() < end.as_str());
                }
            }
            for pair in splits.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }

        // The alphabet only ever grows.
        #[test]
        fn prop_alphabet_is_monotonic(
            ranges in proptest::collection::vec(("[a-z0-9]{0,6}", "[a-z0-9]{0,6}"), 1..8),
        ) {
            let mut splitter = RangeSplitter::default();
            for (start, end) in ranges {
                let before: std::collections::HashSet<char> =
                    splitter.alphabet().chars().collect();
                let _ = splitter.split_range(&start, &end, 3);
                let after: std::collections::HashSet<char> =
                    splitter.alphabet().chars().collect();
                prop_assert!(before.is_subset(&after));
            }
        }
    }
}
