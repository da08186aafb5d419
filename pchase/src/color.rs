//! Classification of physical addresses into DRAM "colors".
//!
//! A color is the concatenation of a handful of address-derived bits that is
//! believed to select a bank (or channel). Two schemes are supported:
//!
//! - a bitmask, where output bit `i` is the address bit at the `i`-th set
//!   position of the mask (lowest set bit first), and
//! - a list of XOR functions, where output bit `i` is the XOR of every
//!   address bit named by function `i`.
//!
//! ```text
//! bitmask 0x7800:      color = a14 a13 a12 a11
//! coffeelake preset:   color = (a6^a13) (a14^a17) (a15^a18) (a16^a19)
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use bitvec::prelude::*;
use itertools::Itertools;

use crate::error::{PchaseError, Result};

/// Default bank bitmask (bits 14..11, Cortex-A72).
pub const DEFAULT_BANK_BITMASK: u64 = 0x7800;

/// Most XOR functions a scheme may have (one output bit of a color each).
pub const MAX_FUNCTIONS: usize = usize::BITS as usize;

/// A single XOR function over address bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitFunction(Vec<u8>);
impl BitFunction {
    pub fn new(bits: impl IntoIterator<Item = u8>) -> Self {
        Self(bits.into_iter().collect())
    }

    pub fn bits(&self) -> &[u8] { &self.0 }

    /// XOR of all named bits of `addr`.
    pub fn evaluate(&self, addr: u64) -> bool {
        self.0.iter().fold(false, |acc, &b| acc ^ ((addr >> b) & 1 != 0))
    }
}

/// A classification scheme. Classification is a pure function of the address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColorScheme {
    Bitmask(u64),
    Functions(Vec<BitFunction>),
}

impl Default for ColorScheme {
    fn default() -> Self { Self::Bitmask(DEFAULT_BANK_BITMASK) }
}

impl ColorScheme {
    /// The four bank functions hard-wired for a Coffee Lake DDR4 system.
    pub fn coffeelake() -> Self {
        Self::Functions(vec![
            BitFunction::new([16, 19]),
            BitFunction::new([15, 18]),
            BitFunction::new([14, 17]),
            BitFunction::new([6, 13]),
        ])
    }

    /// A scheme of XOR functions, at most [`MAX_FUNCTIONS`] of them.
    pub fn functions(funcs: Vec<BitFunction>) -> Result<Self> {
        if funcs.is_empty() || funcs.len() > MAX_FUNCTIONS {
            return Err(PchaseError::invalid(format!(
                "{} bank functions, expected 1..={}", funcs.len(), MAX_FUNCTIONS)));
        }
        Ok(Self::Functions(funcs))
    }

    /// Compute the color of `addr`.
    pub fn classify(&self, addr: u64) -> usize {
        match self {
            Self::Bitmask(mask) => {
                let mut color = 0usize;
                for (idx, bit) in mask.view_bits::<Lsb0>().iter_ones().enumerate() {
                    if (addr >> bit) & 1 != 0 {
                        color |= 1 << idx;
                    }
                }
                color
            },
            Self::Functions(funcs) => {
                let mut color = 0usize;
                for (idx, f) in funcs.iter().take(MAX_FUNCTIONS).enumerate() {
                    color |= (f.evaluate(addr) as usize) << idx;
                }
                color
            },
        }
    }

    /// Number of output bits.
    pub fn width(&self) -> u32 {
        match self {
            Self::Bitmask(mask) => mask.count_ones(),
            Self::Functions(funcs) => funcs.len() as u32,
        }
    }

    /// Every address bit that takes part in classification, ascending.
    pub fn bits(&self) -> Vec<u8> {
        match self {
            Self::Bitmask(mask) => {
                mask.view_bits::<Lsb0>().iter_ones().map(|b| b as u8).collect()
            },
            Self::Functions(funcs) => {
                funcs.iter().flat_map(|f| f.bits().iter().copied())
                    .sorted().dedup().collect()
            },
        }
    }

    /// Number of distinct colors this scheme can produce.
    pub fn num_colors(&self) -> usize {
        1usize.checked_shl(self.width()).unwrap_or(usize::MAX)
    }

    /// Parse the bank-function mapping format: one function per line, each a
    /// whitespace-separated list of bit positions. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn parse_mapping(text: &str, origin: &Path) -> Result<Self> {
        let err = |line: usize, msg: String| PchaseError::MappingFile {
            path: origin.to_path_buf(),
            line,
            msg,
        };

        let mut funcs = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if funcs.len() == MAX_FUNCTIONS {
                return Err(err(lineno + 1,
                    format!("more than {} bank functions", MAX_FUNCTIONS)));
            }
            let mut bits = Vec::new();
            for tok in line.split_whitespace() {
                let bit: u8 = tok.parse().map_err(|_| {
                    err(lineno + 1, format!("bad bit position '{}'", tok))
                })?;
                if bit >= 64 {
                    return Err(err(lineno + 1, format!("bit {} out of range", bit)));
                }
                bits.push(bit);
            }
            funcs.push(BitFunction(bits));
        }
        if funcs.is_empty() {
            return Err(err(0, "no bank functions defined".to_string()));
        }
        Self::functions(funcs)
    }

    pub fn from_mapping_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PchaseError::MappingFile {
            path: path.to_path_buf(),
            line: 0,
            msg: e.to_string(),
        })?;
        Self::parse_mapping(&text, path)
    }
}

impl fmt::Display for ColorScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitmask(mask) => {
                write!(f, "bitmask {:#x} (bits {})", mask,
                    mask.view_bits::<Lsb0>().iter_ones().join(" "))
            },
            Self::Functions(funcs) => {
                write!(f, "functions [{}]", funcs.iter()
                    .map(|func| func.bits().iter().join("^"))
                    .join(", "))
            },
        }
    }
}

/// The set of selected colors. Empty means every color is accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorSet(BTreeSet<usize>);
impl ColorSet {
    pub fn all() -> Self { Self(BTreeSet::new()) }

    pub fn accepts_all(&self) -> bool { self.0.is_empty() }

    pub fn contains(&self, color: usize) -> bool {
        self.accepts_all() || self.0.contains(&color)
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ { self.0.iter().copied() }
}

impl FromIterator<usize> for ColorSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ColorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.accepts_all() {
            write!(f, "all")
        } else {
            write!(f, "{}", self.0.iter().join(" "))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bitmask_concatenates_set_bits() {
        let s = ColorScheme::Bitmask(0x7800);
        assert_eq!(s.num_colors(), 16);
        assert_eq!(s.classify(0), 0);
        assert_eq!(s.classify(1 << 11), 0b0001);
        assert_eq!(s.classify(1 << 14), 0b1000);
        assert_eq!(s.classify((1 << 12) | (1 << 13)), 0b0110);
    }

    #[test]
    fn bits_outside_scheme_are_ignored() {
        let s = ColorScheme::Bitmask(0x1e000);
        let a = 0x0000_0001_2345_6000u64 & !0x1e000;
        let b = a ^ 0xffff_0000_0000_0fff;
        assert_eq!(s.classify(a), s.classify(b));
        assert_eq!(s.classify(a | 0x4000), s.classify(b | 0x4000));

        let f = ColorScheme::coffeelake();
        let c = 0x1234_5000u64;
        assert_eq!(f.classify(c), f.classify(c ^ (1 << 30) ^ (1 << 3)));
    }

    #[test]
    fn coffeelake_functions() {
        let s = ColorScheme::coffeelake();
        assert_eq!(s.num_colors(), 16);
        assert_eq!(s.bits(), vec![6, 13, 14, 15, 16, 17, 18, 19]);
        let bit = |a: u64, x: u32| ((a >> x) & 1) as usize;
        for a in [0u64, 0x40, 0x2040, 0xa_b000, 0xf_ffc0, 0x1234_5678] {
            let expect = (bit(a, 6) ^ bit(a, 13)) << 3
                | (bit(a, 14) ^ bit(a, 17)) << 2
                | (bit(a, 15) ^ bit(a, 18)) << 1
                | (bit(a, 16) ^ bit(a, 19));
            assert_eq!(s.classify(a), expect, "addr {:#x}", a);
        }
    }

    #[test]
    fn parse_mapping_file_format() {
        let text = "# bank functions\n\n6 13\n  14 17 \n#15 18\n15 18\n";
        let s = ColorScheme::parse_mapping(text, Path::new("map.txt")).unwrap();
        assert_eq!(s, ColorScheme::Functions(vec![
            BitFunction::new([6, 13]),
            BitFunction::new([14, 17]),
            BitFunction::new([15, 18]),
        ]));
        assert_eq!(s.classify(1 << 6), 0b001);
        assert_eq!(s.classify((1 << 6) | (1 << 13)), 0);
    }

    #[test]
    fn parse_mapping_reports_line() {
        let text = "6 13\n\n14 x\n";
        match ColorScheme::parse_mapping(text, Path::new("m")) {
            Err(PchaseError::MappingFile { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ColorScheme::parse_mapping("# nothing\n", Path::new("m")).is_err());
        assert!(ColorScheme::parse_mapping("64\n", Path::new("m")).is_err());
    }

    #[test]
    fn function_count_is_bounded() {
        let lines = |n: usize| "6\n".repeat(n);
        let s = ColorScheme::parse_mapping(&lines(MAX_FUNCTIONS), Path::new("m")).unwrap();
        assert_eq!(s.width() as usize, MAX_FUNCTIONS);
        assert_eq!(s.classify(1 << 6), usize::MAX);
        assert_eq!(s.classify(1 << 7), 0);

        match ColorScheme::parse_mapping(&lines(MAX_FUNCTIONS + 1), Path::new("m")) {
            Err(PchaseError::MappingFile { line, .. }) => assert_eq!(line, MAX_FUNCTIONS + 1),
            other => panic!("unexpected {:?}", other),
        }
        let too_many = vec![BitFunction::new([6]); MAX_FUNCTIONS + 1];
        assert!(matches!(ColorScheme::functions(too_many.clone()),
            Err(PchaseError::InvalidConfiguration(_))));
        assert!(ColorScheme::functions(Vec::new()).is_err());
        // A scheme assembled directly still classifies without overflowing.
        assert_eq!(ColorScheme::Functions(too_many).classify(1 << 6), usize::MAX);
    }

    #[test]
    fn mapping_from_file() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "13 16\n14 17").unwrap();
        let s = ColorScheme::from_mapping_file(f.path()).unwrap();
        assert_eq!(s.width(), 2);
        assert_eq!(s.to_string(), "functions [13^16, 14^17]");
    }

    #[test]
    fn color_set_membership() {
        let all = ColorSet::all();
        assert!(all.contains(3));
        let some: ColorSet = [2, 5, 2].into_iter().collect();
        assert_eq!(some.len(), 2);
        assert!(some.contains(5));
        assert!(!some.contains(3));
        assert_eq!(some.to_string(), "2 5");
    }
}
