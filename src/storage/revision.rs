//! Revision algebra.
//!
//! A revision is an opaque, totally-ordered stamp assigned by the backing
//! store to each committed change. The proxy never inspects structure beyond
//! comparison and a canonical fingerprint; the concrete representation is a
//! decimal with up to nine fractional digits, matching hybrid-logical-clock
//! style stamps such as `1742` or `1742.000000003`.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use prost::Message;

use crate::proto::schema::RevisionKey;

/// Number of decimal digits the fractional component is normalized to.
const FRACTION_DIGITS: u32 = 9;
const FRACTION_SCALE: u64 = 10u64.pow(FRACTION_DIGITS);

/// An opaque totally-ordered version stamp.
///
/// Ordering is integral-major with the fraction normalized to a fixed scale,
/// so `"3.5" > "3.25"` compares numerically, not lexically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision {
    integral: u64,
    fractional: u64,
}

impl Revision {
    /// The lowest possible revision.
    pub const fn zero() -> Self {
        Self {
            integral: 0,
            fractional: 0,
        }
    }

    /// A whole-numbered revision.
    pub const fn new(integral: u64) -> Self {
        Self {
            integral,
            fractional: 0,
        }
    }

    pub fn less_than(
        &self,
        other: &Revision,
    ) -> bool {
        self < other
    }

    pub fn equal(
        &self,
        other: &Revision,
    ) -> bool {
        self == other
    }

    pub fn less_or_equal(
        &self,
        other: &Revision,
    ) -> bool {
        self <= other
    }

    /// Canonical byte-stable serialization, suitable as a cache key
    /// component. Equal revisions always fingerprint identically, including
    /// across independently constructed values.
    pub fn fingerprint(&self) -> Bytes {
        let key = RevisionKey {
            integral: self.integral,
            fractional: self.fractional,
        };
        Bytes::from(key.encode_to_vec())
    }
}

impl fmt::Display for Revision {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.fractional == 0 {
            return write!(f, "{}", self.integral);
        }
        let digits = format!("{:09}", self.fractional);
        write!(f, "{}.{}", self.integral, digits.trim_end_matches('0'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid revision `{0}`")]
pub struct InvalidRevision(pub String);

impl FromStr for Revision {
    type Err = InvalidRevision;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || InvalidRevision(value.to_string());

        let (whole, fraction) = match value.split_once('.') {
            Some((whole, fraction)) => (whole, Some(fraction)),
            None => (value, None),
        };

        let integral: u64 = whole.parse().map_err(|_| invalid())?;
        let fractional = match fraction {
            None => 0,
            Some("") => return Err(invalid()),
            Some(digits) => {
                if digits.len() > FRACTION_DIGITS as usize || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let parsed: u64 = digits.parse().map_err(|_| invalid())?;
                parsed * (FRACTION_SCALE / 10u64.pow(digits.len() as u32))
            }
        };

        Ok(Revision { integral, fractional })
    }
}
