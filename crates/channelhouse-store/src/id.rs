//! Stream entry IDs
//!
//! Entry IDs are `<milliseconds>-<sequence>` pairs assigned by the store and
//! strictly increasing within one stream. A bare `<milliseconds>` is accepted
//! on input and means sequence 0.

use crate::error::StoreError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest ID strictly greater than `self` for a clock reading of `now_ms`.
    pub fn next_after(self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            EntryId::new(now_ms, 0)
        } else {
            EntryId::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id: EntryId = "1526919030474-55".parse().unwrap();
        assert_eq!(id, EntryId::new(1526919030474, 55));
        assert_eq!(id.to_string(), "1526919030474-55");

        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::new(42, 0));
        assert!("".parse::<EntryId>().is_err());
        assert!("a-1".parse::<EntryId>().is_err());
        assert!("1-".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric() {
        let a: EntryId = "9-5".parse().unwrap();
        let b: EntryId = "10-0".parse().unwrap();
        let c: EntryId = "10-1".parse().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_next_after_survives_clock_skew() {
        let last = EntryId::new(100, 3);
        assert_eq!(last.next_after(101), EntryId::new(101, 0));
        assert_eq!(last.next_after(100), EntryId::new(100, 4));
        assert_eq!(last.next_after(50), EntryId::new(100, 4));
    }
}
