use std::fmt::{Display, Formatter};

/// Sequence number of a fragment, assigned per (sender, destination) pair.
///
/// Sequence numbers start at 1 and increase monotonically; 0 is reserved for 'not assigned yet'.
///  A fragment keeps its sequence number when it is retransmitted (on the same or a different
///  path), which is what allows the receiver to detect duplicates.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct FragSeq(u64);

impl Display for FragSeq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FragSeq {
    pub const UNASSIGNED: FragSeq = FragSeq(0);
    pub const FIRST: FragSeq = FragSeq(1);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }

    pub fn next(&self) -> FragSeq {
        FragSeq(
            self.0.checked_add(1)
                .expect("64 bit fragment sequence space exhausted")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unassigned() {
        assert!(!FragSeq::UNASSIGNED.is_assigned());
        assert!(FragSeq::FIRST.is_assigned());
        assert_eq!(FragSeq::default(), FragSeq::UNASSIGNED);
        assert_eq!(FragSeq::UNASSIGNED.next(), FragSeq::FIRST);
    }

    #[test]
    fn test_ordering() {
        assert!(FragSeq::from_raw(3) < FragSeq::from_raw(3).next());
        assert_eq!(FragSeq::from_raw(99).to_raw(), 99);
        assert_eq!(format!("{}", FragSeq::from_raw(12)), "12");
    }
}
