//! Connection identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier for a connection
///
/// Assigned once when the connection is created and never reused, so it is
/// a safe key for application-side tables such as an "online" set.
/// Zero is reserved as a sentinel for "no connection".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl ConnId {
    /// Sentinel value indicating no connection
    pub const NONE: ConnId = ConnId(0);

    /// Allocate the next identifier.
    #[inline]
    pub fn next() -> Self {
        ConnId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a ConnId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        ConnId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl From<ConnId> for u64 {
    #[inline]
    fn from(id: ConnId) -> Self {
        id.0
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ConnId(NONE)")
        } else {
            write!(f, "ConnId({})", self.0)
        }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Default for ConnId {
    fn default() -> Self {
        ConnId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_id_unique_and_increasing() {
        let a = ConnId::next();
        let b = ConnId::next();
        assert!(!a.is_none());
        assert!(b > a);
    }

    #[test]
    fn test_conn_id_none() {
        assert!(ConnId::NONE.is_none());
        assert_eq!(ConnId::default(), ConnId::NONE);
        assert_eq!(format!("{:?}", ConnId::NONE), "ConnId(NONE)");
        assert_eq!(format!("{}", ConnId::new(7)), "#7");
    }
}
