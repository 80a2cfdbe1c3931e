//! Version gate: the optimistic admission check for a single key.

use crate::Versioned;

/// Decision of the version gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    Reject,
}

/// Admits `incoming` over `existing`.
///
/// A missing or tombstoned value counts as version minus infinity, so anything
/// is admitted into an empty slot. Otherwise the incoming version must be
/// strictly greater.
///
/// Callers re-run this against the freshest value on every CAS retry.
#[inline]
pub(crate) fn admit<V: Versioned>(existing: Option<&V>, incoming: &V) -> Admission {
    match existing {
        None => Admission::Accept,
        Some(cur) if incoming.version() > cur.version() => Admission::Accept,
        Some(_) => Admission::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stamped;

    #[test]
    fn test_absent_admits_anything() {
        assert_eq!(admit(None, &Stamped::initial(())), Admission::Accept);
        assert_eq!(admit(None, &Stamped::new((), u64::MAX)), Admission::Accept);
    }

    #[test]
    fn test_strictly_greater() {
        let cur = Stamped::new((), 3);
        assert_eq!(admit(Some(&cur), &Stamped::new((), 4)), Admission::Accept);
        assert_eq!(admit(Some(&cur), &Stamped::new((), 3)), Admission::Reject);
        assert_eq!(admit(Some(&cur), &Stamped::new((), 0)), Admission::Reject);
    }
}
