//! Filter verdicts returned from `*_filter` hooks.

/// The verdict a plugin's `*_filter` hook can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Accept the packet/connection, optionally substituting its bytes.
    Accept,
    /// Reject: tear down the connection (TCP) or drop the packet (UDP/other).
    Reject,
    /// Logging-only; semantically equivalent to "no action taken".
    Alert,
}

/// The full outcome of a `*_filter` hook: the verdict plus optional
/// replacement bytes.
pub type FilterOutcome = (FilterAction, Option<bytes::Bytes>);
