//! Implementation modules for `verifier`.
//!
//! `src/verifier.rs` is the stable facade; each step of the flow lives in
//! its own file here.

use super::RejectReason;

pub(crate) mod binding;
pub(crate) mod replay;
pub(crate) mod run;
pub(crate) mod signature;
pub(crate) mod structure;

#[cfg(test)]
pub(crate) mod tests;

/// A failed check: the public reason plus detail for the log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub(crate) reason: RejectReason,
    pub(crate) detail: String,
}

impl Rejection {
    pub(crate) fn new(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::new(RejectReason::MalformedMandate, detail)
    }
}
