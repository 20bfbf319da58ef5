//! Before-apply hooks
//!
//! Every apply/unapply path raises a synchronous notification before
//! touching the wire or the state; any deny suppresses both, so hook
//! observers never see state and wire diverge. Hooks run in-process on the
//! calling thread.

use super::color::HighlightColor;
use super::types::{CellPos, TargetId, ViewerId};

/// Hook decision for a pending change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

/// A pending highlight change, described before it happens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HighlightChange {
    EntityApply {
        viewer: ViewerId,
        target: TargetId,
        color: HighlightColor,
    },
    EntityClear {
        viewer: ViewerId,
        target: TargetId,
    },
    CellApply {
        viewer: ViewerId,
        cell: CellPos,
        color: HighlightColor,
    },
    CellClear {
        viewer: ViewerId,
        cell: CellPos,
    },
}

/// Veto-capable observer of highlight changes.
pub trait HighlightHook: Send + Sync {
    fn before_apply(&self, change: &HighlightChange) -> Verdict;
}

impl<F> HighlightHook for F
where
    F: Fn(&HighlightChange) -> Verdict + Send + Sync,
{
    fn before_apply(&self, change: &HighlightChange) -> Verdict {
        self(change)
    }
}
