//! Per-epoch lifecycle as tracked by the coordinator. An epoch moves from
//! [Open](EpochState::Open) (writers actively producing) to
//! [AwaitingTokens](EpochState::AwaitingTokens) (no new writes assigned,
//! in-flight writers finishing) to [Deciding](EpochState::Deciding) (the
//! coordinator evaluating the collected tokens) and finally to one of the
//! terminal states. `Deciding` loops back to itself when a failed commit is
//! followed by abort for the same epoch. There is no transition out of a
//! terminal state; repeating the same terminal call there is a no-op.

use std::fmt;

use crate::Result;
use crate::error::Error;

/// The scope of a single slice of streaming work. Engine-assigned,
/// monotonically increasing, and never reused within a run.
pub type Epoch = u64;

/// Lifecycle of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochState {
    /// writers are actively producing output for the epoch
    Open,
    /// the engine stopped assigning writes and is waiting for in-flight
    /// writers to finish
    AwaitingTokens,
    /// the coordinator is evaluating the collected tokens
    Deciding,
    /// the epoch's output is durably visible in the sink
    Committed,
    /// the epoch was abandoned and its partial output discarded
    Aborted,
}

impl EpochState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpochState::Committed | EpochState::Aborted)
    }

    /// Checked transition. Sealing is advisory, so an epoch may move from
    /// `Open` straight into `Deciding`; `Deciding -> Deciding` covers the
    /// failed-commit-then-abort loop.
    pub(crate) fn advance(self, next: EpochState) -> Result<EpochState> {
        let allowed = matches!(
            (self, next),
            (EpochState::Open, EpochState::AwaitingTokens)
                | (EpochState::Open, EpochState::Deciding)
                | (EpochState::AwaitingTokens, EpochState::Deciding)
                | (EpochState::Deciding, EpochState::Deciding)
                | (EpochState::Deciding, EpochState::Committed)
                | (EpochState::Deciding, EpochState::Aborted)
        );
        if allowed {
            Ok(next)
        } else {
            Err(Error::Coordinator(format!(
                "invalid epoch transition {self} -> {next}"
            )))
        }
    }
}

impl fmt::Display for EpochState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochState::Open => write!(f, "Open"),
            EpochState::AwaitingTokens => write!(f, "AwaitingTokens"),
            EpochState::Deciding => write!(f, "Deciding"),
            EpochState::Committed => write!(f, "Committed"),
            EpochState::Aborted => write!(f, "Aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let state = EpochState::Open;
        let state = state.advance(EpochState::AwaitingTokens).unwrap();
        let state = state.advance(EpochState::Deciding).unwrap();
        // failed commit re-enters Deciding before the follow-up abort
        let state = state.advance(EpochState::Deciding).unwrap();
        let state = state.advance(EpochState::Aborted).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_seal_is_advisory() {
        let state = EpochState::Open.advance(EpochState::Deciding).unwrap();
        assert_eq!(state, EpochState::Deciding);
        assert!(state.advance(EpochState::Committed).unwrap().is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for terminal in [EpochState::Committed, EpochState::Aborted] {
            for next in [
                EpochState::Open,
                EpochState::AwaitingTokens,
                EpochState::Deciding,
                EpochState::Committed,
                EpochState::Aborted,
            ] {
                assert!(terminal.advance(next).is_err());
            }
        }
    }

    #[test]
    fn test_no_backward_transitions() {
        assert!(EpochState::AwaitingTokens
            .advance(EpochState::Open)
            .is_err());
        assert!(EpochState::Deciding
            .advance(EpochState::AwaitingTokens)
            .is_err());
        // terminal decisions are only taken from Deciding
        assert!(EpochState::Open.advance(EpochState::Committed).is_err());
        assert!(EpochState::AwaitingTokens
            .advance(EpochState::Aborted)
            .is_err());
    }
}
