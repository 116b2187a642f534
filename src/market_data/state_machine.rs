// =============================================================================
// Symbol State Machine — INIT -> SNAPSHOT_PENDING -> APPLYING_SNAPSHOT ->
//                         LIVE / RESYNCING / HALTED
// =============================================================================
//
// An explicit sum type replacing the donor's ad-hoc boolean flags, per the
// design notes: the snapshot-in-flight and diff-buffer relationship is a
// state machine, not a pile of independent booleans.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolState {
    Init,
    SnapshotPending,
    ApplyingSnapshot,
    Live,
    Resyncing,
    Halted { reason: String },
}

impl std::fmt::Display for SymbolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::SnapshotPending => write!(f, "SNAPSHOT_PENDING"),
            Self::ApplyingSnapshot => write!(f, "APPLYING_SNAPSHOT"),
            Self::Live => write!(f, "LIVE"),
            Self::Resyncing => write!(f, "RESYNCING"),
            Self::Halted { reason } => write!(f, "HALTED({reason})"),
        }
    }
}

/// The event that caused a transition; logged alongside every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    FirstSubscription,
    SnapshotParsed,
    SnapshotAppliedClean,
    SnapshotBufferGap,
    SequenceGap,
    DiffLag,
    QueueOverflow,
    DesyncRateExceeded,
    IntegrityCritical,
    SnapshotFreshnessLost,
    RateLimited,
    RetryAfterElapsed,
    ResyncThrottleElapsed,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Owns the current state for one symbol and applies the transition table of
/// spec §4.4. Every accepted transition is logged with a trigger tag.
#[derive(Debug, Clone)]
pub struct StateMachine {
    symbol: String,
    state: SymbolState,
}

impl StateMachine {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            state: SymbolState::Init,
        }
    }

    pub fn state(&self) -> &SymbolState {
        &self.state
    }

    fn set(&mut self, next: SymbolState, trigger: Trigger) -> bool {
        if self.state == next {
            return false;
        }
        info!(
            symbol = %self.symbol,
            from = %self.state,
            to = %next,
            trigger = %trigger,
            "symbol state transition"
        );
        self.state = next;
        true
    }

    /// Attempt a transition; returns `true` if the transition table allows
    /// it from the current state (and it was applied), `false` if the
    /// trigger is not valid from the current state.
    pub fn transition(&mut self, trigger: Trigger) -> bool {
        use SymbolState::*;
        match (&self.state, trigger) {
            (Init, Trigger::FirstSubscription) => self.set(SnapshotPending, trigger),
            (SnapshotPending, Trigger::SnapshotParsed) => self.set(ApplyingSnapshot, trigger),
            (ApplyingSnapshot, Trigger::SnapshotAppliedClean) => self.set(Live, trigger),
            (ApplyingSnapshot, Trigger::SnapshotBufferGap) => self.set(Resyncing, trigger),
            (
                Live,
                Trigger::SequenceGap
                | Trigger::DiffLag
                | Trigger::QueueOverflow
                | Trigger::DesyncRateExceeded
                | Trigger::IntegrityCritical
                | Trigger::SnapshotFreshnessLost,
            ) => self.set(Resyncing, trigger),
            (Live, Trigger::RateLimited) => self.set(Halted { reason: "snapshot_429".into() }, trigger),
            (SnapshotPending, Trigger::RateLimited) => {
                self.set(Halted { reason: "snapshot_429".into() }, trigger)
            }
            (Resyncing, Trigger::ResyncThrottleElapsed) => self.set(SnapshotPending, trigger),
            (Halted { .. }, Trigger::RetryAfterElapsed) => self.set(SnapshotPending, trigger),
            // Any other (state, trigger) pair is not a valid edge; ignore.
            _ => false,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SymbolState::Live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_live() {
        let mut sm = StateMachine::new("BTCUSDT");
        assert!(sm.transition(Trigger::FirstSubscription));
        assert_eq!(*sm.state(), SymbolState::SnapshotPending);
        assert!(sm.transition(Trigger::SnapshotParsed));
        assert_eq!(*sm.state(), SymbolState::ApplyingSnapshot);
        assert!(sm.transition(Trigger::SnapshotAppliedClean));
        assert!(sm.is_live());
    }

    #[test]
    fn live_to_resyncing_on_gap() {
        let mut sm = StateMachine::new("BTCUSDT");
        sm.transition(Trigger::FirstSubscription);
        sm.transition(Trigger::SnapshotParsed);
        sm.transition(Trigger::SnapshotAppliedClean);
        assert!(sm.transition(Trigger::SequenceGap));
        assert_eq!(*sm.state(), SymbolState::Resyncing);
    }

    #[test]
    fn live_only_halts_via_rate_limit() {
        let mut sm = StateMachine::new("BTCUSDT");
        sm.transition(Trigger::FirstSubscription);
        sm.transition(Trigger::SnapshotParsed);
        sm.transition(Trigger::SnapshotAppliedClean);
        // Not a valid trigger from LIVE.
        assert!(!sm.transition(Trigger::FirstSubscription));
        assert!(sm.is_live());
        assert!(sm.transition(Trigger::RateLimited));
        assert_eq!(*sm.state(), SymbolState::Halted { reason: "snapshot_429".into() });
    }

    #[test]
    fn halted_returns_to_snapshot_pending_after_retry_after() {
        let mut sm = StateMachine::new("BTCUSDT");
        sm.transition(Trigger::FirstSubscription);
        sm.transition(Trigger::RateLimited);
        assert!(sm.transition(Trigger::RetryAfterElapsed));
        assert_eq!(*sm.state(), SymbolState::SnapshotPending);
    }

    #[test]
    fn resyncing_to_snapshot_pending_is_throttled_trigger() {
        let mut sm = StateMachine::new("BTCUSDT");
        sm.transition(Trigger::FirstSubscription);
        sm.transition(Trigger::SnapshotParsed);
        sm.transition(Trigger::SnapshotBufferGap);
        assert_eq!(*sm.state(), SymbolState::Resyncing);
        assert!(sm.transition(Trigger::ResyncThrottleElapsed));
        assert_eq!(*sm.state(), SymbolState::SnapshotPending);
    }
}
