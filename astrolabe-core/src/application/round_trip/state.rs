use std::fmt;
use tracing::debug;

/// Where a round trip currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoundTripState {
    #[default]
    Idle,
    AwaitingFirstCompletion,
    ExtractingCalls,
    ExecutingTools,
    AwaitingFollowupCompletion,
    Done,
}

impl RoundTripState {
    fn can_advance_to(self, next: RoundTripState) -> bool {
        use RoundTripState::*;
        matches!(
            (self, next),
            (Idle, AwaitingFirstCompletion)
                | (AwaitingFirstCompletion, ExtractingCalls)
                | (AwaitingFirstCompletion, Done)
                | (ExtractingCalls, ExecutingTools)
                | (ExecutingTools, AwaitingFollowupCompletion)
                | (AwaitingFollowupCompletion, Done)
        )
    }

    /// Move to `next`, logging the edge.
    pub(crate) fn advance(&mut self, next: RoundTripState) {
        debug_assert!(self.can_advance_to(next), "illegal transition {self} -> {next}");
        debug!(from = %self, to = %next, "Round trip transition");
        *self = next;
    }

    pub fn is_done(self) -> bool {
        self == RoundTripState::Done
    }
}

impl fmt::Display for RoundTripState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RoundTripState::Idle => "idle",
            RoundTripState::AwaitingFirstCompletion => "awaiting_first_completion",
            RoundTripState::ExtractingCalls => "extracting_calls",
            RoundTripState::ExecutingTools => "executing_tools",
            RoundTripState::AwaitingFollowupCompletion => "awaiting_followup_completion",
            RoundTripState::Done => "done",
        };
        f.write_str(label)
    }
}
