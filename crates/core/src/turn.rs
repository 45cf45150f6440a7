//! Derives the "AI is speaking" indicator from the inbound audio stream.
//!
//! The indicator goes up on the first chunk of a turn. When the server signals
//! turn completion it is not cleared straight away: a quiet timer of
//! [`QUIET_DELAY`] is armed, and only if no further chunk arrives before it
//! fires does the indicator drop. Every chunk bumps a generation counter, which
//! is how a stale timer knows it has been superseded.

use std::time::Duration;

/// How long to wait after turn completion for straggling chunks.
pub const QUIET_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct TurnTracker {
    speaking: bool,
    generation: u64,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Records an inbound audio chunk. Returns `true` if speaking just started.
    pub fn on_chunk(&mut self) -> bool {
        self.generation += 1;
        !std::mem::replace(&mut self.speaking, true)
    }

    /// Records a turn-complete signal and returns the generation a quiet timer
    /// should be armed with, or `None` if nothing is being spoken.
    pub fn on_turn_complete(&mut self) -> Option<u64> {
        self.speaking.then_some(self.generation)
    }

    /// Handles an expired quiet timer. Returns `true` if speaking was cleared.
    pub fn on_quiet_elapsed(&mut self, generation: u64) -> bool {
        if self.speaking && generation == self.generation {
            self.speaking = false;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_timer_clears_after_turn_complete() {
        let mut turn = TurnTracker::new();
        assert!(turn.on_chunk());
        assert!(!turn.on_chunk());
        let generation = turn.on_turn_complete().unwrap();
        assert!(turn.is_speaking());
        assert!(turn.on_quiet_elapsed(generation));
        assert!(!turn.is_speaking());
    }

    #[test]
    fn test_late_chunk_cancels_pending_quiet_timer() {
        let mut turn = TurnTracker::new();
        turn.on_chunk();
        let generation = turn.on_turn_complete().unwrap();
        // A straggler from the same turn lands inside the quiet window.
        assert!(!turn.on_chunk());
        assert!(!turn.on_quiet_elapsed(generation));
        assert!(turn.is_speaking());

        let next = turn.on_turn_complete().unwrap();
        assert!(turn.on_quiet_elapsed(next));
        assert!(!turn.is_speaking());
    }

    #[test]
    fn test_turn_complete_without_audio_arms_nothing() {
        let mut turn = TurnTracker::new();
        assert_eq!(turn.on_turn_complete(), None);
        assert!(!turn.on_quiet_elapsed(0));
    }

    #[test]
    fn test_reset_invalidates_outstanding_timer() {
        let mut turn = TurnTracker::new();
        turn.on_chunk();
        let generation = turn.on_turn_complete().unwrap();
        turn.reset();
        assert!(!turn.is_speaking());
        turn.on_chunk();
        assert!(!turn.on_quiet_elapsed(generation));
    }
}
