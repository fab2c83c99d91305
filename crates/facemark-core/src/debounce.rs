//! Presence debouncing: turn a noisy per-frame "face present" signal into a
//! single confirmation.
//!
//! Presence must hold for `threshold` consecutive frames. A single frame
//! without a face resets the run to zero. Confirmation is sticky: once it
//! fires, further frames are ignored.

/// Consecutive face frames required to confirm presence (~1 s at 10 fps).
pub const DEFAULT_CONFIRM_FRAMES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceDebouncer {
    threshold: u32,
    consecutive: u32,
    confirmed: bool,
}

impl PresenceDebouncer {
    /// A threshold of 0 is treated as 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
            confirmed: false,
        }
    }

    /// Feed one frame. Returns `true` exactly once: on the frame that
    /// completes the required run.
    pub fn observe(&mut self, faces_present: bool) -> bool {
        if self.confirmed {
            return false;
        }
        if !faces_present {
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold {
            self.confirmed = true;
            return true;
        }
        false
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for PresenceDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRM_FRAMES)
    }
}
