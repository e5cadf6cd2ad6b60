//! HTTP/2 flow control window tracking (RFC 7540 Section 6.9).

use crate::error::H2Error;
use crate::settings::MAX_WINDOW_SIZE;

/// Default initial window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: i64 = 65535;

/// A send or receive flow control window.
///
/// Signed because a SETTINGS change to INITIAL_WINDOW_SIZE can push a send
/// window below zero (Section 6.9.2).
#[derive(Debug, Clone)]
pub struct Window {
    size: i64,
}

impl Window {
    pub fn new(initial: i64) -> Self {
        Self { size: initial }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Bytes that may be sent right now; zero when the window is negative.
    pub fn available(&self) -> usize {
        self.size.max(0) as usize
    }

    /// Take `amount` bytes out of the window.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let next = self.size - i64::from(amount);
        if next < 0 {
            return Err(H2Error::FlowControlError);
        }
        self.size = next;
        Ok(())
    }

    /// Credit the window with a WINDOW_UPDATE increment.
    pub fn credit(&mut self, increment: u32) -> Result<(), H2Error> {
        self.shift(i64::from(increment))
    }

    /// Shift the window by `delta = new_initial - old_initial`.
    pub fn shift(&mut self, delta: i64) -> Result<(), H2Error> {
        let next = self.size + delta;
        if next > i64::from(MAX_WINDOW_SIZE) {
            return Err(H2Error::FlowControlError);
        }
        self.size = next;
        Ok(())
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}
