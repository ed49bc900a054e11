//! Tor SENDME Flow Control
//!
//! ## How It Works:
//!
//! 1. **Deliver window:** decremented for every DATA cell received. Once it
//!    drops to `initial - increment` a SENDME is due and the window is
//!    replenished by `increment`.
//! 2. **Package window:** decremented for every DATA cell sent, refilled by
//!    `increment` for each SENDME received. Sending stops at zero.
//!
//! ## Window Values:
//!
//! - **Circuit:** 1000 cells, SENDME every 100 (per hop)
//! - **Stream:** 500 cells, SENDME every 50

use crate::error::{Result, TorError};

/// One direction of a SENDME window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    value: u32,
    initial: u32,
    increment: u32,
}

impl Window {
    pub fn new(initial: u32, increment: u32) -> Self {
        Self {
            value: initial,
            initial,
            increment,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    fn threshold(&self) -> u32 {
        self.initial.saturating_sub(self.increment)
    }

    /// Count one received DATA cell
    ///
    /// Returns `true` when a SENDME must be sent; the window has then already
    /// been replenished.
    pub fn on_deliver(&mut self) -> bool {
        self.value = self.value.saturating_sub(1);
        if self.value <= self.threshold() {
            self.value += self.increment;
            return true;
        }
        false
    }

    /// Whether at least one cell may be packaged
    pub fn can_send(&self) -> bool {
        self.value > 0
    }

    /// Count one sent DATA cell
    pub fn on_package(&mut self) -> Result<()> {
        if self.value == 0 {
            return Err(TorError::Stream("Send window exhausted".into()));
        }
        self.value -= 1;
        Ok(())
    }

    /// Credit a received SENDME
    pub fn on_sendme(&mut self) {
        self.value += self.increment;
    }
}

/// Circuit-level flow control for one hop
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    /// Cells we can send before needing SENDME
    pub package: Window,

    /// Cells we accept before owing a SENDME
    pub deliver: Window,

    /// DATA cells packaged to this hop so far
    packaged: u32,
}

impl CircuitFlowControl {
    /// Initial circuit window size (1000 cells)
    pub const INITIAL_WINDOW: u32 = 1000;

    /// Window increment per SENDME (100 cells)
    pub const WINDOW_INCREMENT: u32 = 100;

    /// Create new circuit flow control with default windows
    pub fn new() -> Self {
        Self::with_window(Self::INITIAL_WINDOW)
    }

    pub fn with_window(initial: u32) -> Self {
        Self {
            package: Window::new(initial, Self::WINDOW_INCREMENT),
            deliver: Window::new(initial, Self::WINDOW_INCREMENT),
            packaged: 0,
        }
    }

    /// Count one DATA cell sent to this hop
    ///
    /// Returns `true` when the cell closes an increment: the hop answers it
    /// with a SENDME, and a v1 SENDME echoes this cell's digest.
    pub fn on_package(&mut self) -> Result<bool> {
        self.package.on_package()?;
        self.packaged = self.packaged.wrapping_add(1);
        Ok(self.packaged % Self::WINDOW_INCREMENT == 0)
    }

    /// Process received DATA cell; `true` means send a circuit SENDME
    pub fn on_receive(&mut self) -> bool {
        let due = self.deliver.on_deliver();
        if due {
            log::debug!("Circuit deliver window hit threshold, sending SENDME");
        }
        due
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    /// Stream ID this flow control belongs to
    pub stream_id: u16,

    pub package: Window,

    pub deliver: Window,
}

impl StreamFlowControl {
    /// Initial stream window size (500 cells)
    pub const INITIAL_WINDOW: u32 = 500;

    /// Window increment per SENDME (50 cells)
    pub const WINDOW_INCREMENT: u32 = 50;

    /// Create new stream flow control
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            package: Window::new(Self::INITIAL_WINDOW, Self::WINDOW_INCREMENT),
            deliver: Window::new(Self::INITIAL_WINDOW, Self::WINDOW_INCREMENT),
        }
    }

    /// Process received DATA cell; `true` means send a stream SENDME
    pub fn on_receive_data(&mut self) -> bool {
        let due = self.deliver.on_deliver();
        if due {
            log::debug!(
                "Stream {} deliver window hit threshold, sending SENDME",
                self.stream_id
            );
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_sendme_every_fifty_cells() {
        let mut fc = StreamFlowControl::new(1);
        let mut sendme_at = Vec::new();
        for cell in 1..=500u32 {
            if fc.on_receive_data() {
                sendme_at.push(cell);
            }
            assert!(fc.deliver.value() >= 450);
            assert!(fc.deliver.value() <= 500);
        }
        assert_eq!(sendme_at.len(), 10);
        assert_eq!(sendme_at[0], 50);
        assert!(sendme_at.windows(2).all(|w| w[1] - w[0] == 50));
    }

    #[test]
    fn test_circuit_sendme_every_hundred_cells() {
        let mut fc = CircuitFlowControl::new();
        let sendmes = (0..1000).filter(|_| fc.on_receive()).count();
        assert_eq!(sendmes, 10);
    }

    #[test]
    fn test_circuit_package_marks_every_hundredth_cell() {
        let mut fc = CircuitFlowControl::new();
        let marked: Vec<u32> = (1..=1000u32)
            .filter(|_| fc.on_package().unwrap())
            .collect();
        assert_eq!(marked, (1..=10).map(|n| n * 100).collect::<Vec<_>>());
        assert!(!fc.package.can_send());
        assert!(fc.on_package().is_err());
    }

    #[test]
    fn test_package_window() {
        let mut w = Window::new(2, 50);
        w.on_package().unwrap();
        w.on_package().unwrap();
        assert!(!w.can_send());
        assert!(w.on_package().is_err());
        w.on_sendme();
        assert_eq!(w.value(), 50);
    }
}
