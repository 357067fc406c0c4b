//! Forwarding of baseband data rate changes to whatever programs the FPGA PLLs.
//!
//! This crate does not know how to compute PLL coefficients. It turns a rate change into a
//! [`PllRequest`] and hands it to the [`PllProgrammer`] installed on the connection, together
//! with exclusive access to the control endpoints.

use crate::{
    connection::ControlPort,
    core::{
        ConnectionResult,
        Error,
    },
};

/// A request to retune the FPGA interface clocks of one channel
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PllRequest {
    pub channel: usize,
    /// Which FPGA PLL serves this channel
    pub pll_index: u8,
    /// Transmit interface clock in Hz
    pub tx_interface_clk: f64,
    /// Receive interface clock in Hz
    pub rx_interface_clk: f64,
    /// Transmit clock phase in degrees, `None` lets the programmer pick
    pub tx_phase: Option<f64>,
    /// Receive clock phase in degrees, `None` lets the programmer pick
    pub rx_phase: Option<f64>,
}

impl PllRequest {
    /// Build the request for sample rates `tx_rate` and `rx_rate` (in samples per second).
    /// The interface moves two words per sample, so the clocks run at twice the sample rate.
    /// # Errors
    /// Returns [`Error::InvalidRate`] if either rate isn't finite and positive
    pub fn new(channel: usize, tx_rate: f64, rx_rate: f64) -> ConnectionResult<Self> {
        let valid = |rate: f64| rate.is_finite() && rate > 0.0;
        if !valid(tx_rate) || !valid(rx_rate) {
            return Err(Error::InvalidRate {
                tx: tx_rate,
                rx: rx_rate,
            });
        }
        Ok(Self {
            channel,
            pll_index: if channel == 1 { 2 } else { 0 },
            tx_interface_clk: 2.0 * tx_rate,
            rx_interface_clk: 2.0 * rx_rate,
            tx_phase: None,
            rx_phase: None,
        })
    }

    #[must_use]
    pub fn with_phase(mut self, tx_phase: f64, rx_phase: f64) -> Self {
        self.tx_phase = Some(tx_phase);
        self.rx_phase = Some(rx_phase);
        self
    }
}

/// Programs the FPGA PLLs for a rate change. Implementations talk to the board only through the
/// given [`ControlPort`], which holds the control lock for the whole call.
pub trait PllProgrammer: Send {
    /// # Errors
    /// Returns whatever went wrong talking to the board
    fn program(&mut self, port: &mut ControlPort<'_>, request: &PllRequest) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_clocks() {
        let req = PllRequest::new(0, 10e6, 5e6).unwrap();
        assert_eq!(req.pll_index, 0);
        assert!((req.tx_interface_clk - 20e6).abs() < f64::EPSILON);
        assert!((req.rx_interface_clk - 10e6).abs() < f64::EPSILON);
        assert_eq!(req.tx_phase, None);
    }

    #[test]
    fn test_second_channel_pll() {
        let req = PllRequest::new(1, 1e6, 1e6).unwrap().with_phase(90.0, 45.0);
        assert_eq!(req.pll_index, 2);
        assert_eq!(req.tx_phase, Some(90.0));
        assert_eq!(req.rx_phase, Some(45.0));
    }

    #[test]
    fn test_bad_rates() {
        assert!(matches!(
            PllRequest::new(0, 0.0, 1e6),
            Err(Error::InvalidRate { .. })
        ));
        assert!(PllRequest::new(0, 1e6, f64::NAN).is_err());
        assert!(PllRequest::new(0, -1.0, 1e6).is_err());
    }
}
