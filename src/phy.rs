//! Physical-layer capability interface.
//!
//! The MAC talks to whatever PHY model the host wired in at construction
//! through this small trait. Sensing and transmission are asynchronous:
//! the host later delivers their outcomes back into the MAC's handlers
//! (`handle_sense_result`, `handle_tx_complete`, `handle_switch_complete`).

use crate::frame::Frame;
use crate::SimTime;

/// Carrier state reported by clear-channel assessment
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ChannelState {
    Idle,
    Busy,
}

impl ChannelState {
    pub fn is_idle(&self) -> bool {
        *self == ChannelState::Idle
    }
}

/// Radio operating mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum RadioState {
    Rx,
    Tx,
    Sleep,
}

/// Transmission parameters handed to the PHY together with a frame
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Signal {
    /// Transmission start time
    pub start: SimTime,
    /// Airtime of the frame at `bitrate`
    pub duration: SimTime,
    /// Transmit power, mW
    pub power: f64,
    /// Payload bitrate, bit/s; the receiving PHY demodulates with this
    pub bitrate: f64,
}

/// Handle identifying an outstanding channel sense request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenseHandle(pub u64);

/// PHY collaborator interface, implemented per physical-layer variant and
/// injected at MAC construction
pub trait Phy {
    /// Instantaneous clear-channel assessment
    fn channel_state(&mut self) -> ChannelState;

    fn radio_state(&self) -> RadioState;

    /// Request a radio mode change; the host reports completion through the
    /// MAC's `handle_switch_complete`
    fn set_radio_state(&mut self, state: RadioState);

    /// Start sensing the channel. The host answers through the MAC's
    /// `handle_sense_result` when the channel turns busy or `timeout`
    /// elapses idle, whichever comes first.
    fn sense(&mut self, timeout: SimTime) -> SenseHandle;

    /// Withdraw an outstanding sense request; its result is never delivered
    fn cancel_sense(&mut self, handle: SenseHandle);

    /// Put a frame on the air with the given signal parameters. The host
    /// reports completion through the MAC's `handle_tx_complete`.
    fn transmit(&mut self, frame: Frame, signal: Signal);
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};
    use std::vec::Vec;

    use super::*;

    /// Operations a [`MockPhy`] records for later assertion
    #[derive(Clone, Debug, PartialEq)]
    pub enum PhyOp {
        Sense(SimTime),
        CancelSense(SenseHandle),
        SetRadioState(RadioState),
        Transmit(Frame, Signal),
    }

    #[derive(Debug)]
    struct Inner {
        channel: ChannelState,
        radio: RadioState,
        next_handle: u64,
        last_sense: Option<SenseHandle>,
        ops: Vec<PhyOp>,
    }

    /// Mock PHY recording every operation; clones share state so tests can
    /// inspect what the MAC did
    #[derive(Clone, Debug)]
    pub struct MockPhy(Arc<Mutex<Inner>>);

    impl MockPhy {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Inner {
                channel: ChannelState::Idle,
                radio: RadioState::Rx,
                next_handle: 1,
                last_sense: None,
                ops: Vec::new(),
            })))
        }

        pub fn set_channel(&self, state: ChannelState) {
            self.0.lock().unwrap().channel = state;
        }

        /// Handle of the most recently issued sense request
        pub fn last_sense(&self) -> Option<SenseHandle> {
            self.0.lock().unwrap().last_sense
        }

        /// Drain the recorded operations
        pub fn take_ops(&self) -> Vec<PhyOp> {
            std::mem::take(&mut self.0.lock().unwrap().ops)
        }

        /// Drain only the recorded transmissions
        pub fn take_transmissions(&self) -> Vec<(Frame, Signal)> {
            self.take_ops()
                .into_iter()
                .filter_map(|op| match op {
                    PhyOp::Transmit(frame, signal) => Some((frame, signal)),
                    _ => None,
                })
                .collect()
        }
    }

    impl Phy for MockPhy {
        fn channel_state(&mut self) -> ChannelState {
            self.0.lock().unwrap().channel
        }

        fn radio_state(&self) -> RadioState {
            self.0.lock().unwrap().radio
        }

        fn set_radio_state(&mut self, state: RadioState) {
            let mut inner = self.0.lock().unwrap();
            inner.radio = state;
            inner.ops.push(PhyOp::SetRadioState(state));
        }

        fn sense(&mut self, timeout: SimTime) -> SenseHandle {
            let mut inner = self.0.lock().unwrap();
            let handle = SenseHandle(inner.next_handle);
            inner.next_handle += 1;
            inner.last_sense = Some(handle);
            inner.ops.push(PhyOp::Sense(timeout));
            handle
        }

        fn cancel_sense(&mut self, handle: SenseHandle) {
            self.0.lock().unwrap().ops.push(PhyOp::CancelSense(handle));
        }

        fn transmit(&mut self, frame: Frame, signal: Signal) {
            self.0.lock().unwrap().ops.push(PhyOp::Transmit(frame, signal));
        }
    }
}
