//! Crate prelude

pub use crate::SimTime;

pub use crate::config::{ConfigError, DcfConfig};
pub use crate::error::{DropReason, Error};
pub use crate::frame::{Address, Frame, FrameKind, RxInfo};
pub use crate::mac::{Dcf, DcfStats, State as DcfState};
pub use crate::phy::{ChannelState, Phy, RadioState, SenseHandle, Signal};
pub use crate::timer::{Scheduler, TimerHandle, TimerKind};
pub use crate::upper::UpperLayer;
