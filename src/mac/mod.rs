//! Medium Access Control (MAC) layer module.
//! Contains the MAC protocol machines.

pub mod dcf;

pub use dcf::{Dcf, DcfStats, State};
