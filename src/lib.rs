//! Wireless MAC simulation models.
//!
//! This crate provides medium-access-control protocol machines as plugins
//! for an external discrete-event simulation host. The host owns event
//! scheduling and message transport; the machines here are pure reactive
//! handlers over injected collaborator traits ([`phy::Phy`],
//! [`timer::Scheduler`], [`upper::UpperLayer`]) and never block: every wait
//! is a scheduled wake-up.
//!
//! The core model is [`mac::Dcf`], an 802.11-style distributed coordination
//! function with virtual carrier sensing (NAV), binary-exponential backoff
//! and adaptive link-rate selection.

pub mod frame;

pub mod queue;

pub mod backoff;

pub mod nav;

pub mod neighbors;

pub mod config;

pub mod error;

pub mod phy;

pub mod timer;

pub mod upper;

pub mod mac;

pub mod prelude;

/// Simulated time, in seconds since the start of the simulation
pub type SimTime = f64;
