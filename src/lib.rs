//! hp_tapelib - HP magnetic-tape controller core and HP-3000 host interface shim.
//!
//! [`controller::Controller`] models the command/phase state machine shared by
//! the NRZI-1000, PE-1000, HP-3000, and HP-IB tape controller variants,
//! against a pluggable [`backend::TapeBackend`] tape image. [`shim::Hp3000Shim`]
//! wraps one `Controller` with the HP-3000 channel's fixed signal protocol.

pub mod backend;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod crc;
pub mod drive;
pub mod error;
pub mod opcode;
pub mod scheduler;
pub mod shim;
pub mod status;
pub mod timing;
