//! Shared configuration and frame-file naming for the time-lapse rig.

pub mod config;
pub mod frame;
