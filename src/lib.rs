//! labsync: remote observation and control of an experiment rig.
//!
//! The relay server lives in [`server`]; [`runner`] drives an experiment or
//! web endpoint from the command line. The synchronization protocol itself is
//! in the `labsync-core` crate.

pub mod config;
pub mod runner;
pub mod server;
