//! Gangway attaches client terminals to cluster-hosted apps. It keeps one
//! reference-counted session per app, starts the backing instance when the
//! first client attaches, stops it when the last one detaches, and bridges
//! terminal I/O in between.

pub mod bridge;
pub mod control;
pub mod exec;
pub mod gate;
pub mod lifecycle;
pub mod session;
pub mod telemetry;
