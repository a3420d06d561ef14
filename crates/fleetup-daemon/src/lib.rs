//! The fleetup orchestrator daemon.
//!
//! Four loops run for the life of the process, all driven off one shared
//! [`state::DaemonState`]:
//!
//! - [`intake`] scans `queue/pending/`, validates and admits jobs, and feeds
//!   the worker pool;
//! - [`commands`] scans `commands/incoming/` and routes cancellations to
//!   in-flight workflows;
//! - [`pool`] executes job workflows on a bounded set of workers via the
//!   [`runner`];
//! - [`status_writer`] snapshots daemon and worker state to `status/`.
//!
//! Everything the daemon knows is reconstructible from the work directory:
//! on startup it garbage-collects temp files, resubmits whatever sits in
//! `queue/active/`, and continues as if it had never stopped.

pub mod commands;
pub mod intake;
pub mod pool;
pub mod runner;
pub mod state;
pub mod status_writer;
