//! Integration test suite for the orchestration engine.
//!
//! These tests exercise the full engine through its public handle:
//! mutations, orchestrated runs, the change stream, undo/redo, and
//! remote reconciliation working together.
//!
//! # Test Categories
//!
//! - `orchestration_flow`: run lifecycle, dispatch bound, stop semantics
//! - `stream_consistency`: snapshot+patch reconstruction and ordering
//! - `undo_redo`: history round-trips through the live engine
//! - `remote_sync`: mutation forwarding and conflict strategies
//!
//! # CI Compatibility
//!
//! All executors are in-process (no shell commands are spawned), making
//! the suite safe and fast in CI environments.


mod orchestration_flow;
mod remote_sync;
mod stream_consistency;
mod undo_redo;
