//! npm-malwatch - Supply-chain behavior monitor for package installs
//!
//! This library records potentially dangerous host-API usage performed by
//! a package manager and the package code it executes: file I/O, process
//! spawning, DNS and network activity, attributed per package, with a
//! tamper-checked append-only JSONL log and post-run summaries.

pub mod aggregate;
pub mod attribution;
pub mod cli;
pub mod event;
pub mod hostapi;
pub mod orchestrator;
pub mod patch;
pub mod pkgid;
pub mod preflight;
pub mod preload;
pub mod registry;
pub mod roots;
pub mod sandbox;
pub mod session;
pub mod sink;
pub mod tamper;
