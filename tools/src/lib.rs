//! Introspection and simulation tools for the ricochet transport.
//!
//! This crate provides utilities for understanding what goes over the wire:
//!
//! - Decode and print captured datagrams command by command
//! - Run two hosts over a lossy simulated network and report delivery
//!
//! # Design Principles
//!
//! - **First-class tooling** - These tools are part of the product, not afterthoughts.
//! - **Machine- and human-readable output** - Every report serializes to JSON
//!   and has a terminal rendering.

mod inspect;
mod simulate;

pub use inspect::{format_pretty, inspect_datagram, CommandReport, HeaderReport, InspectReport};
pub use simulate::{simulate, SimulationConfig, SimulationReport};
