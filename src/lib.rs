//! Connection-oriented BLE link layer for a TI-style RF core.
//!
//! This crate drives a packet radio through the advertising, initiating and
//! established-connection roles, scheduling every radio operation against the
//! radio's free-running timer. It owns the data-channel hopping, the pending
//! link-control updates (connection parameters, channel map), and the
//! single-outstanding-command gate that bridges task-level callers to the
//! completion interrupts.
//!
//! Hardware access goes through the [`hal::RadioHal`] trait: command
//! construction is opaque to this crate, and the embedding supplies the
//! doorbell, interrupt mask and one-shot timer plumbing. All scheduling and
//! protocol logic therefore runs unchanged under a mock radio on the host.
//!
//! The embedding wires three entry points to its interrupt handlers and
//! background task:
//!
//! - [`controller::LinkLayer::timer_fired`] from the one-shot timer interrupt,
//! - [`controller::LinkLayer::radio_irq`] from the radio interrupt,
//! - [`controller::LinkLayer::process`] from the cooperative background task.

#![no_std]

#[macro_use]
mod fmt;

pub mod adv;
pub mod channel;
pub mod conn;
pub mod controller;
pub mod dispatch;
pub mod hal;
pub mod initiator;
pub mod llcp;
pub mod ring;
pub mod timebase;
pub mod types;

pub use controller::{Config, LinkLayer};
pub use hal::RadioHal;
pub use types::{ConnHandle, DeviceAddress, Error, EventSink, LinkEvent, RadioResult};
