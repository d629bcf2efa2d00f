//! # softverbs - verbs-shaped reliable connections over TCP
//!
//! This crate offers the small subset of the RDMA verbs model that a
//! point-to-point benchmark needs, emulated in software so it runs on any
//! host with a TCP stack:
//!
//! - **Memory Regions**: spans of local memory registered with access flags.
//!   Local operations name them by `lkey`, the peer by `rkey` plus address.
//! - **Send Queue**: bounded depth. Slots are reclaimed only when a signaled
//!   completion covering them is polled, so long runs of unsignaled requests
//!   eventually fail to post with `ENOMEM`.
//! - **Receive Queue**: posted buffers matched in order against inbound
//!   SENDs. A SEND that arrives before any receive is buffered until one is
//!   posted.
//! - **Completion Queues**: one for the send side, one for the receive side.
//!   Failed requests always produce a completion.
//!
//! A per-connection service thread plays the NIC: it performs inbound RDMA
//! WRITEs and READs directly on registered memory without involving the
//! application.
//!
//! ## Module Overview
//!
//! - [`connection`]: connection setup, posting and polling
//! - [`cq`]: completion types and send-queue accounting
//! - [`mr`]: Memory Regions and access flags

pub mod connection;
pub mod cq;
pub mod mr;
mod nic;
mod wire;

pub use connection::{Connection, ConnectionConfig, Listener, listen};
pub use cq::{QueueSide, SendFlags, WcOpcode, WcStatus, WorkCompletion};
pub use mr::{AccessFlags, MemoryRegion};
