//! rmaperf - Point-to-point remote memory access benchmarking engine.
//!
//! # Architecture
//!
//! ```text
//!      client (requester)                         server (responder)
//! ┌──────────────────────────┐              ┌──────────────────────────┐
//! │ BufferPool               │              │ BufferPool               │
//! │  mr_count regions        │  MR info     │  mr_count regions        │
//! │  count RequestRecords  ◄─┼──────────────┼─ count x {addr, rkey}    │
//! │                          │              │                          │
//! │ execute_round ───────────┼─ READ/WRITE ─┼─► (passive)              │
//! │               ───────────┼─ SEND ───────┼─► receive_round          │
//! │ LatencyReport /          │              │                          │
//! │ ThroughputReport         │              │                          │
//! │ "End\0" ─────────────────┼──────────────┼─► sentinel check         │
//! │ Digest                   │              │ Digest                   │
//! └──────────────────────────┘              └──────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: session parameters and the operation kinds
//! - [`transport`]: the connection provider seam, implemented by `softverbs`
//! - [`pool`]: registered request buffers
//! - [`exchange`]: MR addressing exchange over the data path
//! - [`pipeline`]: issuing a round and collecting completions
//! - [`poller`]: completion polling strategies
//! - [`stats`]: latency, throughput and digest reports
//! - [`session`]: client and server orchestration
//! - [`pingpong`]: WRITE ping-pong control benchmark
//! - [`clock`]: timestamp sources

pub mod clock;
pub mod config;
pub mod error;
pub mod exchange;
pub mod pingpong;
pub mod pipeline;
pub mod poller;
pub mod pool;
pub mod request;
pub mod session;
pub mod stats;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use clock::{Clock, ClockRate, MonotonicClock};
#[cfg(target_arch = "x86_64")]
pub use clock::TscClock;
pub use config::{Direction, MAX_WR, Mode, Role, SessionParams, Verb};
pub use error::{Error, Result};
pub use pingpong::{PingPongOutcome, run_pingpong, run_pingpong_on};
pub use pipeline::{RoundOutcome, SignalPolicy, execute_round, receive_round};
pub use poller::{BusySpin, PollStrategy, SpinThenYield};
pub use pool::BufferPool;
pub use request::RequestRecord;
pub use session::{RoundReport, SENTINEL, SessionOutcome, connect, run, run_client, run_server};
pub use stats::{Digest, LatencyReport, ThroughputReport};
pub use transport::{LocalSge, RegisteredRegion, RemoteAddr, Transport};
