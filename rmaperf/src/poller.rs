//! Completion polling.

use softverbs::{QueueSide, WcOpcode, WorkCompletion};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// What to do between empty polls.
pub trait PollStrategy {
    /// Called once per empty poll.
    fn idle(&mut self);

    /// Called before each new wait.
    fn reset(&mut self) {}
}

/// Pure busy-wait. Never sleeps or yields, so the measured latency is not
/// inflated by the scheduler.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusySpin;

impl PollStrategy for BusySpin {
    #[inline]
    fn idle(&mut self) {
        std::hint::spin_loop();
    }
}

/// Spin for a bounded number of polls, then yield the CPU on every further
/// empty poll.
#[derive(Debug, Clone, Copy)]
pub struct SpinThenYield {
    spins: u32,
    limit: u32,
}

impl SpinThenYield {
    pub fn new(limit: u32) -> Self {
        Self { spins: 0, limit }
    }
}

impl Default for SpinThenYield {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PollStrategy for SpinThenYield {
    fn idle(&mut self) {
        if self.spins < self.limit {
            self.spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
    }
}

pub(crate) fn opcode_name(opcode: WcOpcode) -> &'static str {
    match opcode {
        WcOpcode::Send => "send",
        WcOpcode::RdmaWrite => "write",
        WcOpcode::RdmaRead => "read",
        WcOpcode::Recv => "recv",
    }
}

/// Block until exactly one completion is available on `side`.
///
/// A completion with an error status is logged and returned as
/// [`Error::Completion`]. A provider error means the connection is gone and
/// is returned as [`Error::Connection`].
pub fn wait_completion<T, P>(
    transport: &T,
    side: QueueSide,
    poller: &mut P,
) -> Result<WorkCompletion>
where
    T: Transport,
    P: PollStrategy,
{
    poller.reset();
    loop {
        match transport.poll_cq(side) {
            Ok(Some(wc)) if wc.status.is_success() => return Ok(wc),
            Ok(Some(wc)) => {
                let op = opcode_name(wc.opcode);
                tracing::error!("Failed {} request {}: {}", op, wc.wr_id, wc.status);
                return Err(Error::Completion {
                    op,
                    wr_id: wc.wr_id,
                    status: wc.status,
                });
            }
            Ok(None) => poller.idle(),
            Err(e) => return Err(Error::Connection(e)),
        }
    }
}
