//! Request pipeline.
//!
//! One round issues every record once, in order. Signaled requests are
//! awaited before the next request is issued; unsignaled ones are left in
//! flight and retired by the next signaled completion, which the provider
//! reports only after everything posted before it.

use std::io;

use softverbs::{QueueSide, SendFlags};

use crate::clock::Clock;
use crate::config::{Mode, Verb};
use crate::error::{Error, Result};
use crate::poller::{PollStrategy, opcode_name, wait_completion};
use crate::request::RequestRecord;
use crate::transport::Transport;

/// Which requests of a round generate a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPolicy {
    /// Every request is signaled.
    EveryRequest,
    /// Every `n`-th request and the last one are signaled.
    Interval(usize),
}

impl SignalPolicy {
    pub fn for_mode(mode: Mode, signal_interval: usize) -> Self {
        match mode {
            Mode::Latency => SignalPolicy::EveryRequest,
            Mode::Throughput => SignalPolicy::Interval(signal_interval.max(1)),
        }
    }

    /// Whether request `n` of a `count`-request round is signaled.
    pub fn is_signaled(self, n: usize, count: usize) -> bool {
        match self {
            SignalPolicy::EveryRequest => true,
            SignalPolicy::Interval(interval) => n.is_multiple_of(interval) || n + 1 == count,
        }
    }
}

/// Result of one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundOutcome {
    /// Requests that failed to post or completed with an error.
    pub failures: u32,
    /// Requests handed to the provider.
    pub issued: u32,
}

impl RoundOutcome {
    /// Zero on full success, otherwise the negated failure count.
    pub fn status(&self) -> i64 {
        -(self.failures as i64)
    }

    pub fn is_success(&self) -> bool {
        self.failures == 0
    }
}

/// Wait for `wr_id` on `side`, counting every failed completion seen on the
/// way. Returns whether `wr_id` itself succeeded.
fn await_request<T, P>(
    transport: &T,
    side: QueueSide,
    wr_id: u64,
    poller: &mut P,
    failures: &mut u32,
) -> Result<bool>
where
    T: Transport,
    P: PollStrategy,
{
    loop {
        match wait_completion(transport, side, poller) {
            Ok(wc) if wc.wr_id == wr_id => return Ok(true),
            Ok(wc) => {
                tracing::debug!("completion for request {} while waiting for {}", wc.wr_id, wr_id);
            }
            Err(Error::Completion { wr_id: failed, .. }) => {
                *failures += 1;
                if failed == wr_id {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Issue primitives
// =============================================================================

/// Posts one request.
type IssueFn<T> = fn(&T, u64, &RequestRecord, SendFlags) -> io::Result<()>;

fn issue_send<T: Transport>(
    t: &T,
    wr_id: u64,
    rec: &RequestRecord,
    flags: SendFlags,
) -> io::Result<()> {
    t.post_send(wr_id, rec.sge(), flags)
}

fn issue_read<T: Transport>(
    t: &T,
    wr_id: u64,
    rec: &RequestRecord,
    flags: SendFlags,
) -> io::Result<()> {
    t.post_read(wr_id, rec.sge(), rec.remote(), flags)
}

fn issue_write<T: Transport>(
    t: &T,
    wr_id: u64,
    rec: &RequestRecord,
    flags: SendFlags,
) -> io::Result<()> {
    t.post_write(wr_id, rec.sge(), rec.remote(), flags)
}

/// Issue primitive for `verb`. `None` issues nothing.
fn issuer<T: Transport>(verb: Verb) -> Option<IssueFn<T>> {
    match verb {
        Verb::None => None,
        Verb::Send => Some(issue_send::<T>),
        Verb::Read => Some(issue_read::<T>),
        Verb::Write => Some(issue_write::<T>),
    }
}

/// Count the error completions already queued on `side`.
///
/// Successful unsignaled requests produce no completion, so this only
/// retires failures that are no longer covered by a signaled barrier.
fn drain_failures<T: Transport>(transport: &T, side: QueueSide) -> Result<u32> {
    let mut failures = 0;
    while let Some(wc) = transport.poll_cq(side).map_err(Error::Connection)? {
        if !wc.status.is_success() {
            tracing::error!(
                "Failed {} request {}: {}",
                opcode_name(wc.opcode),
                wc.wr_id,
                wc.status
            );
            failures += 1;
        }
    }
    Ok(failures)
}

// =============================================================================
// Rounds
// =============================================================================

/// Issue every record once and time the signaled ones.
///
/// The issue primitive is resolved once from the first record; a pool
/// carries a single verb. Per-request failures are counted and the round
/// goes on. A lost connection aborts the round with an error.
pub fn execute_round<T, C, P>(
    transport: &T,
    records: &mut [RequestRecord],
    policy: SignalPolicy,
    clock: &C,
    poller: &mut P,
) -> Result<RoundOutcome>
where
    T: Transport,
    C: Clock,
    P: PollStrategy,
{
    let count = records.len();
    let mut outcome = RoundOutcome::default();
    let Some(verb) = records.first().map(|r| r.verb) else {
        return Ok(outcome);
    };
    let Some(issue) = issuer::<T>(verb) else {
        tracing::warn!("Unrecognized request verb '{}', skipping round", verb);
        return Ok(outcome);
    };
    // Unsignaled requests issued since the last signaled completion.
    let mut uncovered = 0u32;

    for (n, rec) in records.iter_mut().enumerate() {
        debug_assert_eq!(rec.verb, verb, "mixed verbs in one round");
        rec.reset_timestamps();
        let wr_id = n as u64;
        let signaled = policy.is_signaled(n, count);
        let flags = if signaled {
            SendFlags::SIGNALED
        } else {
            SendFlags::empty()
        };

        let posted = issue(transport, wr_id, rec, flags);
        rec.start = clock.now();

        if let Err(source) = posted {
            let err = Error::Post {
                op: verb.as_str(),
                source,
            };
            if err.is_connection_lost() {
                return Err(err);
            }
            tracing::error!("request {}: {}", n, err);
            outcome.failures += 1;
            continue;
        }
        outcome.issued += 1;

        if !signaled {
            uncovered += 1;
            continue;
        }
        uncovered = 0;
        if await_request(
            transport,
            QueueSide::Send,
            wr_id,
            poller,
            &mut outcome.failures,
        )? {
            rec.end = Some(clock.now());
        }
    }

    // The final signaled post failed: no barrier retires the trailing
    // unsignaled requests, so collect their failures here rather than in
    // the next round.
    if uncovered > 0 {
        tracing::warn!("{} unsignaled requests left without a completion", uncovered);
        outcome.failures += drain_failures(transport, QueueSide::Send)?;
    }

    Ok(outcome)
}

/// Receive one message into every record, in order.
///
/// The passive side of a Send session. Timestamps bracket each receive.
pub fn receive_round<T, C, P>(
    transport: &T,
    records: &mut [RequestRecord],
    clock: &C,
    poller: &mut P,
) -> Result<RoundOutcome>
where
    T: Transport,
    C: Clock,
    P: PollStrategy,
{
    let mut outcome = RoundOutcome::default();

    for (n, rec) in records.iter_mut().enumerate() {
        rec.reset_timestamps();
        let wr_id = n as u64;
        if let Err(source) = transport.post_recv(wr_id, rec.sge()) {
            let err = Error::Post { op: "recv", source };
            if err.is_connection_lost() {
                return Err(err);
            }
            tracing::error!("Failed to recv messages: {}", err);
            outcome.failures += 1;
            continue;
        }
        rec.start = clock.now();
        outcome.issued += 1;

        if await_request(
            transport,
            QueueSide::Recv,
            wr_id,
            poller,
            &mut outcome.failures,
        )? {
            rec.end = Some(clock.now());
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::poller::BusySpin;
    use crate::test_utils::{MockRegion, MockTransport, StepClock};
    use softverbs::WcOpcode;

    fn pool(transport: &MockTransport, count: usize, verb: Verb) -> BufferPool<MockRegion> {
        BufferPool::allocate(transport, count, 8, 1, verb).unwrap()
    }

    #[test]
    fn test_interval_policy() {
        let policy = SignalPolicy::Interval(4);
        let signaled: Vec<usize> = (0..10).filter(|&n| policy.is_signaled(n, 10)).collect();
        assert_eq!(signaled, vec![0, 4, 8, 9]);
        assert!((0..10).all(|n| SignalPolicy::EveryRequest.is_signaled(n, 10)));
        assert_eq!(
            SignalPolicy::for_mode(Mode::Latency, 4),
            SignalPolicy::EveryRequest
        );
    }

    #[test]
    fn test_latency_round_signals_everything() {
        let transport = MockTransport::new();
        let mut pool = pool(&transport, 10, Verb::Write);
        let policy = SignalPolicy::for_mode(Mode::Latency, 4);

        let outcome = execute_round(
            &transport,
            pool.records_mut(),
            policy,
            &StepClock::new(10),
            &mut BusySpin,
        )
        .unwrap();

        assert_eq!(outcome.status(), 0);
        assert_eq!(outcome.issued, 10);
        assert!(pool.records().iter().all(|r| r.end.is_some()));
        assert!(pool.records().iter().all(|r| r.end.unwrap() > r.start));
        assert!(transport.posts().iter().all(|p| p.signaled));
    }

    #[test]
    fn test_throughput_round_signals_interval_and_last() {
        let transport = MockTransport::new();
        let mut pool = pool(&transport, 10, Verb::Write);
        let policy = SignalPolicy::for_mode(Mode::Throughput, 4);

        let outcome = execute_round(
            &transport,
            pool.records_mut(),
            policy,
            &StepClock::new(10),
            &mut BusySpin,
        )
        .unwrap();

        assert!(outcome.is_success());
        let ended: Vec<usize> = pool
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| r.end.is_some())
            .map(|(n, _)| n)
            .collect();
        assert_eq!(ended, vec![0, 4, 8, 9]);
        assert!(pool.records().iter().all(|r| r.start > 0));

        let signaled: Vec<u64> = transport
            .posts()
            .iter()
            .filter(|p| p.signaled)
            .map(|p| p.wr_id)
            .collect();
        assert_eq!(signaled, vec![0, 4, 8, 9]);
    }

    #[test]
    fn test_dispatch_by_verb() {
        let transport = MockTransport::new();
        let mut pool = pool(&transport, 2, Verb::Read);
        for rec in pool.records_mut() {
            rec.remote_addr = 0xdead_0000;
            rec.remote_key = 77;
        }
        execute_round(
            &transport,
            pool.records_mut(),
            SignalPolicy::EveryRequest,
            &StepClock::new(1),
            &mut BusySpin,
        )
        .unwrap();

        let posts = transport.posts();
        assert!(posts.iter().all(|p| p.opcode == WcOpcode::RdmaRead));
        let remote = posts[1].remote.unwrap();
        assert_eq!(remote.addr, 0xdead_0000);
        assert_eq!(remote.rkey, 77);
        assert_eq!(posts[1].sge.addr, pool.records()[1].addr);
        assert_eq!(posts[1].sge.len, 8);
    }

    #[test]
    fn test_failures_are_counted_and_round_continues() {
        let transport = MockTransport::new().fail_post(2).fail_completion(5);
        let mut pool = pool(&transport, 8, Verb::Write);

        let outcome = execute_round(
            &transport,
            pool.records_mut(),
            SignalPolicy::EveryRequest,
            &StepClock::new(1),
            &mut BusySpin,
        )
        .unwrap();

        assert_eq!(outcome.failures, 2);
        assert_eq!(outcome.status(), -2);
        assert_eq!(outcome.issued, 7);
        let r = pool.records();
        assert!(r[2].end.is_none());
        assert!(r[5].end.is_none());
        assert!(r[7].end.is_some());
    }

    #[test]
    fn test_unsignaled_failure_is_counted_before_barrier() {
        let transport = MockTransport::new().fail_completion(1);
        let mut pool = pool(&transport, 4, Verb::Write);

        let outcome = execute_round(
            &transport,
            pool.records_mut(),
            SignalPolicy::Interval(4),
            &StepClock::new(1),
            &mut BusySpin,
        )
        .unwrap();

        assert_eq!(outcome.failures, 1);
        assert!(pool.records()[3].end.is_some());
    }

    #[test]
    fn test_failed_final_post_drains_unsignaled_failures() {
        // 0 and 3 are signaled; 3 never reaches the queue.
        let transport = MockTransport::new().fail_completion(2).fail_post(3);
        let mut pool = pool(&transport, 4, Verb::Write);

        for _ in 0..2 {
            let outcome = execute_round(
                &transport,
                pool.records_mut(),
                SignalPolicy::Interval(4),
                &StepClock::new(1),
                &mut BusySpin,
            )
            .unwrap();
            assert_eq!(outcome.failures, 2);
            assert_eq!(outcome.issued, 3);
            assert!(transport.poll_cq(QueueSide::Send).unwrap().is_none());
        }
    }

    #[test]
    fn test_unrecognized_verb_issues_nothing() {
        let transport = MockTransport::new();
        let mut pool = pool(&transport, 4, Verb::None);

        let outcome = execute_round(
            &transport,
            pool.records_mut(),
            SignalPolicy::EveryRequest,
            &StepClock::new(1),
            &mut BusySpin,
        )
        .unwrap();
        assert_eq!(outcome.issued, 0);
        assert!(outcome.is_success());
        assert!(transport.posts().is_empty());
        assert!(pool.records().iter().all(|r| r.end.is_none()));
    }

    #[test]
    fn test_lost_connection_aborts_round() {
        let transport = MockTransport::new().abort_after_posts(3);
        let mut pool = pool(&transport, 8, Verb::Send);

        let err = execute_round(
            &transport,
            pool.records_mut(),
            SignalPolicy::EveryRequest,
            &StepClock::new(1),
            &mut BusySpin,
        )
        .unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(transport.posts().len(), 3);
    }

    #[test]
    fn test_receive_round() {
        let transport = MockTransport::new().fail_completion(1);
        let mut pool = pool(&transport, 3, Verb::Send);

        let outcome = receive_round(
            &transport,
            pool.records_mut(),
            &StepClock::new(1),
            &mut BusySpin,
        )
        .unwrap();
        assert_eq!(outcome.failures, 1);
        assert!(transport.posts().iter().all(|p| p.opcode == WcOpcode::Recv));
        assert!(pool.records()[0].end.is_some());
        assert!(pool.records()[1].end.is_none());
    }
}
