//! Benchmark session orchestration.
//!
//! A session is one connection, one buffer pool and `repeat` rounds. The
//! client drives every round and reports on it; the server is the responder.
//! After the last round the client sends [`SENTINEL`] and both sides log the
//! digest of their request buffers.

use softverbs::{Connection, ConnectionConfig};

use crate::clock::{Clock, ClockRate};
use crate::config::{MAX_WR, Mode, Role, SessionParams, Verb};
use crate::error::{Error, Result};
use crate::exchange::{recv_message, recv_remote_mr_info, send_local_mr_info, send_message};
use crate::pipeline::{RoundOutcome, SignalPolicy, execute_round, receive_round};
use crate::poller::{BusySpin, PollStrategy};
use crate::pool::BufferPool;
use crate::request::RequestRecord;
use crate::stats::{Digest, LatencyReport, ThroughputReport, log_raw_latencies};
use crate::transport::Transport;

/// Termination message sent by the client after the last round.
pub const SENTINEL: &[u8; 4] = b"End\0";

pub(crate) const SENTINEL_WR_ID: u64 = u64::MAX;

/// What one round produced.
#[derive(Debug, Clone)]
pub struct RoundReport {
    /// 1-based round number.
    pub round: usize,
    pub outcome: RoundOutcome,
    pub latency: Option<LatencyReport>,
    pub throughput: Option<ThroughputReport>,
    /// Snapshot of the records, timestamps included.
    pub records: Vec<RequestRecord>,
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Failed requests over all rounds.
    pub failures: u64,
    pub rounds: Vec<RoundReport>,
    pub digest: Digest,
    pub clock_rate: ClockRate,
}

impl SessionOutcome {
    /// Zero on success, otherwise the negated failure total clamped to the
    /// `i32` range.
    pub fn exit_status(&self) -> i32 {
        -(self.failures.min(i32::MAX as u64) as i32)
    }
}

fn connection_config(params: &SessionParams) -> ConnectionConfig {
    ConnectionConfig::default()
        .with_max_send_wr(MAX_WR)
        .with_max_recv_wr(MAX_WR)
        .with_tos(params.tos)
}

/// Establish the connection for `role`.
///
/// The server listens on `params.port` and accepts exactly one peer.
pub fn connect(role: &Role, params: &SessionParams) -> Result<Connection> {
    let config = connection_config(params);
    match role {
        Role::Client { host } => {
            tracing::info!("Connecting to {}:{} ...", host, params.port);
            Connection::connect(host, params.port, &config).map_err(Error::Connection)
        }
        Role::Server => {
            tracing::info!("Running in server mode, listening on port {} ...", params.port);
            let (_listener, conn) =
                softverbs::listen(params.port, &config).map_err(Error::Connection)?;
            tracing::info!("Accepted connection from {}", conn.peer_addr());
            Ok(conn)
        }
    }
}

/// Active side: issue and time every round, then send the sentinel.
pub fn run_client<T, C, P>(
    transport: &T,
    params: &SessionParams,
    clock: &C,
    poller: &mut P,
) -> Result<SessionOutcome>
where
    T: Transport,
    C: Clock,
    P: PollStrategy,
{
    let mut pool = BufferPool::allocate(
        transport,
        params.count,
        params.length,
        params.mr_count,
        params.verb,
    )?;

    if params.verb.requires_remote_addressing() {
        tracing::debug!("Getting remote MR info ...");
        recv_remote_mr_info(transport, pool.records_mut(), poller)?;
    }

    let policy = SignalPolicy::for_mode(params.mode, params.signal_interval);
    let rate = clock.rate();
    let mut rounds = Vec::with_capacity(params.repeat);
    let mut failures = 0u64;

    for n in 0..params.repeat {
        tracing::info!("Round {}.", n + 1);
        tracing::info!("Sending and waiting for {} requests ...", params.verb);
        let outcome = execute_round(transport, pool.records_mut(), policy, clock, poller)?;
        if !outcome.is_success() {
            tracing::error!("{} of {} requests failed", outcome.failures, params.count);
        }
        failures += u64::from(outcome.failures);

        let records = pool.records();
        if params.verbose {
            log_raw_latencies(records, params.warmup_count, rate);
        }
        let (latency, throughput) = match params.mode {
            Mode::Latency => {
                let report = LatencyReport::from_requests(
                    records,
                    params.warmup_count,
                    rate,
                    params.time_budget_us,
                );
                match &report {
                    Some(r) => r.log(),
                    None => tracing::warn!("No completed requests to report"),
                }
                (report, None)
            }
            Mode::Throughput => {
                let report = ThroughputReport::from_requests(
                    records,
                    params.warmup_count,
                    params.length,
                    rate,
                );
                match &report {
                    Some(r) => r.log(),
                    None => tracing::warn!("Last request did not complete, no throughput"),
                }
                (None, report)
            }
        };

        rounds.push(RoundReport {
            round: n + 1,
            outcome,
            latency,
            throughput,
            records: records.to_vec(),
        });
    }

    tracing::debug!("Sending terminating message ...");
    send_message(transport, SENTINEL_WR_ID, SENTINEL, poller)?;

    let digest = Digest::of_requests(&pool);
    digest.log("Client");
    let failed_release = pool.release();
    if failed_release > 0 {
        tracing::warn!("{} regions failed to deregister", failed_release);
    }

    Ok(SessionOutcome {
        failures,
        rounds,
        digest,
        clock_rate: rate,
    })
}

/// Passive side: publish addressing, answer every round, await the sentinel.
pub fn run_server<T, C, P>(
    transport: &T,
    params: &SessionParams,
    clock: &C,
    poller: &mut P,
) -> Result<SessionOutcome>
where
    T: Transport,
    C: Clock,
    P: PollStrategy,
{
    let mut pool = BufferPool::allocate(
        transport,
        params.count,
        params.length,
        params.mr_count,
        params.verb,
    )?;

    if params.verb.requires_remote_addressing() {
        tracing::debug!("Sending local MR info ...");
        send_local_mr_info(transport, &pool, poller)?;
    }

    let mut rounds = Vec::with_capacity(params.repeat);
    let mut failures = 0u64;

    for n in 0..params.repeat {
        tracing::info!("Round {}.", n + 1);
        let outcome = match params.verb {
            Verb::Send => receive_round(transport, pool.records_mut(), clock, poller)?,
            Verb::Read | Verb::Write => RoundOutcome::default(),
            Verb::None => {
                tracing::warn!("Unrecognized verb on server side: {}", params.verb);
                RoundOutcome::default()
            }
        };
        failures += u64::from(outcome.failures);
        rounds.push(RoundReport {
            round: n + 1,
            outcome,
            latency: None,
            throughput: None,
            records: pool.records().to_vec(),
        });
    }

    tracing::debug!("Waiting for end message ...");
    let end = recv_message(transport, SENTINEL_WR_ID, SENTINEL.len(), poller)?;
    if end.as_slice() != SENTINEL.as_slice() {
        return Err(Error::UnexpectedSentinel(end));
    }

    let digest = Digest::of_requests(&pool);
    digest.log("Server");
    let failed_release = pool.release();
    if failed_release > 0 {
        tracing::warn!("{} regions failed to deregister", failed_release);
    }

    Ok(SessionOutcome {
        failures,
        rounds,
        digest,
        clock_rate: clock.rate(),
    })
}

/// Validate, connect, run the role's side of the session and disconnect.
pub fn run<C: Clock>(role: &Role, params: &SessionParams, clock: &C) -> Result<SessionOutcome> {
    params.validate()?;
    params.log();

    let conn = connect(role, params)?;
    let mut poller = BusySpin;
    let outcome = match role {
        Role::Client { .. } => run_client(&conn, params, clock, &mut poller),
        Role::Server => run_server(&conn, params, clock, &mut poller),
    };

    tracing::debug!("Disconnecting");
    if let Err(e) = conn.disconnect() {
        tracing::warn!("disconnect failed: {}", e);
    }
    outcome
}
