//! Ping-pong control benchmark.
//!
//! Each peer owns an inbound and an outbound single-request buffer. The
//! server writes a token into the client's inbound buffer and spins on its
//! own; the client spins, then answers with its own token. One iteration is
//! one round trip as seen from the server.
//!
//! The token is `{magic: u32 BE, index: u16 BE}` at the start of the request.

use softverbs::{QueueSide, SendFlags};

use crate::clock::{Clock, ClockRate};
use crate::config::{Role, SessionParams, Verb};
use crate::error::{Error, Result};
use crate::exchange::{exchange_mr_info, recv_message, send_message};
use crate::poller::{BusySpin, PollStrategy, wait_completion};
use crate::pool::BufferPool;
use crate::session::{SENTINEL, SENTINEL_WR_ID, connect};
use crate::stats::{Digest, LatencyReport};
use crate::transport::{RegisteredRegion, Transport};

pub const PINGPONG_MAGIC: u32 = 0xd1ce_fa11;

/// Encoded size of a token.
pub const TOKEN_LEN: usize = 6;

/// Inbound spins between two link checks.
const LINK_CHECK_SPINS: u32 = 1024;

pub fn encode_token(index: u16) -> [u8; TOKEN_LEN] {
    let mut buf = [0u8; TOKEN_LEN];
    buf[..4].copy_from_slice(&PINGPONG_MAGIC.to_be_bytes());
    buf[4..].copy_from_slice(&index.to_be_bytes());
    buf
}

/// Index carried by `buf`, if it starts with the magic.
pub fn decode_token(buf: &[u8]) -> Option<u16> {
    if buf.len() < TOKEN_LEN {
        return None;
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    (magic == PINGPONG_MAGIC).then(|| u16::from_be_bytes([buf[4], buf[5]]))
}

/// Result of a ping-pong run.
#[derive(Debug, Clone)]
pub struct PingPongOutcome {
    /// Server only: `(start, end)` ticks of every round trip.
    pub spans: Vec<(u64, u64)>,
    /// Server only.
    pub latency: Option<LatencyReport>,
    /// Digest over every outbound request as written.
    pub sent: Digest,
    /// Digest over every inbound request as received.
    pub received: Digest,
    pub clock_rate: ClockRate,
}

struct Endpoint<R: RegisteredRegion> {
    inbound: BufferPool<R>,
    outbound: BufferPool<R>,
    sent: Vec<Vec<u8>>,
    received: Vec<Vec<u8>>,
    interval: usize,
}

impl<R: RegisteredRegion> Endpoint<R> {
    /// Write token `n` to the peer's inbound buffer.
    fn write<T, P>(&mut self, transport: &T, n: usize, poller: &mut P) -> Result<()>
    where
        T: Transport<Region = R>,
        P: PollStrategy,
    {
        self.outbound.write_request(0, &encode_token(n as u16));
        self.sent.push(self.outbound.request_bytes(0));

        let rec = self.outbound.records()[0];
        let wr_id = n as u64;
        let signaled = n.is_multiple_of(self.interval);
        let flags = if signaled {
            SendFlags::SIGNALED
        } else {
            SendFlags::empty()
        };
        transport
            .post_write(wr_id, rec.sge(), rec.remote(), flags)
            .map_err(|source| Error::Post { op: "write", source })?;

        // Any failed write stalls the peer, so every error is fatal here.
        if signaled {
            loop {
                let wc = wait_completion(transport, QueueSide::Send, poller)?;
                if wc.wr_id == wr_id {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Spin until the peer's token lands in the inbound buffer, record it,
    /// and clear the buffer.
    fn wait<T: Transport<Region = R>>(&mut self, transport: &T, n: usize) -> Result<()> {
        let mut head = [0u8; 4];
        let magic = PINGPONG_MAGIC.to_be_bytes();
        let mut spins = 0u32;
        loop {
            self.inbound.read_request(0, &mut head);
            if head == magic {
                break;
            }
            spins += 1;
            if spins == LINK_CHECK_SPINS {
                spins = 0;
                // Nothing is ever posted on the receive side during the
                // loop; an error here means the peer is gone.
                transport
                    .poll_cq(QueueSide::Recv)
                    .map_err(Error::Connection)?;
            }
            std::hint::spin_loop();
        }

        // The magic may land before the rest of the write; wait for two
        // identical reads.
        let mut bytes = self.inbound.request_bytes(0);
        loop {
            let again = self.inbound.request_bytes(0);
            if again == bytes {
                break;
            }
            bytes = again;
        }
        match decode_token(&bytes) {
            Some(index) if index == n as u16 => {}
            Some(index) => tracing::warn!("token {} received in iteration {}", index, n),
            None => tracing::warn!("corrupt token in iteration {}", n),
        }
        self.received.push(bytes);
        self.inbound.fill_request(0, 0);
        Ok(())
    }
}

/// Run the ping-pong benchmark over an established connection.
pub fn run_pingpong_on<T, C, P>(
    transport: &T,
    role: &Role,
    params: &SessionParams,
    clock: &C,
    poller: &mut P,
) -> Result<PingPongOutcome>
where
    T: Transport,
    C: Clock,
    P: PollStrategy,
{
    if params.length < TOKEN_LEN {
        return Err(Error::InvalidConfig(format!(
            "ping-pong needs at least {} bytes per request, got {}",
            TOKEN_LEN, params.length
        )));
    }

    tracing::debug!("Allocating buffer ...");
    let inbound = BufferPool::allocate(transport, 1, params.length, 1, Verb::Write)?;
    inbound.fill_request(0, 0);
    let mut outbound = BufferPool::allocate(transport, 1, params.length, 1, Verb::Write)?;

    // Publish the inbound buffer, learn the peer's inbound buffer as the
    // outbound target.
    exchange_mr_info(transport, role, &inbound, outbound.records_mut(), poller)?;
    let target = outbound.records()[0];
    tracing::debug!(
        "out: remote addr = {:#x}, in: addr = {:#x}",
        target.remote_addr,
        inbound.records()[0].addr
    );

    let mut ep = Endpoint {
        inbound,
        outbound,
        sent: Vec::with_capacity(params.repeat),
        received: Vec::with_capacity(params.repeat),
        interval: params.signal_interval.max(1),
    };
    let mut spans = Vec::new();

    tracing::debug!("Sending RDMA writes ...");
    match role {
        Role::Server => {
            spans.reserve(params.repeat);
            for n in 0..params.repeat {
                let start = clock.now();
                ep.write(transport, n, poller)?;
                ep.wait(transport, n)?;
                spans.push((start, clock.now()));
            }
            tracing::debug!("Sending terminating message ...");
            send_message(transport, SENTINEL_WR_ID, SENTINEL, poller)?;
        }
        Role::Client { .. } => {
            for n in 0..params.repeat {
                ep.wait(transport, n)?;
                ep.write(transport, n, poller)?;
            }
            tracing::debug!("Waiting for end message ...");
            let end = recv_message(transport, SENTINEL_WR_ID, SENTINEL.len(), poller)?;
            if end.as_slice() != SENTINEL.as_slice() {
                return Err(Error::UnexpectedSentinel(end));
            }
        }
    }

    let rate = clock.rate();
    let latency = spans.first().and_then(|&(first_start, _)| {
        LatencyReport::from_spans(&spans, first_start, params.length, rate, params.time_budget_us)
    });
    if let Some(report) = &latency {
        report.log();
    }

    let sent = Digest::of_chunks(params.length, &ep.sent);
    let received = Digest::of_chunks(params.length, &ep.received);
    if role.is_client() {
        received.log("Client received");
        sent.log("Client sent");
    } else {
        sent.log("Server sent");
        received.log("Server received");
    }

    Ok(PingPongOutcome {
        spans,
        latency,
        sent,
        received,
        clock_rate: rate,
    })
}

/// Validate, connect, run ping-pong and disconnect.
pub fn run_pingpong<C: Clock>(
    role: &Role,
    params: &SessionParams,
    clock: &C,
) -> Result<PingPongOutcome> {
    params.validate()?;
    params.log();

    let conn = connect(role, params)?;
    let outcome = run_pingpong_on(&conn, role, params, clock, &mut BusySpin);

    tracing::debug!("Disconnecting");
    if let Err(e) = conn.disconnect() {
        tracing::warn!("disconnect failed: {}", e);
    }
    outcome
}
