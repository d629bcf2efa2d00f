//! MR addressing exchange.
//!
//! Before the first Read or Write round the requester must learn the address
//! and remote key of every peer request buffer. The transfer goes over the
//! data path as two SENDs: an 8-byte big-endian count, then `count` 12-byte
//! [`MrInfo`] records.
//!
//! Ordering is fixed per role so the peers never wait on each other: the
//! client sends its own info first and then receives, the server receives
//! first and then sends.

use softverbs::{AccessFlags, QueueSide, SendFlags};

use crate::config::Role;
use crate::error::{Error, Result};
use crate::poller::{PollStrategy, wait_completion};
use crate::pool::{BufferPool, PoolRegion, RegionBuffer};
use crate::request::RequestRecord;
use crate::transport::{LocalSge, RegisteredRegion, Transport};

/// Encoded size of one [`MrInfo`].
pub const MR_INFO_LEN: usize = 12;

const COUNT_LEN: usize = 8;

const COUNT_WR_ID: u64 = u64::MAX - 2;
const ARRAY_WR_ID: u64 = u64::MAX - 1;

/// Address and remote key of one request buffer, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrInfo {
    pub addr: u64,
    pub key: u32,
}

impl MrInfo {
    pub fn encode(&self) -> [u8; MR_INFO_LEN] {
        let mut buf = [0u8; MR_INFO_LEN];
        buf[..8].copy_from_slice(&self.addr.to_be_bytes());
        buf[8..].copy_from_slice(&self.key.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; MR_INFO_LEN]) -> Self {
        let mut addr = [0u8; 8];
        let mut key = [0u8; 4];
        addr.copy_from_slice(&buf[..8]);
        key.copy_from_slice(&buf[8..]);
        Self {
            addr: u64::from_be_bytes(addr),
            key: u32::from_be_bytes(key),
        }
    }
}

/// Encode the addressing of every local request.
pub fn encode_mr_infos<R: RegisteredRegion>(pool: &BufferPool<R>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(pool.len() * MR_INFO_LEN);
    for (i, rec) in pool.records().iter().enumerate() {
        let info = MrInfo {
            addr: rec.addr,
            key: pool.rkey_of(i),
        };
        buf.extend_from_slice(&info.encode());
    }
    buf
}

/// Store decoded peer addressing into the matching records.
pub fn decode_mr_infos(buf: &[u8], records: &mut [RequestRecord]) -> Result<()> {
    if buf.len() != records.len() * MR_INFO_LEN {
        return Err(Error::Handshake(format!(
            "expected {} bytes of MR info, got {}",
            records.len() * MR_INFO_LEN,
            buf.len()
        )));
    }
    for (chunk, rec) in buf.chunks_exact(MR_INFO_LEN).zip(records.iter_mut()) {
        let mut raw = [0u8; MR_INFO_LEN];
        raw.copy_from_slice(chunk);
        let info = MrInfo::decode(&raw);
        rec.remote_addr = info.addr;
        rec.remote_key = info.key;
    }
    Ok(())
}

/// A registered scratch buffer, released on every exit path.
fn control_buffer<T: Transport>(transport: &T, len: usize) -> Result<PoolRegion<T::Region>> {
    let buffer = RegionBuffer::zeroed(len)?;
    PoolRegion::register(transport, buffer, AccessFlags::LOCAL_WRITE, usize::MAX)
}

fn control_sge<R: RegisteredRegion>(region: &PoolRegion<R>, len: usize) -> LocalSge {
    LocalSge {
        addr: region.buffer().addr(),
        len: len as u32,
        lkey: region.lkey(),
    }
}

/// Send `bytes` as one message and wait for its completion.
pub(crate) fn send_message<T, P>(
    transport: &T,
    wr_id: u64,
    bytes: &[u8],
    poller: &mut P,
) -> Result<()>
where
    T: Transport,
    P: PollStrategy,
{
    let buf = control_buffer(transport, bytes.len())?;
    buf.buffer().write(0, bytes);
    transport
        .post_send(wr_id, control_sge(&buf, bytes.len()), SendFlags::SIGNALED)
        .map_err(|source| Error::Post { op: "send", source })?;
    let wc = wait_completion(transport, QueueSide::Send, poller)?;
    if wc.wr_id != wr_id {
        return Err(Error::Handshake(format!(
            "unexpected send completion {} while waiting for {}",
            wc.wr_id, wr_id
        )));
    }
    Ok(())
}

/// Receive one message of at most `len` bytes.
pub(crate) fn recv_message<T, P>(
    transport: &T,
    wr_id: u64,
    len: usize,
    poller: &mut P,
) -> Result<Vec<u8>>
where
    T: Transport,
    P: PollStrategy,
{
    let buf = control_buffer(transport, len)?;
    transport
        .post_recv(wr_id, control_sge(&buf, len))
        .map_err(|source| Error::Post { op: "recv", source })?;
    let wc = wait_completion(transport, QueueSide::Recv, poller)?;
    if wc.wr_id != wr_id {
        return Err(Error::Handshake(format!(
            "unexpected receive completion {} while waiting for {}",
            wc.wr_id, wr_id
        )));
    }
    Ok(buf.buffer().read(0, (wc.byte_len as usize).min(len)))
}

/// Send the addressing of every local request to the peer.
pub fn send_local_mr_info<T, P>(
    transport: &T,
    pool: &BufferPool<T::Region>,
    poller: &mut P,
) -> Result<()>
where
    T: Transport,
    P: PollStrategy,
{
    tracing::debug!("sending MR info for {} requests", pool.len());
    send_message(transport, COUNT_WR_ID, &(pool.len() as u64).to_be_bytes(), poller)?;
    send_message(transport, ARRAY_WR_ID, &encode_mr_infos(pool), poller)
}

/// Receive the peer's addressing into the remote fields of `records`.
///
/// The announced count must equal `records.len()`.
pub fn recv_remote_mr_info<T, P>(
    transport: &T,
    records: &mut [RequestRecord],
    poller: &mut P,
) -> Result<()>
where
    T: Transport,
    P: PollStrategy,
{
    let count = recv_message(transport, COUNT_WR_ID, COUNT_LEN, poller)?;
    let raw: [u8; COUNT_LEN] = count
        .as_slice()
        .try_into()
        .map_err(|_| Error::Handshake(format!("count message of {} bytes", count.len())))?;
    let remote = u64::from_be_bytes(raw);
    let local = records.len() as u64;
    if remote != local {
        tracing::error!(
            "Inconsistent request count: local {}, remote {}",
            local,
            remote
        );
        return Err(Error::CountMismatch { local, remote });
    }

    let array = recv_message(transport, ARRAY_WR_ID, records.len() * MR_INFO_LEN, poller)?;
    decode_mr_infos(&array, records)?;
    tracing::debug!("received MR info for {} requests", records.len());
    Ok(())
}

/// Bidirectional exchange: publish `local` and learn the peer's addressing
/// into `remote`.
pub fn exchange_mr_info<T, P>(
    transport: &T,
    role: &Role,
    local: &BufferPool<T::Region>,
    remote: &mut [RequestRecord],
    poller: &mut P,
) -> Result<()>
where
    T: Transport,
    P: PollStrategy,
{
    match role {
        Role::Client { .. } => {
            send_local_mr_info(transport, local, poller)?;
            recv_remote_mr_info(transport, remote, poller)
        }
        Role::Server => {
            recv_remote_mr_info(transport, remote, poller)?;
            send_local_mr_info(transport, local, poller)
        }
    }
}
