//! Reliable connections.
//!
//! A [`Connection`] plays the role of a connected Queue Pair together with its
//! send and receive Completion Queues. Work requests are validated and framed
//! on the caller's thread; a per-connection service thread handles everything
//! that arrives from the peer.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::sys::socket::{setsockopt, sockopt};

use crate::cq::{QueueSide, SendFlags, WcOpcode, WcStatus, WorkCompletion};
use crate::mr::{AccessFlags, MemoryRegion, RegionEntry};
use crate::nic::{self, NicState, PendingRead, PostedRecv};
use crate::wire::{Frame, HELLO_MAGIC, MAX_PAYLOAD};

/// Queue depths and link options.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Send queue depth. Posting beyond it fails with `ENOMEM`.
    pub max_send_wr: usize,
    /// Maximum number of outstanding posted receives.
    pub max_recv_wr: usize,
    /// IPv4 type-of-service byte applied to the link.
    pub tos: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 1000,
            max_recv_wr: 1000,
            tos: 0,
        }
    }
}

impl ConnectionConfig {
    pub fn with_max_send_wr(mut self, depth: usize) -> Self {
        self.max_send_wr = depth;
        self
    }

    pub fn with_max_recv_wr(mut self, depth: usize) -> Self {
        self.max_recv_wr = depth;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }
}

pub(crate) struct Shared {
    state: Mutex<NicState>,
    writer: Mutex<TcpStream>,
}

impl Shared {
    pub(crate) fn state(&self) -> MutexGuard<'_, NicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn send_frame(&self, frame: &Frame) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        frame.write_to(&mut *writer)
    }

    fn shutdown_link(&self) {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.shutdown(Shutdown::Both)
            && e.kind() != io::ErrorKind::NotConnected
        {
            tracing::debug!("socket shutdown failed: {}", e);
        }
    }
}

/// A connected endpoint.
pub struct Connection {
    shared: Arc<Shared>,
    peer: SocketAddr,
    service: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connect to a listening peer.
    pub fn connect(host: &str, port: u16, config: &ConnectionConfig) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        Self::from_stream(stream, config)
    }

    fn from_stream(mut stream: TcpStream, config: &ConnectionConfig) -> io::Result<Self> {
        if config.max_send_wr == 0 || config.max_recv_wr == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "queue depths must be non-zero",
            ));
        }
        stream.set_nodelay(true)?;
        if config.tos != 0 {
            setsockopt(&stream, sockopt::IpTos, &(config.tos as i32)).map_err(io::Error::from)?;
        }

        Frame::Hello { magic: HELLO_MAGIC }.write_to(&mut stream)?;
        match Frame::read_from(&mut stream)? {
            Frame::Hello { magic } if magic == HELLO_MAGIC => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad handshake from peer: {:?}", other),
                ));
            }
        }

        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(NicState::new(config.max_send_wr, config.max_recv_wr)),
            writer: Mutex::new(stream),
        });
        let service = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("softverbs-nic".into())
                .spawn(move || nic::run(shared, reader))?
        };
        tracing::debug!(%peer, tos = config.tos, "connection established");

        Ok(Self {
            shared,
            peer,
            service: Some(service),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Register a Memory Region.
    ///
    /// # Safety
    /// - `addr` must point to `len` bytes of memory that stay valid for as
    ///   long as the returned region is registered.
    /// - While registered, the memory may be written by the service thread
    ///   (inbound writes, receives, read responses) when `access` allows it.
    ///   The caller must not hold references into it across such operations.
    pub unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        if addr.is_null() || len == 0 {
            return Err(Errno::EINVAL.into());
        }
        if access.contains(AccessFlags::REMOTE_WRITE) && !access.contains(AccessFlags::LOCAL_WRITE)
        {
            return Err(Errno::EINVAL.into());
        }
        let addr = addr as u64;
        let key = self.shared.state().regions.insert(RegionEntry { addr, len, access });
        tracing::trace!(key, addr, len, ?access, "registered MR");
        Ok(MemoryRegion::new(
            Arc::clone(&self.shared),
            key,
            addr,
            len,
            access,
        ))
    }

    /// Number of currently registered regions.
    pub fn region_count(&self) -> usize {
        self.shared.state().regions.len()
    }

    /// Post a SEND of `[addr, addr + len)`.
    pub fn post_send(
        &self,
        wr_id: u64,
        addr: u64,
        len: u32,
        lkey: u32,
        flags: SendFlags,
    ) -> io::Result<()> {
        self.post_outbound(wr_id, WcOpcode::Send, addr, len, lkey, flags, |token, payload| {
            Frame::Send { token, payload }
        })
    }

    /// Post an RDMA WRITE of local `[addr, addr + len)` to `remote_addr`.
    #[allow(clippy::too_many_arguments)]
    pub fn post_write(
        &self,
        wr_id: u64,
        addr: u64,
        len: u32,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        flags: SendFlags,
    ) -> io::Result<()> {
        self.post_outbound(
            wr_id,
            WcOpcode::RdmaWrite,
            addr,
            len,
            lkey,
            flags,
            |token, payload| Frame::Write {
                token,
                remote_addr,
                rkey,
                payload,
            },
        )
    }

    /// Post an RDMA READ of `len` bytes at `remote_addr` into local `addr`.
    #[allow(clippy::too_many_arguments)]
    pub fn post_read(
        &self,
        wr_id: u64,
        addr: u64,
        len: u32,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        flags: SendFlags,
    ) -> io::Result<()> {
        check_len(len)?;
        let frame = {
            let mut guard = self.shared.state();
            let st = &mut *guard;
            if st.link_down {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }
            if st.sq.is_full() {
                return Err(Errno::ENOMEM.into());
            }
            let token = st
                .sq
                .push(wr_id, WcOpcode::RdmaRead, flags.contains(SendFlags::SIGNALED));
            if let Err(fault) = st
                .regions
                .check(lkey, addr, len as usize, AccessFlags::LOCAL_WRITE)
            {
                tracing::debug!(lkey, addr, ?fault, "rejected local READ target");
                st.complete_send(token, WcStatus::LocalProtectionError, 0);
                return Ok(());
            }
            st.pending_reads
                .insert(token, PendingRead { addr, len, lkey });
            Frame::ReadRequest {
                token,
                remote_addr,
                rkey,
                len,
            }
        };
        self.shared.send_frame(&frame)
    }

    #[allow(clippy::too_many_arguments)]
    fn post_outbound(
        &self,
        wr_id: u64,
        opcode: WcOpcode,
        addr: u64,
        len: u32,
        lkey: u32,
        flags: SendFlags,
        build: impl FnOnce(u64, Vec<u8>) -> Frame,
    ) -> io::Result<()> {
        check_len(len)?;
        let frame = {
            let mut guard = self.shared.state();
            let st = &mut *guard;
            if st.link_down {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }
            if st.sq.is_full() {
                return Err(Errno::ENOMEM.into());
            }
            let token = st
                .sq
                .push(wr_id, opcode, flags.contains(SendFlags::SIGNALED));
            if let Err(fault) = st
                .regions
                .check(lkey, addr, len as usize, AccessFlags::empty())
            {
                tracing::debug!(lkey, addr, ?fault, "rejected local source buffer");
                st.complete_send(token, WcStatus::LocalProtectionError, 0);
                return Ok(());
            }
            // SAFETY: the region table vouches for the span being registered.
            let payload =
                unsafe { std::slice::from_raw_parts(addr as *const u8, len as usize).to_vec() };
            build(token, payload)
        };
        self.shared.send_frame(&frame)
    }

    /// Post a receive buffer for one inbound SEND.
    pub fn post_recv(&self, wr_id: u64, addr: u64, len: u32, lkey: u32) -> io::Result<()> {
        let acks = {
            let mut guard = self.shared.state();
            let st = &mut *guard;
            if st.link_down && st.unmatched.is_empty() {
                return Err(io::ErrorKind::ConnectionAborted.into());
            }
            if st.recv_queue.len() >= st.max_recv_wr {
                return Err(Errno::ENOMEM.into());
            }
            if let Err(fault) = st
                .regions
                .check(lkey, addr, len as usize, AccessFlags::LOCAL_WRITE)
            {
                tracing::debug!(lkey, addr, ?fault, "rejected receive buffer");
                st.recv_cq.push_back(WorkCompletion {
                    wr_id,
                    status: WcStatus::LocalProtectionError,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                });
                return Ok(());
            }
            st.recv_queue.push_back(PostedRecv {
                wr_id,
                addr,
                len,
                lkey,
            });
            st.match_receives()
        };
        for ack in &acks {
            // The sender may already be gone once its message is delivered.
            if let Err(e) = self.shared.send_frame(ack) {
                tracing::debug!("failed to acknowledge receive: {}", e);
            }
        }
        Ok(())
    }

    /// Poll one completion from the given queue.
    ///
    /// Returns `Ok(None)` when the queue is empty and
    /// `Err(ConnectionAborted)` once the link is gone and nothing remains
    /// to report.
    pub fn poll_cq(&self, side: QueueSide) -> io::Result<Option<WorkCompletion>> {
        let mut guard = self.shared.state();
        let st = &mut *guard;
        let wc = match side {
            QueueSide::Send => st.send_cq.pop_front().map(|(token, wc)| {
                st.sq.reap(token);
                wc
            }),
            QueueSide::Recv => st.recv_cq.pop_front(),
        };
        match wc {
            Some(wc) => Ok(Some(wc)),
            None if st.link_down => Err(io::ErrorKind::ConnectionAborted.into()),
            None => Ok(None),
        }
    }

    /// Number of send-queue slots currently held.
    pub fn send_queue_occupancy(&self) -> usize {
        self.shared.state().sq.occupancy()
    }

    /// Say goodbye to the peer and stop the service thread.
    pub fn disconnect(mut self) -> io::Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        let Some(service) = self.service.take() else {
            return Ok(());
        };
        if let Err(e) = self.shared.send_frame(&Frame::Bye) {
            tracing::debug!("failed to send goodbye: {}", e);
        }
        self.shared.shutdown_link();
        service
            .join()
            .map_err(|_| io::Error::other("service thread panicked"))?;
        tracing::debug!(peer = %self.peer, "connection closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("failed to close connection: {}", e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn check_len(len: u32) -> io::Result<()> {
    if len as usize > MAX_PAYLOAD {
        return Err(Errno::EINVAL.into());
    }
    Ok(())
}

/// Passive side: accepts connections.
pub struct Listener {
    listener: TcpListener,
    config: ConnectionConfig,
}

impl Listener {
    /// Listen on all interfaces at `port`.
    pub fn bind(port: u16, config: &ConnectionConfig) -> io::Result<Self> {
        Self::bind_addr(("0.0.0.0", port), config)
    }

    pub fn bind_addr(addr: impl ToSocketAddrs, config: &ConnectionConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        tracing::debug!(addr = %listener.local_addr()?, "listening");
        Ok(Self {
            listener,
            config: config.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Block until a peer connects.
    pub fn accept(&self) -> io::Result<Connection> {
        let (stream, _) = self.listener.accept()?;
        Connection::from_stream(stream, &self.config)
    }
}

/// Listen at `port` and accept exactly one connection.
pub fn listen(port: u16, config: &ConnectionConfig) -> io::Result<(Listener, Connection)> {
    let listener = Listener::bind(port, config)?;
    let conn = listener.accept()?;
    Ok((listener, conn))
}
