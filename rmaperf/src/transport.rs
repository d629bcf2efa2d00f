//! Connection provider seam.
//!
//! The session code only needs memory registration, four posting primitives
//! and a non-blocking completion poll. [`Transport`] names exactly that, so
//! the orchestration can run over [`softverbs::Connection`] or over a test
//! double that injects failures.

use std::io;

use softverbs::{AccessFlags, Connection, MemoryRegion, QueueSide, SendFlags, WorkCompletion};

// =============================================================================
// Work Request Operands
// =============================================================================

/// Local scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSge {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Remote target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: u32,
}

// =============================================================================
// Traits
// =============================================================================

/// A registered memory region.
pub trait RegisteredRegion {
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
    fn addr(&self) -> u64;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deregister explicitly, reporting failure.
    fn deregister(self) -> io::Result<()>
    where
        Self: Sized;
}

/// A connected reliable endpoint.
pub trait Transport {
    type Region: RegisteredRegion;

    /// Register `len` bytes at `addr`.
    ///
    /// # Safety
    /// The memory must stay valid while the returned region is registered.
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<Self::Region>;

    fn post_send(&self, wr_id: u64, sge: LocalSge, flags: SendFlags) -> io::Result<()>;

    fn post_recv(&self, wr_id: u64, sge: LocalSge) -> io::Result<()>;

    fn post_read(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> io::Result<()>;

    fn post_write(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> io::Result<()>;

    /// Poll at most one completion without blocking.
    fn poll_cq(&self, side: QueueSide) -> io::Result<Option<WorkCompletion>>;
}

// =============================================================================
// softverbs
// =============================================================================

impl RegisteredRegion for MemoryRegion {
    fn lkey(&self) -> u32 {
        MemoryRegion::lkey(self)
    }

    fn rkey(&self) -> u32 {
        MemoryRegion::rkey(self)
    }

    fn addr(&self) -> u64 {
        MemoryRegion::addr(self)
    }

    fn len(&self) -> usize {
        MemoryRegion::len(self)
    }

    fn deregister(self) -> io::Result<()> {
        MemoryRegion::deregister(self)
    }
}

impl Transport for Connection {
    type Region = MemoryRegion;

    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        unsafe { Connection::register(self, addr, len, access) }
    }

    fn post_send(&self, wr_id: u64, sge: LocalSge, flags: SendFlags) -> io::Result<()> {
        Connection::post_send(self, wr_id, sge.addr, sge.len, sge.lkey, flags)
    }

    fn post_recv(&self, wr_id: u64, sge: LocalSge) -> io::Result<()> {
        Connection::post_recv(self, wr_id, sge.addr, sge.len, sge.lkey)
    }

    fn post_read(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> io::Result<()> {
        Connection::post_read(
            self,
            wr_id,
            sge.addr,
            sge.len,
            sge.lkey,
            remote.addr,
            remote.rkey,
            flags,
        )
    }

    fn post_write(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> io::Result<()> {
        Connection::post_write(
            self,
            wr_id,
            sge.addr,
            sge.len,
            sge.lkey,
            remote.addr,
            remote.rkey,
            flags,
        )
    }

    fn poll_cq(&self, side: QueueSide) -> io::Result<Option<WorkCompletion>> {
        Connection::poll_cq(self, side)
    }
}
