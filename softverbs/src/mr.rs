//! Memory Region registration.
//!
//! A Memory Region (MR) makes a span of local memory addressable by the
//! emulated NIC. Local operations name it through its `lkey`, the peer names
//! it through its `rkey` together with a virtual address inside the span.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bitflags::bitflags;

use crate::connection::Shared;

bitflags! {
    /// Memory access flags for Memory Region registration.
    ///
    /// Local read access is always enabled for the MR.
    ///
    /// # Important
    /// If `REMOTE_WRITE` is set, then `LOCAL_WRITE` must also be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access (receive buffers, RDMA READ targets).
        const LOCAL_WRITE = 1 << 0;

        /// Enable remote write access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_WRITE = 1 << 1;

        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;
    }
}

/// Registry entry for one region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionEntry {
    pub addr: u64,
    pub len: usize,
    pub access: AccessFlags,
}

impl RegionEntry {
    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        let Some(end) = addr.checked_add(len as u64) else {
            return false;
        };
        addr >= self.addr && end <= self.addr + self.len as u64
    }
}

/// Why a region lookup was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegionFault {
    UnknownKey,
    OutOfBounds,
    AccessDenied,
}

/// Key to region mapping, shared between the application side and the
/// service thread.
pub(crate) struct RegionTable {
    regions: HashMap<u32, RegionEntry>,
    next_key: u32,
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            regions: HashMap::new(),
            // Start somewhere random so keys from a previous connection are
            // unlikely to alias.
            next_key: rand::random::<u32>() | 1,
        }
    }

    pub fn insert(&mut self, entry: RegionEntry) -> u32 {
        loop {
            let key = self.next_key;
            self.next_key = self.next_key.wrapping_add(1);
            if key != 0 && !self.regions.contains_key(&key) {
                self.regions.insert(key, entry);
                return key;
            }
        }
    }

    pub fn remove(&mut self, key: u32) -> Option<RegionEntry> {
        self.regions.remove(&key)
    }

    /// Validate that `key` names a region covering `[addr, addr + len)` with
    /// at least `required` access.
    pub fn check(
        &self,
        key: u32,
        addr: u64,
        len: usize,
        required: AccessFlags,
    ) -> Result<RegionEntry, RegionFault> {
        let entry = self.regions.get(&key).ok_or(RegionFault::UnknownKey)?;
        if !entry.covers(addr, len) {
            return Err(RegionFault::OutOfBounds);
        }
        if !entry.access.contains(required) {
            return Err(RegionFault::AccessDenied);
        }
        Ok(*entry)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

/// Memory Region registered with a [`Connection`](crate::Connection).
///
/// The region is deregistered when dropped. Use [`MemoryRegion::deregister`]
/// to observe deregistration failures.
pub struct MemoryRegion {
    shared: Arc<Shared>,
    key: u32,
    addr: u64,
    len: usize,
    access: AccessFlags,
    registered: bool,
}

impl MemoryRegion {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: u32,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> Self {
        Self {
            shared,
            key,
            addr,
            len,
            access,
            registered: true,
        }
    }

    /// Returns the local key (L_Key) for this memory region.
    pub fn lkey(&self) -> u32 {
        self.key
    }

    /// Returns the remote key (R_Key) for this memory region.
    pub fn rkey(&self) -> u32 {
        self.key
    }

    /// Returns the starting address of the registered memory region.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Returns the length of the registered memory region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Deregister the region, reporting failure instead of logging it.
    pub fn deregister(mut self) -> io::Result<()> {
        self.registered = false;
        self.remove()
    }

    fn remove(&self) -> io::Result<()> {
        match self.shared.state().regions.remove(self.key) {
            Some(_) => {
                tracing::trace!(key = self.key, addr = self.addr, "deregistered MR");
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("MR with key {:#x} is not registered", self.key),
            )),
        }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if self.registered
            && let Err(e) = self.remove()
        {
            tracing::warn!("failed to deregister MR on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("key", &format_args!("{:#x}", self.key))
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}
