//! Request buffer pool.
//!
//! The pool backs `count` requests of `length` bytes with `mr_count`
//! registered regions. Each region holds an equal, contiguous share of the
//! requests. Records refer to their region by index only; the pool owns the
//! memory and the registrations.
//!
//! Teardown order is fixed by field order: a region is deregistered before its
//! memory is freed, and each happens exactly once per region.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::io;
use std::ptr::NonNull;

use rand::RngCore;
use softverbs::AccessFlags;

use crate::config::Verb;
use crate::error::{Error, Result};
use crate::request::RequestRecord;
use crate::transport::{RegisteredRegion, Transport};

/// Alignment of every backing allocation.
pub const BUFFER_ALIGN: usize = 64;

/// Cache-line aligned heap buffer.
pub struct RegionBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer is a plain allocation; access is coordinated by the caller.
unsafe impl Send for RegionBuffer {}

impl RegionBuffer {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Result<Self> {
        Self::allocate(len)
    }

    /// Allocate `len` bytes of pseudo-random content.
    pub fn random(len: usize) -> Result<Self> {
        let buf = Self::zeroed(len)?;
        // SAFETY: freshly allocated and zero-initialized, exclusively owned,
        // at least `len` bytes long.
        let bytes = unsafe { std::slice::from_raw_parts_mut(buf.ptr.as_ptr(), len) };
        rand::rng().fill_bytes(bytes);
        Ok(buf)
    }

    fn allocate(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGN)
            .map_err(|e| Error::InvalidConfig(format!("buffer of {} bytes: {}", len, e)))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("failed to allocate {} bytes", len),
            ))
        })?;
        Ok(Self { ptr, layout })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Copy `len` bytes at `offset` out of the buffer.
    ///
    /// Uses volatile reads: the provider may write the memory at any time.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out);
        out
    }

    pub fn read_into(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len(), "read out of bounds");
        for (i, b) in out.iter_mut().enumerate() {
            *b = unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset + i)) };
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len(), "write out of bounds");
        for (i, &b) in data.iter().enumerate() {
            unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset + i), b) }
        }
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len(), "fill out of bounds");
        for i in 0..len {
            unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset + i), byte) }
        }
    }
}

impl Drop for RegionBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `allocate` with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for RegionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

/// Registration that is released on drop.
struct Registration<R: RegisteredRegion> {
    region: Option<R>,
    index: usize,
}

impl<R: RegisteredRegion> Registration<R> {
    fn get(&self) -> &R {
        // Only `Drop` takes the region out.
        self.region
            .as_ref()
            .unwrap_or_else(|| unreachable!("region {} already released", self.index))
    }
}

impl<R: RegisteredRegion> Drop for Registration<R> {
    fn drop(&mut self) {
        if let Some(region) = self.region.take()
            && let Err(e) = region.deregister()
        {
            tracing::warn!("failed to deregister region {}: {}", self.index, e);
        }
    }
}

/// A registered buffer.
///
/// Field order matters: the registration is dropped before the memory it
/// covers.
pub(crate) struct PoolRegion<R: RegisteredRegion> {
    registration: Registration<R>,
    buffer: RegionBuffer,
}

impl<R: RegisteredRegion> PoolRegion<R> {
    pub(crate) fn register<T>(
        transport: &T,
        buffer: RegionBuffer,
        access: AccessFlags,
        index: usize,
    ) -> Result<Self>
    where
        T: Transport<Region = R>,
    {
        // SAFETY: `buffer` moves into the returned value and outlives the
        // registration.
        let region = unsafe { transport.register(buffer.as_mut_ptr(), buffer.len(), access) }
            .map_err(|source| Error::Registration {
                region: index,
                source,
            })?;
        tracing::debug!(
            "registered region {} at {:#x} ({} bytes, lkey {:#x})",
            index,
            region.addr(),
            region.len(),
            region.lkey()
        );
        Ok(Self {
            registration: Registration {
                region: Some(region),
                index,
            },
            buffer,
        })
    }

    pub(crate) fn lkey(&self) -> u32 {
        self.registration.get().lkey()
    }

    pub(crate) fn rkey(&self) -> u32 {
        self.registration.get().rkey()
    }

    pub(crate) fn buffer(&self) -> &RegionBuffer {
        &self.buffer
    }
}

/// Registered request buffers and their records.
pub struct BufferPool<R: RegisteredRegion> {
    regions: Vec<PoolRegion<R>>,
    records: Vec<RequestRecord>,
    length: usize,
}

impl<R: RegisteredRegion> BufferPool<R> {
    /// Allocate and register the buffers for `count` requests.
    ///
    /// On failure every region created so far is deregistered and freed
    /// before the error is returned.
    pub fn allocate<T>(
        transport: &T,
        count: usize,
        length: usize,
        mr_count: usize,
        verb: Verb,
    ) -> Result<Self>
    where
        T: Transport<Region = R>,
    {
        if count == 0 || length == 0 || mr_count == 0 {
            return Err(Error::InvalidConfig(
                "count, length and mr_count must be positive".into(),
            ));
        }
        if !count.is_multiple_of(mr_count) {
            return Err(Error::InvalidConfig(format!(
                "count ({}) is not a multiple of mr_count ({})",
                count, mr_count
            )));
        }
        let per_region = count / mr_count;
        let region_len = per_region.checked_mul(length).ok_or_else(|| {
            Error::InvalidConfig(format!("{} x {} bytes overflows", per_region, length))
        })?;

        let access = verb.registration();
        let mut regions = Vec::with_capacity(mr_count);
        let mut records = Vec::with_capacity(count);
        for index in 0..mr_count {
            let buffer = RegionBuffer::random(region_len)?;
            let region = PoolRegion::register(transport, buffer, access, index)?;
            let base = region.buffer().addr();
            let lkey = region.lkey();
            records.extend((0..per_region).map(|j| RequestRecord {
                verb,
                region: index,
                lkey,
                addr: base + (j * length) as u64,
                offset: j * length,
                length,
                remote_addr: 0,
                remote_key: 0,
                start: 0,
                end: None,
            }));
            regions.push(region);
        }
        tracing::debug!(
            "allocated {} requests of {} bytes in {} regions",
            count,
            length,
            mr_count
        );

        Ok(Self {
            regions,
            records,
            length,
        })
    }

    pub fn records(&self) -> &[RequestRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [RequestRecord] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Remote key peers use to address request `index`.
    pub fn rkey_of(&self, index: usize) -> u32 {
        self.regions[self.records[index].region].rkey()
    }

    /// Current content of request `index`.
    pub fn request_bytes(&self, index: usize) -> Vec<u8> {
        let rec = &self.records[index];
        self.regions[rec.region].buffer().read(rec.offset, rec.length)
    }

    /// Copy the first `out.len()` bytes of request `index` without
    /// allocating.
    pub fn read_request(&self, index: usize, out: &mut [u8]) {
        let rec = &self.records[index];
        assert!(out.len() <= rec.length, "read exceeds request length");
        self.regions[rec.region].buffer().read_into(rec.offset, out);
    }

    /// Overwrite the start of request `index` with `data`.
    pub fn write_request(&self, index: usize, data: &[u8]) {
        let rec = &self.records[index];
        assert!(data.len() <= rec.length, "data exceeds request length");
        self.regions[rec.region].buffer().write(rec.offset, data);
    }

    pub fn fill_request(&self, index: usize, byte: u8) {
        let rec = &self.records[index];
        self.regions[rec.region]
            .buffer()
            .fill(rec.offset, rec.length, byte);
    }

    /// Tear the pool down now, reporting how many deregistrations failed.
    pub fn release(mut self) -> usize {
        let mut failed = 0;
        for region in self.regions.drain(..) {
            let PoolRegion {
                mut registration,
                buffer,
            } = region;
            if let Some(mr) = registration.region.take()
                && let Err(e) = mr.deregister()
            {
                tracing::warn!("failed to deregister region {}: {}", registration.index, e);
                failed += 1;
            }
            drop(buffer);
        }
        failed
    }
}
