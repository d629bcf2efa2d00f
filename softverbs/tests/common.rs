//! Common test utilities for softverbs integration tests.

#![allow(dead_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::time::{Duration, Instant};

use softverbs::{Connection, ConnectionConfig, Listener, QueueSide, WorkCompletion};

/// Cache-line aligned buffer with automatic cleanup.
pub struct AlignedBuffer {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuffer {
    pub fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 64).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation of {} bytes failed", size);
        Self { ptr, layout }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn fill(&mut self, pattern: u8) {
        unsafe { std::ptr::write_bytes(self.ptr, pattern, self.size()) }
    }

    pub fn fill_bytes(&mut self, data: &[u8]) {
        let len = data.len().min(self.size());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr, len) }
    }

    /// Volatile read: the service thread writes behind our back.
    pub fn read_bytes(&self, len: usize) -> Vec<u8> {
        let len = len.min(self.size());
        (0..len)
            .map(|i| unsafe { std::ptr::read_volatile(self.ptr.add(i)) })
            .collect()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) }
    }
}

/// Connect two endpoints over loopback.
///
/// Returns `(client, server)`.
pub fn connected_pair(config: &ConnectionConfig) -> (Connection, Connection) {
    let listener = Listener::bind_addr("127.0.0.1:0", config).expect("bind");
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || listener.accept().expect("accept"));
    let client = Connection::connect("127.0.0.1", port, config).expect("connect");
    let server = server.join().unwrap();
    (client, server)
}

/// Poll until a completion arrives or `timeout_ms` passes.
pub fn poll_timeout(
    conn: &Connection,
    side: QueueSide,
    timeout_ms: u64,
) -> Option<WorkCompletion> {
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    loop {
        if let Some(wc) = conn.poll_cq(side).expect("poll_cq") {
            return Some(wc);
        }
        if start.elapsed() > timeout {
            return None;
        }
        std::hint::spin_loop();
    }
}
