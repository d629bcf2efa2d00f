//! In-process transport double for unit tests.
//!
//! Completions are generated at post time, so the pipeline never blocks.
//! Failures are injected per work request id.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::rc::Rc;

use softverbs::{AccessFlags, QueueSide, SendFlags, WcOpcode, WcStatus, WorkCompletion};

use crate::transport::{LocalSge, RegisteredRegion, RemoteAddr, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedOp {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    pub signaled: bool,
    pub sge: LocalSge,
    pub remote: Option<RemoteAddr>,
}

#[derive(Default)]
struct MockState {
    next_key: u32,
    live: usize,
    deregistered: usize,
    spans: Vec<(u64, usize, AccessFlags)>,
    register_budget: Option<usize>,
    posts: Vec<PostedOp>,
    fail_post: HashSet<u64>,
    fail_completion: HashSet<u64>,
    abort_after: Option<usize>,
    aborted: bool,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
}

pub struct MockRegion {
    state: Rc<RefCell<MockState>>,
    key: u32,
    addr: u64,
    len: usize,
}

impl RegisteredRegion for MockRegion {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key | 0x8000_0000
    }

    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn deregister(self) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        st.live -= 1;
        st.deregistered += 1;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` registrations succeed, then fail.
    pub fn fail_register_after(self, n: usize) -> Self {
        self.state.borrow_mut().register_budget = Some(n);
        self
    }

    pub fn fail_post(self, wr_id: u64) -> Self {
        self.state.borrow_mut().fail_post.insert(wr_id);
        self
    }

    pub fn fail_completion(self, wr_id: u64) -> Self {
        self.state.borrow_mut().fail_completion.insert(wr_id);
        self
    }

    /// Drop the connection after `n` successful posts.
    pub fn abort_after_posts(self, n: usize) -> Self {
        self.state.borrow_mut().abort_after = Some(n);
        self
    }

    pub fn registered(&self) -> usize {
        self.state.borrow().live
    }

    pub fn deregistered(&self) -> usize {
        self.state.borrow().deregistered
    }

    pub fn spans(&self) -> Vec<(u64, usize, AccessFlags)> {
        self.state.borrow().spans.clone()
    }

    pub fn posts(&self) -> Vec<PostedOp> {
        self.state.borrow().posts.clone()
    }

    fn post(
        &self,
        wr_id: u64,
        opcode: WcOpcode,
        sge: LocalSge,
        remote: Option<RemoteAddr>,
        flags: SendFlags,
    ) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        if st.aborted || st.abort_after.is_some_and(|n| st.posts.len() >= n) {
            st.aborted = true;
            return Err(io::ErrorKind::ConnectionAborted.into());
        }
        if st.fail_post.contains(&wr_id) {
            return Err(io::Error::other("injected post failure"));
        }
        let signaled = flags.contains(SendFlags::SIGNALED);
        st.posts.push(PostedOp {
            wr_id,
            opcode,
            signaled,
            sge,
            remote,
        });
        let status = if st.fail_completion.contains(&wr_id) {
            WcStatus::RemoteAccessError
        } else {
            WcStatus::Success
        };
        if signaled || !status.is_success() {
            let wc = WorkCompletion {
                wr_id,
                status,
                opcode,
                byte_len: sge.len,
            };
            if opcode == WcOpcode::Recv {
                st.recv_cq.push_back(wc);
            } else {
                st.send_cq.push_back(wc);
            }
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    type Region = MockRegion;

    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<MockRegion> {
        let mut st = self.state.borrow_mut();
        if let Some(budget) = st.register_budget {
            if budget == 0 {
                return Err(io::Error::other("injected registration failure"));
            }
            st.register_budget = Some(budget - 1);
        }
        st.next_key += 1;
        st.live += 1;
        st.spans.push((addr as u64, len, access));
        Ok(MockRegion {
            state: Rc::clone(&self.state),
            key: st.next_key,
            addr: addr as u64,
            len,
        })
    }

    fn post_send(&self, wr_id: u64, sge: LocalSge, flags: SendFlags) -> io::Result<()> {
        self.post(wr_id, WcOpcode::Send, sge, None, flags)
    }

    fn post_recv(&self, wr_id: u64, sge: LocalSge) -> io::Result<()> {
        self.post(wr_id, WcOpcode::Recv, sge, None, SendFlags::SIGNALED)
    }

    fn post_read(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> io::Result<()> {
        self.post(wr_id, WcOpcode::RdmaRead, sge, Some(remote), flags)
    }

    fn post_write(
        &self,
        wr_id: u64,
        sge: LocalSge,
        remote: RemoteAddr,
        flags: SendFlags,
    ) -> io::Result<()> {
        self.post(wr_id, WcOpcode::RdmaWrite, sge, Some(remote), flags)
    }

    fn poll_cq(&self, side: QueueSide) -> io::Result<Option<WorkCompletion>> {
        let mut st = self.state.borrow_mut();
        let wc = match side {
            QueueSide::Send => st.send_cq.pop_front(),
            QueueSide::Recv => st.recv_cq.pop_front(),
        };
        match wc {
            Some(wc) => Ok(Some(wc)),
            None if st.aborted => Err(io::ErrorKind::ConnectionAborted.into()),
            None => Ok(None),
        }
    }
}

/// Clock that advances by a fixed step on every read.
pub struct StepClock {
    now: std::cell::Cell<u64>,
    step: u64,
}

impl StepClock {
    pub fn new(step: u64) -> Self {
        Self {
            now: std::cell::Cell::new(0),
            step,
        }
    }
}

impl crate::clock::Clock for StepClock {
    fn now(&self) -> u64 {
        let t = self.now.get() + self.step;
        self.now.set(t);
        t
    }

    fn rate(&self) -> crate::clock::ClockRate {
        crate::clock::ClockRate::NANOS
    }
}
