//! The emulated NIC.
//!
//! Each connection owns one service thread that reads frames from the peer
//! and acts on local registered memory: it places inbound writes, answers
//! reads, matches inbound sends to posted receives, and turns peer
//! acknowledgements into completions.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use crate::connection::Shared;
use crate::cq::{SendQueue, WcOpcode, WcStatus, WorkCompletion};
use crate::mr::{AccessFlags, RegionTable};
use crate::wire::Frame;

/// A receive posted by the application.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PostedRecv {
    pub wr_id: u64,
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Local target of an outstanding RDMA READ.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingRead {
    pub addr: u64,
    pub len: u32,
    pub lkey: u32,
}

/// Everything the application side and the service thread share.
pub(crate) struct NicState {
    pub regions: RegionTable,
    pub sq: SendQueue,
    pub send_cq: VecDeque<(u64, WorkCompletion)>,
    pub recv_cq: VecDeque<WorkCompletion>,
    pub recv_queue: VecDeque<PostedRecv>,
    pub max_recv_wr: usize,
    /// Inbound sends waiting for a receive, with the sender's token.
    pub unmatched: VecDeque<(u64, Vec<u8>)>,
    pub pending_reads: HashMap<u64, PendingRead>,
    pub link_down: bool,
}

impl NicState {
    pub fn new(max_send_wr: usize, max_recv_wr: usize) -> Self {
        Self {
            regions: RegionTable::new(),
            sq: SendQueue::new(max_send_wr),
            send_cq: VecDeque::new(),
            recv_cq: VecDeque::new(),
            recv_queue: VecDeque::new(),
            max_recv_wr,
            unmatched: VecDeque::new(),
            pending_reads: HashMap::new(),
            link_down: false,
        }
    }

    pub fn complete_send(&mut self, token: u64, status: WcStatus, byte_len: u32) {
        if !self.sq.complete(token, status, byte_len, &mut self.send_cq) {
            tracing::warn!(token, "completion for unknown send-queue entry");
        }
    }

    /// Pair queued inbound sends with posted receives, in order. Returns the
    /// acknowledgements owed to the sender.
    pub fn match_receives(&mut self) -> Vec<Frame> {
        let mut acks = Vec::new();
        while !self.unmatched.is_empty() && !self.recv_queue.is_empty() {
            let (Some((token, payload)), Some(recv)) =
                (self.unmatched.pop_front(), self.recv_queue.pop_front())
            else {
                break;
            };
            let (recv_status, ack_status) = self.place_send(&recv, &payload);
            self.recv_cq.push_back(WorkCompletion {
                wr_id: recv.wr_id,
                status: recv_status,
                opcode: WcOpcode::Recv,
                byte_len: if recv_status.is_success() {
                    payload.len() as u32
                } else {
                    0
                },
            });
            acks.push(Frame::Ack {
                token,
                status: ack_status,
            });
        }
        acks
    }

    fn place_send(&self, recv: &PostedRecv, payload: &[u8]) -> (WcStatus, WcStatus) {
        if payload.len() > recv.len as usize {
            return (WcStatus::LocalLengthError, WcStatus::RemoteInvalidRequest);
        }
        if self
            .regions
            .check(recv.lkey, recv.addr, payload.len(), AccessFlags::LOCAL_WRITE)
            .is_err()
        {
            return (
                WcStatus::LocalProtectionError,
                WcStatus::RemoteInvalidRequest,
            );
        }
        // SAFETY: the region table vouches for [addr, addr + len) being
        // registered, and registration obliges the owner to keep it valid.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                recv.addr as *mut u8,
                payload.len(),
            );
        }
        (WcStatus::Success, WcStatus::Success)
    }

    fn handle_write(&self, remote_addr: u64, rkey: u32, payload: &[u8]) -> WcStatus {
        match self
            .regions
            .check(rkey, remote_addr, payload.len(), AccessFlags::REMOTE_WRITE)
        {
            Ok(_) => {
                // SAFETY: see `place_send`.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        payload.as_ptr(),
                        remote_addr as *mut u8,
                        payload.len(),
                    );
                }
                WcStatus::Success
            }
            Err(fault) => {
                tracing::debug!(rkey, remote_addr, ?fault, "rejected inbound RDMA WRITE");
                WcStatus::RemoteAccessError
            }
        }
    }

    fn handle_read(&self, remote_addr: u64, rkey: u32, len: u32) -> (WcStatus, Vec<u8>) {
        match self
            .regions
            .check(rkey, remote_addr, len as usize, AccessFlags::REMOTE_READ)
        {
            Ok(_) => {
                // SAFETY: see `place_send`.
                let data = unsafe {
                    std::slice::from_raw_parts(remote_addr as *const u8, len as usize).to_vec()
                };
                (WcStatus::Success, data)
            }
            Err(fault) => {
                tracing::debug!(rkey, remote_addr, ?fault, "rejected inbound RDMA READ");
                (WcStatus::RemoteAccessError, Vec::new())
            }
        }
    }

    fn handle_read_response(&mut self, token: u64, status: WcStatus, payload: &[u8]) {
        let Some(target) = self.pending_reads.remove(&token) else {
            tracing::warn!(token, "read response for unknown request");
            return;
        };
        if !status.is_success() {
            self.complete_send(token, status, 0);
            return;
        }
        let status = if payload.len() != target.len as usize {
            WcStatus::RemoteInvalidRequest
        } else if self
            .regions
            .check(target.lkey, target.addr, payload.len(), AccessFlags::LOCAL_WRITE)
            .is_err()
        {
            WcStatus::LocalProtectionError
        } else {
            // SAFETY: see `place_send`.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    target.addr as *mut u8,
                    payload.len(),
                );
            }
            WcStatus::Success
        };
        let byte_len = if status.is_success() { target.len } else { 0 };
        self.complete_send(token, status, byte_len);
    }

    /// Fail everything outstanding after the link is gone.
    fn flush(&mut self) {
        self.link_down = true;
        self.pending_reads.clear();
        self.sq.flush(&mut self.send_cq);
        while let Some(recv) = self.recv_queue.pop_front() {
            self.recv_cq.push_back(WorkCompletion {
                wr_id: recv.wr_id,
                status: WcStatus::WrFlushError,
                opcode: WcOpcode::Recv,
                byte_len: 0,
            });
        }
    }
}

/// Service loop. Runs until the peer says goodbye or the link breaks.
pub(crate) fn run(shared: Arc<Shared>, mut reader: TcpStream) {
    loop {
        let frame = match Frame::read_from(&mut reader) {
            Ok(frame) => frame,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    tracing::debug!("link read failed: {}", e);
                }
                break;
            }
        };

        let replies = match frame {
            Frame::Send { token, payload } => {
                let mut st = shared.state();
                st.unmatched.push_back((token, payload));
                st.match_receives()
            }
            Frame::Write {
                token,
                remote_addr,
                rkey,
                payload,
            } => {
                let status = shared.state().handle_write(remote_addr, rkey, &payload);
                vec![Frame::Ack { token, status }]
            }
            Frame::ReadRequest {
                token,
                remote_addr,
                rkey,
                len,
            } => {
                let (status, payload) = shared.state().handle_read(remote_addr, rkey, len);
                vec![Frame::ReadResponse {
                    token,
                    status,
                    payload,
                }]
            }
            Frame::ReadResponse {
                token,
                status,
                payload,
            } => {
                shared.state().handle_read_response(token, status, &payload);
                Vec::new()
            }
            Frame::Ack { token, status } => {
                shared.state().complete_send(token, status, 0);
                Vec::new()
            }
            Frame::Hello { .. } => {
                tracing::warn!("unexpected hello after connection setup");
                Vec::new()
            }
            Frame::Bye => {
                tracing::debug!("peer closed the connection");
                break;
            }
        };

        for reply in &replies {
            if let Err(e) = shared.send_frame(reply) {
                tracing::debug!("link write failed: {}", e);
                shared.state().flush();
                return;
            }
        }
    }

    shared.state().flush();
}
