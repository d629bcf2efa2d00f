//! Work completions and send-queue accounting.
//!
//! The send queue has a fixed depth. A slot is only reclaimed once a
//! signaled completion that covers it has been polled, which is what makes
//! selective signaling necessary: a stream of unsignaled requests fills the
//! queue and further posts fail.

use std::collections::VecDeque;
use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Flags for send-side work requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u32 {
        /// Generate a completion entry when the request finishes.
        const SIGNALED = 1 << 0;
    }
}

/// Which completion queue to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSide {
    /// Completions of SEND, RDMA READ and RDMA WRITE requests.
    Send,
    /// Completions of posted receives.
    Recv,
}

/// Completion status codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success = 0,
    /// Inbound message larger than the posted receive buffer.
    LocalLengthError = 1,
    /// Local key does not name a region covering the buffer.
    LocalProtectionError = 2,
    /// Request flushed because the connection went away.
    WrFlushError = 3,
    /// Peer rejected the remote key, bounds or access rights.
    RemoteAccessError = 4,
    /// Peer could not place the message.
    RemoteInvalidRequest = 5,
}

impl WcStatus {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::LocalLengthError),
            2 => Some(Self::LocalProtectionError),
            3 => Some(Self::WrFlushError),
            4 => Some(Self::RemoteAccessError),
            5 => Some(Self::RemoteInvalidRequest),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Human readable status string, in the manner of `ibv_wc_status_str`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::LocalLengthError => "local length error",
            Self::LocalProtectionError => "local protection error",
            Self::WrFlushError => "Work Request Flushed Error",
            Self::RemoteAccessError => "remote access error",
            Self::RemoteInvalidRequest => "remote invalid request error",
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation that produced a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
}

/// A single completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// User supplied work request id.
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    /// Bytes placed (receives and reads).
    pub byte_len: u32,
}

#[derive(Debug, Clone, Copy)]
struct SqEntry {
    token: u64,
    wr_id: u64,
    opcode: WcOpcode,
    signaled: bool,
    done: Option<(WcStatus, u32)>,
    reported: bool,
}

/// In-order send queue of posted requests.
pub(crate) struct SendQueue {
    depth: usize,
    entries: VecDeque<SqEntry>,
    next_token: u64,
}

impl SendQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
            next_token: 1,
        }
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.depth
    }

    pub fn occupancy(&self) -> usize {
        self.entries.len()
    }

    /// Reserve a slot and return its token.
    ///
    /// Callers check [`SendQueue::is_full`] first.
    pub fn push(&mut self, wr_id: u64, opcode: WcOpcode, signaled: bool) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push_back(SqEntry {
            token,
            wr_id,
            opcode,
            signaled,
            done: None,
            reported: false,
        });
        token
    }

    /// Record the outcome of `token` and append every completion that is now
    /// reportable to `cq`.
    ///
    /// Completions are generated in posting order: an entry is reported only
    /// after every earlier entry has finished. Failed entries are always
    /// reported, signaled or not.
    pub fn complete(
        &mut self,
        token: u64,
        status: WcStatus,
        byte_len: u32,
        cq: &mut VecDeque<(u64, WorkCompletion)>,
    ) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.token == token) else {
            return false;
        };
        entry.done = Some((status, byte_len));

        for entry in self.entries.iter_mut() {
            let Some((status, byte_len)) = entry.done else {
                break;
            };
            if entry.reported {
                continue;
            }
            if entry.signaled || !status.is_success() {
                cq.push_back((
                    entry.token,
                    WorkCompletion {
                        wr_id: entry.wr_id,
                        status,
                        opcode: entry.opcode,
                        byte_len,
                    },
                ));
            }
            entry.reported = true;
        }
        true
    }

    /// Release every slot up to and including `token`.
    pub fn reap(&mut self, token: u64) {
        while let Some(front) = self.entries.front() {
            if front.token > token {
                break;
            }
            self.entries.pop_front();
        }
    }

    /// Complete every unfinished entry with `WrFlushError`.
    pub fn flush(&mut self, cq: &mut VecDeque<(u64, WorkCompletion)>) {
        let pending: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.done.is_none())
            .map(|e| e.token)
            .collect();
        for token in pending {
            self.complete(token, WcStatus::WrFlushError, 0, cq);
        }
    }
}
