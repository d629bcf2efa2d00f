//! Per-request bookkeeping.

use crate::config::Verb;
use crate::transport::{LocalSge, RemoteAddr};

/// One request of a round.
///
/// Local fields are filled by the pool, remote fields by the MR exchange and
/// timestamps by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub verb: Verb,
    /// Index of the owning region in the pool.
    pub region: usize,
    pub lkey: u32,
    pub addr: u64,
    /// Offset of `addr` inside the owning region.
    pub offset: usize,
    pub length: usize,
    pub remote_addr: u64,
    pub remote_key: u32,
    pub start: u64,
    /// Set only when the request was signaled and its completion observed.
    pub end: Option<u64>,
}

impl RequestRecord {
    pub fn sge(&self) -> LocalSge {
        LocalSge {
            addr: self.addr,
            len: self.length as u32,
            lkey: self.lkey,
        }
    }

    pub fn remote(&self) -> RemoteAddr {
        RemoteAddr {
            addr: self.remote_addr,
            rkey: self.remote_key,
        }
    }

    /// Elapsed ticks from issue to observed completion.
    pub fn elapsed(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub(crate) fn reset_timestamps(&mut self) {
        self.start = 0;
        self.end = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: u64, end: Option<u64>) -> RequestRecord {
        RequestRecord {
            verb: Verb::Read,
            region: 1,
            lkey: 5,
            addr: 0x1000,
            offset: 16,
            length: 32,
            remote_addr: 0x2000,
            remote_key: 9,
            start,
            end,
        }
    }

    #[test]
    fn test_elapsed() {
        assert_eq!(record(100, Some(250)).elapsed(), Some(150));
        assert_eq!(record(100, None).elapsed(), None);
        // A clock that stepped backwards yields zero, not a wrapped value.
        assert_eq!(record(300, Some(200)).elapsed(), Some(0));
    }

    #[test]
    fn test_views_and_reset() {
        let mut rec = record(10, Some(20));
        let sge = rec.sge();
        assert_eq!((sge.addr, sge.len, sge.lkey), (0x1000, 32, 5));
        let remote = rec.remote();
        assert_eq!((remote.addr, remote.rkey), (0x2000, 9));

        rec.reset_timestamps();
        assert_eq!(rec.start, 0);
        assert_eq!(rec.elapsed(), None);
    }
}
