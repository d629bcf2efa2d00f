//! Frame codec for the TCP link between two connections.
//!
//! Every frame is a one-byte tag followed by big-endian fields. Payloads are
//! prefixed with a `u32` length.

use std::io::{self, Read, Write};

use crate::cq::WcStatus;

const TAG_HELLO: u8 = 0x01;
const TAG_SEND: u8 = 0x02;
const TAG_WRITE: u8 = 0x03;
const TAG_READ_REQ: u8 = 0x04;
const TAG_READ_RESP: u8 = 0x05;
const TAG_ACK: u8 = 0x06;
const TAG_BYE: u8 = 0x07;

/// Identifies a softverbs peer.
pub(crate) const HELLO_MAGIC: u32 = 0x5356_4231;

/// Upper bound on a single payload.
pub(crate) const MAX_PAYLOAD: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Hello {
        magic: u32,
    },
    Send {
        token: u64,
        payload: Vec<u8>,
    },
    Write {
        token: u64,
        remote_addr: u64,
        rkey: u32,
        payload: Vec<u8>,
    },
    ReadRequest {
        token: u64,
        remote_addr: u64,
        rkey: u32,
        len: u32,
    },
    ReadResponse {
        token: u64,
        status: WcStatus,
        payload: Vec<u8>,
    },
    Ack {
        token: u64,
        status: WcStatus,
    },
    Bye,
}

impl Frame {
    /// Serialize into a single buffer so the frame goes out in one write.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.payload_len());
        match self {
            Frame::Hello { magic } => {
                buf.push(TAG_HELLO);
                buf.extend_from_slice(&magic.to_be_bytes());
            }
            Frame::Send { token, payload } => {
                buf.push(TAG_SEND);
                buf.extend_from_slice(&token.to_be_bytes());
                put_payload(&mut buf, payload);
            }
            Frame::Write {
                token,
                remote_addr,
                rkey,
                payload,
            } => {
                buf.push(TAG_WRITE);
                buf.extend_from_slice(&token.to_be_bytes());
                buf.extend_from_slice(&remote_addr.to_be_bytes());
                buf.extend_from_slice(&rkey.to_be_bytes());
                put_payload(&mut buf, payload);
            }
            Frame::ReadRequest {
                token,
                remote_addr,
                rkey,
                len,
            } => {
                buf.push(TAG_READ_REQ);
                buf.extend_from_slice(&token.to_be_bytes());
                buf.extend_from_slice(&remote_addr.to_be_bytes());
                buf.extend_from_slice(&rkey.to_be_bytes());
                buf.extend_from_slice(&len.to_be_bytes());
            }
            Frame::ReadResponse {
                token,
                status,
                payload,
            } => {
                buf.push(TAG_READ_RESP);
                buf.extend_from_slice(&token.to_be_bytes());
                buf.push(*status as u8);
                put_payload(&mut buf, payload);
            }
            Frame::Ack { token, status } => {
                buf.push(TAG_ACK);
                buf.extend_from_slice(&token.to_be_bytes());
                buf.push(*status as u8);
            }
            Frame::Bye => buf.push(TAG_BYE),
        }
        buf
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Send { payload, .. }
            | Frame::Write { payload, .. }
            | Frame::ReadResponse { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&self.encode())?;
        w.flush()
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Frame> {
        let tag = read_u8(r)?;
        let frame = match tag {
            TAG_HELLO => Frame::Hello {
                magic: read_u32(r)?,
            },
            TAG_SEND => Frame::Send {
                token: read_u64(r)?,
                payload: read_payload(r)?,
            },
            TAG_WRITE => Frame::Write {
                token: read_u64(r)?,
                remote_addr: read_u64(r)?,
                rkey: read_u32(r)?,
                payload: read_payload(r)?,
            },
            TAG_READ_REQ => Frame::ReadRequest {
                token: read_u64(r)?,
                remote_addr: read_u64(r)?,
                rkey: read_u32(r)?,
                len: read_u32(r)?,
            },
            TAG_READ_RESP => Frame::ReadResponse {
                token: read_u64(r)?,
                status: read_status(r)?,
                payload: read_payload(r)?,
            },
            TAG_ACK => Frame::Ack {
                token: read_u64(r)?,
                status: read_status(r)?,
            },
            TAG_BYE => Frame::Bye,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame tag {:#04x}", other),
                ));
            }
        };
        Ok(frame)
    }
}

fn put_payload(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_status<R: Read>(r: &mut R) -> io::Result<WcStatus> {
    let v = read_u8(r)?;
    WcStatus::from_u8(v).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown completion status {}", v),
        )
    })
}

fn read_payload<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    if len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("payload of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_frame_layout() {
        let frame = Frame::Write {
            token: 1,
            remote_addr: 0x1122_3344_5566_7788,
            rkey: 0xaabb_ccdd,
            payload: vec![9, 8],
        };
        let bytes = frame.encode();
        assert_eq!(bytes[0], TAG_WRITE);
        assert_eq!(&bytes[1..9], &1u64.to_be_bytes());
        assert_eq!(&bytes[9..17], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert_eq!(&bytes[17..21], &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(&bytes[21..25], &2u32.to_be_bytes());
        assert_eq!(&bytes[25..], &[9, 8]);

        let decoded = Frame::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_stream_of_frames() {
        let frames = vec![
            Frame::Hello { magic: HELLO_MAGIC },
            Frame::ReadRequest {
                token: 3,
                remote_addr: 64,
                rkey: 5,
                len: 16,
            },
            Frame::Ack {
                token: 3,
                status: WcStatus::RemoteAccessError,
            },
            Frame::Bye,
        ];
        let mut buf = Vec::new();
        for f in &frames {
            f.write_to(&mut buf).unwrap();
        }

        let mut cursor = buf.as_slice();
        for f in &frames {
            assert_eq!(&Frame::read_from(&mut cursor).unwrap(), f);
        }
        assert!(Frame::read_from(&mut cursor).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = Frame::read_from(&mut [0xffu8].as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
