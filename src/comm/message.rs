//! Active-message wire types.
//!
//! Every frame is one opcode byte followed by a postcard-encoded request
//! body. The five frame kinds and their layouts are the whole wire protocol;
//! peers running a different layout are not wire-compatible.

use super::codec::{self, BoundedBytes};
use super::types::{
    AM_FORK, AM_FORK_LARGE, AM_FORK_NB, AM_PUTDATA, AM_SIGNAL, FORK_WIRE_OVERHEAD, MAX_AM_PAYLOAD,
};
use crate::types::{AckHandle, FuncId, LocaleId, RemoteAddr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Payload bytes carried inline in a frame.
pub type AmBytes = BoundedBytes<MAX_AM_PAYLOAD>;

/// Largest argument a fork frame can carry inline for a given medium limit.
/// Anything bigger goes through the FORK_LARGE pull path. Capped at the
/// codec's payload bound so an inline argument always survives decode, even
/// on a substrate with an enormous medium limit.
pub const fn max_fork_inline(max_am_medium: usize) -> usize {
    let medium = if max_am_medium < MAX_AM_PAYLOAD {
        max_am_medium
    } else {
        MAX_AM_PAYLOAD
    };
    medium.saturating_sub(FORK_WIRE_OVERHEAD)
}

/// A remote task-spawn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkRequest {
    /// Originating locale, the destination for the completion signal and the
    /// source of a pulled argument.
    pub caller: LocaleId,
    /// Completion handle in the caller's table. Absent for non-blocking forks.
    pub ack: Option<AckHandle>,
    /// Whether the spawned task may itself spawn tasks.
    pub serial: bool,
    pub func: FuncId,
    /// Argument size in bytes, authoritative for the pull path.
    pub arg_size: u32,
    pub arg: ForkArg,
}

impl ForkRequest {
    pub fn inline_arg(&self) -> Option<&[u8]> {
        match &self.arg {
            ForkArg::Inline(bytes) => Some(bytes),
            ForkArg::Fetch(_) => None,
        }
    }
}

/// Fork argument transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ForkArg {
    /// The argument itself, shipped in the frame.
    Inline(AmBytes),
    /// Address of the argument in the caller's space; the receiver pulls
    /// `arg_size` bytes from there.
    Fetch(RemoteAddr),
}

/// Completion ack carrying the handle to resolve on the receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SignalRequest {
    pub ack: AckHandle,
}

/// Inline put into the receiver's memory at `addr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    pub addr: RemoteAddr,
    pub data: AmBytes,
}

/// One decoded active message.
#[derive(Debug, Clone)]
pub enum Am {
    ForkNb(ForkRequest),
    Fork(ForkRequest),
    Signal(SignalRequest),
    PutData(PutRequest),
    ForkLarge(ForkRequest),
}

/// Frame-level decode failure.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("empty active message frame")]
    Empty,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("payload decode failed: {0}")]
    Payload(#[from] postcard::Error),
}

impl Am {
    pub fn opcode(&self) -> u8 {
        match self {
            Am::ForkNb(_) => AM_FORK_NB,
            Am::Fork(_) => AM_FORK,
            Am::Signal(_) => AM_SIGNAL,
            Am::PutData(_) => AM_PUTDATA,
            Am::ForkLarge(_) => AM_FORK_LARGE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Am::ForkNb(_) => "fork_nb",
            Am::Fork(_) => "fork",
            Am::Signal(_) => "signal",
            Am::PutData(_) => "putdata",
            Am::ForkLarge(_) => "fork_large",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        let body = match self {
            Am::ForkNb(r) | Am::Fork(r) | Am::ForkLarge(r) => codec::to_bytes(r)?,
            Am::Signal(r) => codec::to_bytes(r)?,
            Am::PutData(r) => codec::to_bytes(r)?,
        };
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(self.opcode());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(frame: &[u8]) -> Result<Am, WireError> {
        let (&opcode, body) = frame.split_first().ok_or(WireError::Empty)?;
        let am = match opcode {
            AM_FORK_NB => Am::ForkNb(codec::from_bytes(body)?),
            AM_FORK => Am::Fork(codec::from_bytes(body)?),
            AM_SIGNAL => Am::Signal(codec::from_bytes(body)?),
            AM_PUTDATA => Am::PutData(codec::from_bytes(body)?),
            AM_FORK_LARGE => Am::ForkLarge(codec::from_bytes(body)?),
            other => return Err(WireError::UnknownOpcode(other)),
        };
        Ok(am)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::types::DEFAULT_MAX_AM_MEDIUM;

    fn fork_request(ack: Option<AckHandle>, arg: ForkArg) -> ForkRequest {
        ForkRequest {
            caller: 3,
            ack,
            serial: true,
            func: FuncId(17),
            arg_size: 12,
            arg,
        }
    }

    #[test]
    fn test_opcodes_are_stable() {
        let req = fork_request(None, ForkArg::Inline(AmBytes::default()));
        assert_eq!(Am::ForkNb(req.clone()).encode().unwrap()[0], 128);
        assert_eq!(Am::Fork(req.clone()).encode().unwrap()[0], 129);
        assert_eq!(
            Am::Signal(SignalRequest { ack: AckHandle(1) }).encode().unwrap()[0],
            130
        );
        assert_eq!(
            Am::PutData(PutRequest { addr: RemoteAddr(8), data: AmBytes::default() })
                .encode()
                .unwrap()[0],
            131
        );
        assert_eq!(Am::ForkLarge(req).encode().unwrap()[0], 132);
    }

    #[test]
    fn test_fork_roundtrip() {
        let arg = ForkArg::Inline(AmBytes::new(vec![1, 2, 3, 4]).unwrap());
        let frame = Am::Fork(fork_request(Some(AckHandle(42)), arg)).encode().unwrap();
        match Am::decode(&frame).unwrap() {
            Am::Fork(r) => {
                assert_eq!(r.caller, 3);
                assert_eq!(r.ack, Some(AckHandle(42)));
                assert!(r.serial);
                assert_eq!(r.func, FuncId(17));
                assert_eq!(r.inline_arg(), Some(&[1, 2, 3, 4][..]));
            }
            other => panic!("decoded wrong kind: {}", other.name()),
        }
    }

    #[test]
    fn test_fork_large_roundtrip() {
        let frame = Am::ForkLarge(fork_request(Some(AckHandle(7)), ForkArg::Fetch(RemoteAddr(0xdead))))
            .encode()
            .unwrap();
        match Am::decode(&frame).unwrap() {
            Am::ForkLarge(r) => {
                assert!(r.inline_arg().is_none());
                assert!(matches!(r.arg, ForkArg::Fetch(RemoteAddr(0xdead))));
            }
            other => panic!("decoded wrong kind: {}", other.name()),
        }
    }

    #[test]
    fn test_putdata_roundtrip() {
        let frame = Am::PutData(PutRequest {
            addr: RemoteAddr(0x5000_0100),
            data: AmBytes::new(vec![9; 32]).unwrap(),
        })
        .encode()
        .unwrap();
        match Am::decode(&frame).unwrap() {
            Am::PutData(r) => {
                assert_eq!(r.addr, RemoteAddr(0x5000_0100));
                assert_eq!(r.data.len(), 32);
            }
            other => panic!("decoded wrong kind: {}", other.name()),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Am::decode(&[]), Err(WireError::Empty)));
        assert!(matches!(Am::decode(&[0, 1, 2]), Err(WireError::UnknownOpcode(0))));
        assert!(matches!(Am::decode(&[AM_FORK]), Err(WireError::Payload(_))));
    }

    #[test]
    fn test_max_inline_fork_fits_medium_limit() {
        // Worst-case header fields next to a maximal inline argument.
        let arg_len = max_fork_inline(DEFAULT_MAX_AM_MEDIUM);
        let req = ForkRequest {
            caller: LocaleId::MAX,
            ack: Some(AckHandle(u64::MAX)),
            serial: true,
            func: FuncId(u32::MAX),
            arg_size: u32::MAX,
            arg: ForkArg::Inline(AmBytes::new(vec![0xab; arg_len]).unwrap()),
        };
        let frame = Am::Fork(req).encode().unwrap();
        assert!(
            frame.len() <= DEFAULT_MAX_AM_MEDIUM,
            "{} byte frame exceeds {} byte medium limit",
            frame.len(),
            DEFAULT_MAX_AM_MEDIUM
        );
    }
}
