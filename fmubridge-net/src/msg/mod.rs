//! Wire formats.
//!
//! The step channel carries two fixed-size little-endian words: an 8 byte
//! step request holding the step duration in microseconds, answered by a 4
//! byte acknowledgement code. After a reset the worker announces it's ready
//! again by sending [`SERVER_READY`] on the fresh connection.
//!
//! The data channel carries [`DataRecord`]s:
//!
//! ```text
//! [op: u8][reference: u32][index: u32][address: i64][offset: u32][size: u32][payload]
//! ```
//!
//! Write records carry `size` payload bytes. Read records carry none and are
//! answered by the worker with `size` bytes each, in request order.

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, Result};

pub const STEP_REQUEST_LEN: usize = 8;
pub const STATUS_WORD_LEN: usize = 4;

/// Status word sent by the worker once it accepts steps again after a
/// reset.
pub const SERVER_READY: i32 = 1001;

/// Acknowledgement code answering a step request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum AckCode {
    Ok = 1,
    Error = 2,
    Reset = 3,
}

impl AckCode {
    /// Maps a raw status word. Unknown values count as errors.
    pub fn from_raw(raw: i32) -> AckCode {
        AckCode::try_from(raw).unwrap_or(AckCode::Error)
    }
}

pub fn encode_step(micros: u64) -> [u8; STEP_REQUEST_LEN] {
    let mut buf = [0; STEP_REQUEST_LEN];
    LittleEndian::write_u64(&mut buf, micros);
    buf
}

pub fn decode_step(bytes: &[u8; STEP_REQUEST_LEN]) -> u64 {
    LittleEndian::read_u64(bytes)
}

pub fn encode_status(code: i32) -> [u8; STATUS_WORD_LEN] {
    let mut buf = [0; STATUS_WORD_LEN];
    LittleEndian::write_i32(&mut buf, code);
    buf
}

pub fn decode_status(bytes: &[u8; STATUS_WORD_LEN]) -> i32 {
    LittleEndian::read_i32(bytes)
}

/// Direction of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum RecordOp {
    Write = 1,
    Read = 2,
}

pub const RECORD_HEADER_LEN: usize = 1 + 4 + 4 + 8 + 4 + 4;

/// Single variable transfer on the data channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub op: RecordOp,
    pub reference: u32,
    pub index: u32,
    pub address: i64,
    pub offset: u32,
    pub size: u32,
    /// Present for writes only
    pub payload: Vec<u8>,
}

impl DataRecord {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut header = [0; RECORD_HEADER_LEN];
        header[0] = self.op.into();
        LittleEndian::write_u32(&mut header[1..5], self.reference);
        LittleEndian::write_u32(&mut header[5..9], self.index);
        LittleEndian::write_i64(&mut header[9..17], self.address);
        LittleEndian::write_u32(&mut header[17..21], self.offset);
        LittleEndian::write_u32(&mut header[21..25], self.size);
        buf.extend_from_slice(&header);
        if self.op == RecordOp::Write {
            buf.extend_from_slice(&self.payload);
        }
    }

    /// Decodes the header of a record. The payload of write records has to
    /// be read separately, `size` bytes long.
    pub fn decode_header(header: &[u8; RECORD_HEADER_LEN]) -> Result<DataRecord> {
        let op = RecordOp::try_from(header[0])
            .map_err(|e| Error::MalformedRecord(e.to_string()))?;
        Ok(DataRecord {
            op,
            reference: LittleEndian::read_u32(&header[1..5]),
            index: LittleEndian::read_u32(&header[5..9]),
            address: LittleEndian::read_i64(&header[9..17]),
            offset: LittleEndian::read_u32(&header[17..21]),
            size: LittleEndian::read_u32(&header[21..25]),
            payload: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_codes() {
        assert_eq!(AckCode::from_raw(1), AckCode::Ok);
        assert_eq!(AckCode::from_raw(2), AckCode::Error);
        assert_eq!(AckCode::from_raw(3), AckCode::Reset);
        assert_eq!(AckCode::from_raw(99), AckCode::Error);
        assert_eq!(AckCode::from_raw(SERVER_READY), AckCode::Error);
        assert_eq!(i32::from(AckCode::Reset), 3);
    }

    #[test]
    fn step_request_layout() {
        let buf = encode_step(1_000_000);
        assert_eq!(buf, [0x40, 0x42, 0x0f, 0, 0, 0, 0, 0]);
        assert_eq!(encode_status(SERVER_READY), [0xe9, 0x03, 0, 0]);
    }

    #[test]
    fn write_record_carries_payload() {
        let record = DataRecord {
            op: RecordOp::Write,
            reference: 7,
            index: 1,
            address: 0x1000,
            offset: 16,
            size: 2,
            payload: vec![0xaa, 0xbb],
        };
        let mut buf = Vec::new();
        record.encode_into(&mut buf);
        assert_eq!(buf.len(), RECORD_HEADER_LEN + 2);

        let mut header = [0; RECORD_HEADER_LEN];
        header.copy_from_slice(&buf[..RECORD_HEADER_LEN]);
        let decoded = DataRecord::decode_header(&header).unwrap();
        assert_eq!(decoded.op, RecordOp::Write);
        assert_eq!((decoded.reference, decoded.index), (7, 1));
        assert_eq!((decoded.address, decoded.offset, decoded.size), (0x1000, 16, 2));
        assert_eq!(&buf[RECORD_HEADER_LEN..], &[0xaa, 0xbb]);
    }

    #[test]
    fn unknown_record_op() {
        let header = [9; RECORD_HEADER_LEN];
        assert!(DataRecord::decode_header(&header).is_err());
    }
}
