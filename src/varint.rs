//! Signed variable-length integers.
//!
//! Zigzag maps small magnitudes of either sign to small unsigned values,
//! then base-128 encoding emits 7 bits per byte, high bit set on all but
//! the last byte. Every counter, length, integral scalar, and the negative
//! identity sentinels use this encoding.

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{Error, Result};

// i64 zigzags into at most ten 7-bit groups.
const MAX_BYTES: usize = 10;

pub fn write_varint(buf: &mut WriteBuffer, value: i64) {
    let mut v = zigzag(value);
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_varint(cur: &mut ReadBuffer) -> Result<i64> {
    let start = cur.offset();
    let mut v: u64 = 0;
    for i in 0..MAX_BYTES {
        let byte = cur.read_u8().map_err(|_| Error::BadVarInt { offset: start })?;
        v |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            // the tenth byte may only carry the final bit
            if i == MAX_BYTES - 1 && byte > 1 {
                return Err(Error::BadVarInt { offset: start });
            }
            return Ok(unzigzag(v));
        }
    }
    Err(Error::BadVarInt { offset: start })
}

/// Reads a varint that must fit a non-negative length or count.
pub fn read_len(cur: &mut ReadBuffer) -> Result<usize> {
    let start = cur.offset();
    let v = read_varint(cur)?;
    if v < 0 {
        return Err(Error::BadLength {
            len: v,
            offset: start,
        });
    }
    Ok(v as usize)
}

/// Reads a varint that must fit an `i32` (cluster ids, bag offsets).
pub fn read_varint_i32(cur: &mut ReadBuffer) -> Result<i32> {
    let start = cur.offset();
    let v = read_varint(cur)?;
    i32::try_from(v).map_err(|_| Error::BadVarInt { offset: start })
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(value: i64) -> (i64, usize) {
        let mut buf = WriteBuffer::new();
        write_varint(&mut buf, value);
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        let decoded = read_varint(&mut cur).unwrap();
        assert_eq!(cur.offset(), bytes.len());
        (decoded, bytes.len())
    }

    #[test]
    fn small_magnitudes_are_one_byte() {
        for v in -64..64 {
            let (decoded, len) = round_trip(v);
            assert_eq!(decoded, v);
            assert_eq!(len, 1, "value {v}");
        }
    }

    #[test]
    fn sentinels_and_extremes() {
        for v in [-1, -2, i64::MIN, i64::MAX, 0] {
            let (decoded, _) = round_trip(v);
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut buf = WriteBuffer::new();
        write_varint(&mut buf, i64::MAX);
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes[..bytes.len() - 1]);
        assert!(matches!(
            read_varint(&mut cur),
            Err(Error::BadVarInt { offset: 0 })
        ));
    }

    #[test]
    fn overlong_input_is_rejected() {
        let bytes = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        let mut cur = ReadBuffer::new(&bytes);
        assert!(read_varint(&mut cur).is_err());
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut buf = WriteBuffer::new();
        write_varint(&mut buf, -3);
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        assert!(matches!(
            read_len(&mut cur),
            Err(Error::BadLength { len: -3, .. })
        ));
    }

    proptest! {
        #[test]
        fn round_trips_any_i64(value: i64) {
            let (decoded, _) = round_trip(value);
            prop_assert_eq!(decoded, value);
        }
    }
}
