//! Fixed-point decimal codec.
//!
//! Layout: big-endian `i32` scale, big-endian `i32` byte length, then the
//! unscaled integer as minimal two's-complement big-endian bytes. The two
//! leading fixed-width fields make the payload skippable without
//! materializing the number.

use rust_decimal::Decimal;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{Error, Result};

pub fn write_decimal(buf: &mut WriteBuffer, value: &Decimal) {
    let unscaled = minimal_be_bytes(value.mantissa());
    buf.write_i32_be(value.scale() as i32);
    buf.write_i32_be(unscaled.len() as i32);
    buf.write(&unscaled);
}

pub fn read_decimal(cur: &mut ReadBuffer) -> Result<Decimal> {
    let start = cur.offset();
    let scale = cur.read_i32_be()?;
    let len = cur.read_i32_be()?;
    if scale < 0 || len < 0 || len as usize > 16 {
        return Err(Error::BadDecimal { offset: start });
    }
    let bytes = cur.read_exact(len as usize)?;
    let mantissa = sign_extend_be(bytes);
    Decimal::try_from_i128_with_scale(mantissa, scale as u32)
        .map_err(|_| Error::BadDecimal { offset: start })
}

/// Shortest big-endian two's-complement encoding of `value`.
fn minimal_be_bytes(value: i128) -> Vec<u8> {
    let full = value.to_be_bytes();
    let mut start = 0;
    while start < full.len() - 1 {
        let drop = if value < 0 {
            full[start] == 0xFF && full[start + 1] & 0x80 != 0
        } else {
            full[start] == 0x00 && full[start + 1] & 0x80 == 0
        };
        if !drop {
            break;
        }
        start += 1;
    }
    full[start..].to_vec()
}

fn sign_extend_be(bytes: &[u8]) -> i128 {
    if bytes.is_empty() {
        return 0;
    }
    let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut full = [fill; 16];
    full[16 - bytes.len()..].copy_from_slice(bytes);
    i128::from_be_bytes(full)
}
