//! Wire-format primitives shared by key exchange and authentication.
//!
//! All `get_*` operations are bounds-checked and fail with
//! [`Error::Protocol`] instead of reading past the end of the buffer;
//! malformed length framing on an attacker-controlled wire is always
//! treated as fatal by the callers.

// Refs:
// * https://tools.ietf.org/html/rfc4251#section-5

use crate::error::Error;
use bytes::{Buf, BufMut};
use num_bigint::{BigInt, Sign};

/// Upper bound for a length-prefixed string (anti-DoS).
pub const MAX_STRING_LEN: usize = 256 * 1024;

pub fn put_u8<B: BufMut>(mut b: B, v: u8) {
    b.put_u8(v);
}

pub fn put_u32<B: BufMut>(mut b: B, v: u32) {
    b.put_u32(v);
}

pub fn get_u8<B: Buf>(b: &mut B) -> Result<u8, Error> {
    if b.remaining() < 1 {
        return Err(Error::protocol("truncated packet: expected byte"));
    }
    Ok(b.get_u8())
}

pub fn get_u32<B: Buf>(b: &mut B) -> Result<u32, Error> {
    if b.remaining() < 4 {
        return Err(Error::protocol("truncated packet: expected uint32"));
    }
    Ok(b.get_u32())
}

pub fn get_u16<B: Buf>(b: &mut B) -> Result<u16, Error> {
    if b.remaining() < 2 {
        return Err(Error::protocol("truncated packet: expected uint16"));
    }
    Ok(b.get_u16())
}

/// Writes a 4-byte big-endian length followed by the raw bytes.
pub fn put_string<B: BufMut>(mut b: B, s: &[u8]) {
    b.put_u32(s.len() as u32);
    b.put_slice(s);
}

pub fn put_cstring<B: BufMut>(b: B, s: &str) {
    put_string(b, s.as_bytes());
}

/// Reads a length-prefixed string. The declared length is validated
/// against [`MAX_STRING_LEN`] *before* any allocation happens.
pub fn get_string<B: Buf>(b: &mut B) -> Result<Vec<u8>, Error> {
    let len = get_u32(b)? as usize;
    if len > MAX_STRING_LEN {
        return Err(Error::Protocol(format!(
            "received packet with bad string length {}",
            len
        )));
    }
    if b.remaining() < len {
        return Err(Error::protocol("truncated packet: short string"));
    }
    let mut s = vec![0u8; len];
    b.copy_to_slice(&mut s[..]);
    Ok(s)
}

/// Big-endian magnitude of a bignum, without leading zeros. Empty for zero.
fn magnitude_be(n: &BigInt) -> Vec<u8> {
    if n.sign() == Sign::NoSign {
        vec![]
    } else {
        n.magnitude().to_bytes_be()
    }
}

/// Stores a bignum in the legacy protocol-1 format: a 2-byte msb-first
/// bit count followed by `(bits + 7) / 8` bytes of magnitude, msb first.
/// Negative values are unsupported in this encoding.
pub fn put_bignum1<B: BufMut>(mut b: B, n: &BigInt) -> Result<(), Error> {
    if n.sign() == Sign::Minus {
        return Err(Error::protocol("negative bignum in protocol-1 encoding"));
    }
    let bits = n.bits();
    if bits > u16::MAX as u64 {
        return Err(Error::protocol("bignum too large for protocol-1 encoding"));
    }
    b.put_u16(bits as u16);
    b.put_slice(&magnitude_be(n));
    Ok(())
}

/// Retrieves a protocol-1 bignum, consuming exactly the announced
/// number of magnitude bytes.
pub fn get_bignum1<B: Buf>(b: &mut B) -> Result<BigInt, Error> {
    let bits = get_u16(b)? as usize;
    let bytes = (bits + 7) / 8;
    if b.remaining() < bytes {
        return Err(Error::protocol("truncated packet: short bignum"));
    }
    let mut bin = vec![0u8; bytes];
    b.copy_to_slice(&mut bin[..]);
    Ok(BigInt::from_bytes_be(Sign::Plus, &bin))
}

/// Stores a bignum in SSH2 `mpint` format: length-prefixed magnitude,
/// with one extra leading zero byte iff the high bit of the first
/// magnitude byte is set.
///
/// Negative values are complemented with a bit-flip-and-add-one pass
/// over the byte array, a known approximation of two's complement.
/// [`get_bignum2`] does not undo it; see that function.
pub fn put_bignum2<B: BufMut>(b: B, n: &BigInt) {
    let mag = magnitude_be(n);
    let mut buf = Vec::with_capacity(mag.len() + 1);
    buf.push(0u8);
    buf.extend_from_slice(&mag);
    let hasnohigh = if mag.is_empty() || mag[0] & 0x80 == 0 {
        1
    } else {
        0
    };
    if n.sign() == Sign::Minus {
        let mut carry = true;
        for byte in buf.iter_mut().rev() {
            *byte ^= 0xff;
            if carry {
                let (v, overflow) = byte.overflowing_add(1);
                *byte = v;
                carry = overflow;
            }
        }
    }
    put_string(b, &buf[hasnohigh..]);
}

/// Retrieves an SSH2 `mpint`. The magnitude is interpreted as an
/// unsigned big-endian value; no sign is recovered, which is asymmetric
/// with [`put_bignum2`] and intentionally kept that way.
pub fn get_bignum2<B: Buf>(b: &mut B) -> Result<BigInt, Error> {
    let bin = get_string(b)?;
    Ok(BigInt::from_bytes_be(Sign::Plus, &bin))
}
