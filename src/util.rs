//! # MQTT Serialization Utilities
//!
//! This module provides helper functions for reading and writing MQTT-specific data types
//! from and to byte buffers, such as variable-byte integers and length-prefixed strings.

use crate::error::ProtocolError;

/// Largest value a 4-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Space reserved after the fixed-header byte while a frame body is written.
pub(crate) const HEADER_RESERVE: usize = 5;

/// Outcome of reading a variable-byte integer from a partially received stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum VarInt {
    /// The value and the number of bytes it occupied.
    Complete(usize, usize),
    /// The buffer ended before the terminating byte.
    Incomplete,
}

/// Reads a variable-byte integer starting at `buf[0]`.
///
/// A fifth continuation byte is rejected as [`ProtocolError::MalformedRemainingLength`]
/// even when the buffer is still incomplete, so a hostile peer cannot stall the decoder.
pub(crate) fn read_variable_byte_integer(buf: &[u8]) -> Result<VarInt, ProtocolError> {
    let mut multiplier = 1;
    let mut value = 0;
    for i in 0..4 {
        let Some(&encoded_byte) = buf.get(i) else {
            return Ok(VarInt::Incomplete);
        };
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            return Ok(VarInt::Complete(value, i + 1));
        }
        multiplier *= 128;
    }
    Err(ProtocolError::MalformedRemainingLength)
}

/// Writes a variable-byte integer to the start of `buf`, returning the byte count.
pub fn write_variable_byte_integer(buf: &mut [u8], mut val: usize) -> Result<usize, ProtocolError> {
    if val > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PayloadTooLarge);
    }
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(ProtocolError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Number of bytes the remaining-length field takes for `len`.
pub fn variable_byte_integer_len(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Writes the fixed header in front of a body that was written at
/// `buf[HEADER_RESERVE..content_end]`, then compacts the frame to the start of `buf`.
///
/// Returns the total frame length.
pub(crate) fn finish_frame(
    buf: &mut [u8],
    header: u8,
    content_end: usize,
) -> Result<usize, ProtocolError> {
    if buf.len() < HEADER_RESERVE || content_end < HEADER_RESERVE {
        return Err(ProtocolError::BufferTooSmall);
    }
    let remaining_len = content_end - HEADER_RESERVE;
    buf[0] = header;
    let len_bytes = write_variable_byte_integer(&mut buf[1..HEADER_RESERVE], remaining_len)?;
    let header_len = 1 + len_bytes;
    buf.copy_within(HEADER_RESERVE..content_end, header_len);
    Ok(header_len + remaining_len)
}

/// Reads a big-endian `u16`, advancing the cursor.
pub(crate) fn read_u16(cursor: &mut usize, buf: &[u8]) -> Result<u16, ProtocolError> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(ProtocolError::MalformedPacket)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Writes a big-endian `u16`, advancing the cursor.
pub(crate) fn write_u16(cursor: &mut usize, buf: &mut [u8], val: u16) -> Result<(), ProtocolError> {
    buf.get_mut(*cursor..*cursor + 2)
        .ok_or(ProtocolError::BufferTooSmall)?
        .copy_from_slice(&val.to_be_bytes());
    *cursor += 2;
    Ok(())
}

/// Writes a single byte, advancing the cursor.
pub(crate) fn write_u8(cursor: &mut usize, buf: &mut [u8], val: u8) -> Result<(), ProtocolError> {
    *buf.get_mut(*cursor).ok_or(ProtocolError::BufferTooSmall)? = val;
    *cursor += 1;
    Ok(())
}

/// Reads length-prefixed binary data (used for the password field).
pub(crate) fn read_binary<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a [u8], ProtocolError> {
    let len = read_u16(cursor, buf)? as usize;
    let data = buf
        .get(*cursor..*cursor + len)
        .ok_or(ProtocolError::MalformedPacket)?;
    *cursor += len;
    Ok(data)
}

/// Writes length-prefixed binary data, advancing the cursor.
pub(crate) fn write_binary(cursor: &mut usize, buf: &mut [u8], data: &[u8]) -> Result<(), ProtocolError> {
    let len = u16::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLarge)?;
    write_u16(cursor, buf, len)?;
    write_bytes(cursor, buf, data)
}

/// Copies raw bytes, advancing the cursor.
pub(crate) fn write_bytes(cursor: &mut usize, buf: &mut [u8], data: &[u8]) -> Result<(), ProtocolError> {
    buf.get_mut(*cursor..*cursor + data.len())
        .ok_or(ProtocolError::BufferTooSmall)?
        .copy_from_slice(data);
    *cursor += data.len();
    Ok(())
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub(crate) fn read_utf8_string<'a>(cursor: &mut usize, buf: &'a [u8]) -> Result<&'a str, ProtocolError> {
    let bytes = read_binary(cursor, buf)?;
    core::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8String)
}

/// Writes a UTF-8 encoded string (prefixed with a 2-byte length) to the buffer.
pub(crate) fn write_utf8_string(cursor: &mut usize, buf: &mut [u8], s: &str) -> Result<(), ProtocolError> {
    write_binary(cursor, buf, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_byte_integer_boundaries() {
        let cases: [(usize, &[u8]); 6] = [
            (0, &[0x00]),
            (127, &[0x7F]),
            (128, &[0x80, 0x01]),
            (16_383, &[0xFF, 0x7F]),
            (2_097_152, &[0x80, 0x80, 0x80, 0x01]),
            (MAX_REMAINING_LENGTH, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for (value, encoded) in cases {
            let mut buf = [0u8; 4];
            let n = write_variable_byte_integer(&mut buf, value).unwrap();
            assert_eq!(&buf[..n], encoded);
            assert_eq!(variable_byte_integer_len(value), n);
            assert_eq!(
                read_variable_byte_integer(encoded).unwrap(),
                VarInt::Complete(value, n)
            );
        }
    }

    #[test]
    fn rejects_fifth_length_byte() {
        assert_eq!(
            read_variable_byte_integer(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(ProtocolError::MalformedRemainingLength)
        );
        assert_eq!(
            read_variable_byte_integer(&[0x80, 0x80, 0x80, 0x80]),
            Err(ProtocolError::MalformedRemainingLength)
        );
    }

    #[test]
    fn truncated_length_is_incomplete() {
        assert_eq!(read_variable_byte_integer(&[]).unwrap(), VarInt::Incomplete);
        assert_eq!(read_variable_byte_integer(&[0x80, 0x80]).unwrap(), VarInt::Incomplete);
    }

    #[test]
    fn value_above_limit_is_refused() {
        let mut buf = [0u8; 8];
        assert_eq!(
            write_variable_byte_integer(&mut buf, MAX_REMAINING_LENGTH + 1),
            Err(ProtocolError::PayloadTooLarge)
        );
    }

    #[test]
    fn utf8_string_rejects_invalid_bytes() {
        let buf = [0x00, 0x02, 0xC3, 0x28];
        let mut cursor = 0;
        assert_eq!(
            read_utf8_string(&mut cursor, &buf),
            Err(ProtocolError::InvalidUtf8String)
        );
    }

    #[test]
    fn utf8_string_truncated_is_malformed() {
        let buf = [0x00, 0x05, b'a', b'b'];
        let mut cursor = 0;
        assert_eq!(
            read_utf8_string(&mut cursor, &buf),
            Err(ProtocolError::MalformedPacket)
        );
    }
}
