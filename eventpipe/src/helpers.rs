//! Low-level reader helpers shared by the container driver and the payload
//! parsers. Everything here operates on a seekable little-endian byte source;
//! the varint readers are bounded so that a corrupt continuation bit cannot
//! run off into the rest of the stream.

use std::io::{Cursor, Read, Seek, SeekFrom};

use binrw::{BinRead, BinReaderExt, BinResult, NullWideString};

/// Unsigned LEB128, at most 35 bits (5 bytes).
pub fn read_varuint32<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u32> {
    let mut result = 0u32;
    let mut shift = 0u32;
    loop {
        let byte: u8 = reader.read_le()?;
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 35 {
            return Err(varint_overflow(reader, 35));
        }
    }
}

/// Unsigned LEB128, at most 70 bits (10 bytes).
pub fn read_varuint64<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte: u8 = reader.read_le()?;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 70 {
            return Err(varint_overflow(reader, 70));
        }
    }
}

/// The same bits as [`read_varuint32`], reinterpreted as a signed value.
pub fn read_varint32<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<i32> {
    read_varuint32(reader).map(|value| value as i32)
}

/// The same bits as [`read_varuint64`], reinterpreted as a signed value.
pub fn read_varint64<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<i64> {
    read_varuint64(reader).map(|value| value as i64)
}

fn varint_overflow<R: Seek>(reader: &mut R, bits: u32) -> binrw::Error {
    binrw::Error::AssertFail {
        pos: reader.stream_position().unwrap_or(0),
        message: format!("varint exceeds {bits} bits"),
    }
}

/// One byte without advancing.
pub fn peek_u8<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u8> {
    let byte: u8 = reader.read_le()?;
    reader.seek(SeekFrom::Current(-1))?;
    Ok(byte)
}

/// Seek forward. A position past the end of a cursor behaves as empty on the
/// next read, so this saturates for slice-backed readers.
pub fn skip<R: Seek>(reader: &mut R, count: u64) -> BinResult<()> {
    reader.seek(SeekFrom::Current(count as i64))?;
    Ok(())
}

/// Advance so that (position - base) is a multiple of four.
pub fn align_up_4<R: Seek>(reader: &mut R, base: u64) -> BinResult<()> {
    let position = reader.stream_position()?;
    let misalign = position.saturating_sub(base) & 3;
    if misalign != 0 {
        reader.seek(SeekFrom::Current((4 - misalign) as i64))?;
    }
    Ok(())
}

/// Bytes left in a slice-backed cursor.
pub fn remaining(cursor: &Cursor<&[u8]>) -> usize {
    let len = cursor.get_ref().len() as u64;
    len.saturating_sub(cursor.position()) as usize
}

/// Null-terminated UTF-16LE string.
pub fn read_utf16_string<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<String> {
    let wide = NullWideString::read_le(reader)?;
    Ok(String::from_utf16_lossy(&wide.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(bytes: &[u8]) -> Cursor<&[u8]> {
        Cursor::new(bytes)
    }

    #[test]
    fn varuint_single_byte() {
        assert_eq!(read_varuint32(&mut cursor(&[0x00])).unwrap(), 0);
        assert_eq!(read_varuint32(&mut cursor(&[0x7f])).unwrap(), 127);
        assert_eq!(read_varuint64(&mut cursor(&[0x00])).unwrap(), 0);
    }

    #[test]
    fn varuint_multi_byte() {
        assert_eq!(read_varuint32(&mut cursor(&[0x80, 0x01])).unwrap(), 128);
        assert_eq!(
            read_varuint32(&mut cursor(&[0xff, 0xff, 0xff, 0xff, 0x0f])).unwrap(),
            u32::MAX
        );
        assert_eq!(
            read_varuint64(&mut cursor(&[0x80, 0x80, 0x80, 0x80, 0x10])).unwrap(),
            1 << 32
        );
    }

    #[test]
    fn varuint_max_shift_terminates() {
        // Ten bytes, last one without a continuation bit: legal for u64.
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(read_varuint64(&mut cursor(&bytes)).unwrap(), u64::MAX);
    }

    #[test]
    fn varuint_overflow_is_an_error() {
        let bytes = [0x80u8; 6];
        assert!(read_varuint32(&mut cursor(&bytes)).is_err());
        let bytes = [0x80u8; 11];
        assert!(read_varuint64(&mut cursor(&bytes)).is_err());
    }

    #[test]
    fn varuint_truncated_is_an_error() {
        assert!(read_varuint32(&mut cursor(&[0x80])).is_err());
        assert!(read_varuint32(&mut cursor(&[])).is_err());
    }

    #[test]
    fn varint_sign_reinterpretation() {
        let minus_one = [0xff, 0xff, 0xff, 0xff, 0x0f];
        assert_eq!(read_varint32(&mut cursor(&minus_one)).unwrap(), -1);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut reader = cursor(&[0x2b, 0xcd]);
        assert_eq!(peek_u8(&mut reader).unwrap(), 0x2b);
        assert_eq!(reader.position(), 0);
        assert_eq!(read_varuint32(&mut reader).unwrap(), 0x2b);
    }

    #[test]
    fn alignment() {
        let bytes = [0u8; 16];
        let mut reader = cursor(&bytes);
        reader.set_position(5);
        align_up_4(&mut reader, 0).unwrap();
        assert_eq!(reader.position(), 8);
        align_up_4(&mut reader, 0).unwrap();
        assert_eq!(reader.position(), 8);
        reader.set_position(6);
        align_up_4(&mut reader, 2).unwrap();
        assert_eq!(reader.position(), 6);
    }

    #[test]
    fn utf16_string_reads_up_to_terminator() {
        let bytes = [b'H', 0, b'i', 0, 0, 0, 0xff, 0xff];
        let mut reader = cursor(&bytes);
        assert_eq!(read_utf16_string(&mut reader).unwrap(), "Hi");
        assert_eq!(reader.position(), 6);
    }

    #[test]
    fn utf16_string_missing_terminator_is_an_error() {
        let bytes = [b'H', 0, b'i', 0];
        assert!(read_utf16_string(&mut cursor(&bytes)).is_err());
    }
}
