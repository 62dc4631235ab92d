//! String and length-prefix helpers shared by the encoders.

use bytes::BufMut;

use crate::error::ProtocolError;

/// Decode UTF-16LE bytes into a string.
pub fn decode_utf16(bytes: &[u8]) -> Result<String, ProtocolError> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::StringEncoding("odd-length UTF-16 data"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::StringEncoding("UTF-16 data"))
}

/// Number of UTF-16 code units in `s`.
#[must_use]
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Calculate the byte length of a UTF-16 encoded string.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    utf16_len(s) * 2
}

/// Write a string with a 1-byte character count.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = utf16_len(s);
    if len > u8::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field: "B_VARCHAR",
            len,
            max: u8::MAX as usize,
        });
    }
    dst.put_u8(len as u8);
    write_utf16_string(dst, s);
    Ok(())
}

/// Write a string with a 2-byte character count.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = utf16_len(s);
    if len > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field: "US_VARCHAR",
            len,
            max: u16::MAX as usize,
        });
    }
    dst.put_u16_le(len as u16);
    write_utf16_string(dst, s);
    Ok(())
}

/// Write bytes with a 2-byte length.
pub fn write_us_varbyte(dst: &mut impl BufMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field: "US_VARBYTE",
            len: data.len(),
            max: u16::MAX as usize,
        });
    }
    dst.put_u16_le(data.len() as u16);
    dst.put_slice(data);
    Ok(())
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::wire::Reader;
    use bytes::BytesMut;

    #[test]
    fn b_varchar_counts_code_units() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "Hello, 世界!").unwrap();
        assert_eq!(buf[0], 10);

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_b_varchar().unwrap(), "Hello, 世界!");
    }

    #[test]
    fn b_varchar_rejects_overlong() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_b_varchar(&mut buf, &long),
            Err(ProtocolError::FieldTooLong { len: 256, .. })
        ));
    }

    #[test]
    fn utf16_byte_len_counts_surrogates() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
        assert_eq!(utf16_byte_len("𝄞"), 4);
    }

    #[test]
    fn odd_utf16_is_rejected() {
        assert!(decode_utf16(&[0x41]).is_err());
    }
}
