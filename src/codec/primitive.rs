//! Primitive framing codecs for the durable state files.
//!
//! Free functions over `Read`/`Write` sources, big-endian, with variable
//! data length-prefixed by a `u32`.

use std::io::{Read, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Error, Result};

/// Upper bound on any single length-prefixed element, as a sanity check
/// against truncated or garbage files.
pub const MAX_ELEM_LEN: usize = 1 << 30;

pub fn u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::Io)
}

pub fn put_u8(dst: &mut impl Write, value: u8) -> Result<()> {
    dst.write_u8(value).map_err(Error::Io)
}

pub fn u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<BigEndian>().map_err(Error::Io)
}

pub fn put_u32(dst: &mut impl Write, value: u32) -> Result<()> {
    dst.write_u32::<BigEndian>(value).map_err(Error::Io)
}

pub fn u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<BigEndian>().map_err(Error::Io)
}

pub fn put_u64(dst: &mut impl Write, value: u64) -> Result<()> {
    dst.write_u64::<BigEndian>(value).map_err(Error::Io)
}

pub fn i64(src: &mut impl Read) -> Result<i64> {
    src.read_i64::<BigEndian>().map_err(Error::Io)
}

pub fn put_i64(dst: &mut impl Write, value: i64) -> Result<()> {
    dst.write_i64::<BigEndian>(value).map_err(Error::Io)
}

pub fn bool(src: &mut impl Read) -> Result<bool> {
    match u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::TagMismatch),
    }
}

pub fn put_bool(dst: &mut impl Write, value: bool) -> Result<()> {
    put_u8(dst, value as u8)
}

/// Decode an optional element; presence is a leading boolean.
pub fn option<T, S: Read>(
    src: &mut S,
    cont: impl FnOnce(&mut S) -> Result<T>,
) -> Result<Option<T>> {
    match bool(src)? {
        true => Ok(Some(cont(src)?)),
        false => Ok(None),
    }
}

pub fn put_option<T, D: Write>(
    dst: &mut D,
    value: Option<&T>,
    cont: impl FnOnce(&mut D, &T) -> Result<()>,
) -> Result<()> {
    match value {
        Some(inner) => {
            put_bool(dst, true)?;
            cont(dst, inner)
        }
        None => put_bool(dst, false),
    }
}

/// Decode a length-prefixed byte vector.
pub fn bytes(src: &mut impl Read) -> Result<Vec<u8>> {
    let len = u32(src)? as usize;
    if len > MAX_ELEM_LEN {
        return Err(Error::ElemTooLarge);
    }
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf).map_err(Error::Io)?;
    Ok(buf)
}

pub fn put_bytes(dst: &mut impl Write, value: &[u8]) -> Result<()> {
    if value.len() > MAX_ELEM_LEN {
        return Err(Error::ElemTooLarge);
    }
    put_u32(dst, value.len() as u32)?;
    dst.write_all(value).map_err(Error::Io)
}

pub fn string(src: &mut impl Read) -> Result<String> {
    String::from_utf8(bytes(src)?).map_err(|_| Error::BadString)
}

pub fn put_string(dst: &mut impl Write, value: &str) -> Result<()> {
    put_bytes(dst, value.as_bytes())
}

pub fn path(src: &mut impl Read) -> Result<PathBuf> {
    Ok(PathBuf::from(string(src)?))
}

pub fn put_path(dst: &mut impl Write, value: &std::path::Path) -> Result<()> {
    match value.to_str() {
        Some(s) => put_string(dst, s),
        None => Err(Error::BadString),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn scalars_round_trip() {
        let mut buf = Vec::new();
        put_u8(&mut buf, 0x7f).unwrap();
        put_u32(&mut buf, 0xdead_beef).unwrap();
        put_u64(&mut buf, u64::MAX - 1).unwrap();
        put_i64(&mut buf, -42).unwrap();
        put_bool(&mut buf, true).unwrap();

        let mut src = Cursor::new(buf);
        assert_eq!(u8(&mut src).unwrap(), 0x7f);
        assert_eq!(u32(&mut src).unwrap(), 0xdead_beef);
        assert_eq!(u64(&mut src).unwrap(), u64::MAX - 1);
        assert_eq!(i64(&mut src).unwrap(), -42);
        assert!(bool(&mut src).unwrap());
    }

    #[test]
    fn length_prefixed_bytes_round_trip() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello").unwrap();
        put_string(&mut buf, "world").unwrap();
        put_option(&mut buf, Some(&7u32), |d, v| put_u32(d, *v)).unwrap();
        put_option::<u32, _>(&mut buf, None, |d, v| put_u32(d, *v)).unwrap();

        let mut src = Cursor::new(buf);
        assert_eq!(bytes(&mut src).unwrap(), b"hello");
        assert_eq!(string(&mut src).unwrap(), "world");
        assert_eq!(option(&mut src, u32).unwrap(), Some(7));
        assert_eq!(option(&mut src, u32).unwrap(), None);
    }

    #[test]
    fn bad_bool_tag_is_rejected() {
        let mut src = Cursor::new(vec![2u8]);
        assert!(matches!(bool(&mut src), Err(Error::TagMismatch)));
    }

    #[test]
    fn truncated_bytes_are_an_io_error() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 100).unwrap();
        buf.extend_from_slice(b"short");
        let mut src = Cursor::new(buf);
        assert!(matches!(bytes(&mut src), Err(Error::Io(_))));
    }
}
