//! Fmap wire serializer.
//!
//! The kernel client asks for a file's map once and then performs all data
//! access by mapping the DAX device directly. The reply is a fixed-size
//! message: a header tagging the file kind and extent class, followed by
//! the packed extent array. Layout is little-endian with no implicit
//! padding; it must round-trip byte-for-byte across implementations.

use std::fmt;

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::shadow::{Extent, FileMeta};

/// Size of the fmap reply buffer. Older kernel clients cannot handle a
/// short reply, so the full buffer is always sent; this is a stable wire
/// contract.
pub const FMAP_MSG_MAX: usize = 4096;

const FMAP_VERSION: u8 = 1;

/// File-kind tag carried in the fmap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FmapFileKind {
    Invalid = 0,
    Regular = 1,
}

impl FmapFileKind {
    fn from_raw(raw: u8) -> Option<FmapFileKind> {
        match raw {
            0 => Some(FmapFileKind::Invalid),
            1 => Some(FmapFileKind::Regular),
            _ => None,
        }
    }
}

/// Extent encoding class. Only simple (offset, length) runs exist today.
const EXT_CLASS_SIMPLE: u16 = 1;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FmapHeader {
    kind: u8,
    version: u8,
    ext_class: U16,
    nextents: U32,
    size: U64,
}

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FmapExtent {
    offset: U64,
    length: U64,
}

const HEADER_LEN: usize = std::mem::size_of::<FmapHeader>();
const EXTENT_LEN: usize = std::mem::size_of::<FmapExtent>();

#[derive(Debug, PartialEq, Eq)]
pub enum FmapError {
    /// The extent list does not fit in the reply buffer.
    Overflow { nextents: usize },
    /// Decode-side: truncated or malformed message.
    Malformed(&'static str),
}

impl fmt::Display for FmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FmapError::Overflow { nextents } => {
                write!(f, "fmap overflow: {nextents} extents do not fit")
            }
            FmapError::Malformed(what) => write!(f, "malformed fmap: {what}"),
        }
    }
}

impl std::error::Error for FmapError {}

/// Encode `meta` into `buf`, returning the number of meaningful bytes.
/// `buf` is expected to be [`FMAP_MSG_MAX`] long and zeroed by the caller;
/// the reply sends the whole buffer regardless of the returned length.
pub fn encode_fmap(buf: &mut [u8], kind: FmapFileKind, meta: &FileMeta) -> Result<usize, FmapError> {
    let needed = HEADER_LEN + meta.extents.len() * EXTENT_LEN;
    if needed > buf.len() {
        return Err(FmapError::Overflow {
            nextents: meta.extents.len(),
        });
    }

    let header = FmapHeader {
        kind: kind as u8,
        version: FMAP_VERSION,
        ext_class: U16::new(EXT_CLASS_SIMPLE),
        nextents: U32::new(meta.extents.len() as u32),
        size: U64::new(meta.size),
    };
    buf[..HEADER_LEN].copy_from_slice(header.as_bytes());

    let mut at = HEADER_LEN;
    for ext in &meta.extents {
        let wire = FmapExtent {
            offset: U64::new(ext.offset),
            length: U64::new(ext.length),
        };
        buf[at..at + EXTENT_LEN].copy_from_slice(wire.as_bytes());
        at += EXTENT_LEN;
    }
    Ok(needed)
}

/// Decoded view of an fmap message.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedFmap {
    pub kind: FmapFileKind,
    pub size: u64,
    pub extents: Vec<Extent>,
}

/// Decode an fmap message produced by [`encode_fmap`]. Trailing buffer
/// padding past the extent array is ignored.
pub fn decode_fmap(buf: &[u8]) -> Result<DecodedFmap, FmapError> {
    let (header, rest) = FmapHeader::read_from_prefix(buf)
        .map_err(|_| FmapError::Malformed("short header"))?;
    if header.version != FMAP_VERSION {
        return Err(FmapError::Malformed("unknown version"));
    }
    if header.ext_class.get() != EXT_CLASS_SIMPLE {
        return Err(FmapError::Malformed("unknown extent class"));
    }
    let kind = FmapFileKind::from_raw(header.kind)
        .ok_or(FmapError::Malformed("unknown file kind"))?;

    let nextents = header.nextents.get() as usize;
    if rest.len() < nextents * EXTENT_LEN {
        return Err(FmapError::Malformed("short extent array"));
    }
    let mut extents = Vec::with_capacity(nextents);
    let mut rest = rest;
    for _ in 0..nextents {
        let (wire, tail) = FmapExtent::read_from_prefix(rest)
            .map_err(|_| FmapError::Malformed("short extent"))?;
        extents.push(Extent {
            offset: wire.offset.get(),
            length: wire.length.get(),
        });
        rest = tail;
    }

    Ok(DecodedFmap {
        kind,
        size: header.size.get(),
        extents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(extents: &[Extent]) -> FileMeta {
        FileMeta {
            size: extents.iter().map(|e| e.length).sum(),
            flags: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            extents: extents.iter().copied().collect(),
        }
    }

    #[test]
    fn single_extent_layout() {
        let meta = meta_with(&[Extent {
            offset: 0,
            length: 4096,
        }]);
        let mut buf = vec![0u8; FMAP_MSG_MAX];
        let len = encode_fmap(&mut buf, FmapFileKind::Regular, &meta).unwrap();
        assert_eq!(len, HEADER_LEN + EXTENT_LEN);

        // kind tag is the first byte on the wire
        assert_eq!(buf[0], 1);
        assert_eq!(buf[1], FMAP_VERSION);
        // one extent, little-endian
        assert_eq!(&buf[4..8], &1u32.to_le_bytes());
        // first extent: offset 0, length 4096
        assert_eq!(&buf[16..24], &0u64.to_le_bytes());
        assert_eq!(&buf[24..32], &4096u64.to_le_bytes());
    }

    #[test]
    fn round_trip_preserves_extent_order() {
        let extents = [
            Extent {
                offset: 0x8000,
                length: 0x1000,
            },
            Extent {
                offset: 0x1000,
                length: 0x2000,
            },
            Extent {
                offset: 0x40000,
                length: 0x1000,
            },
        ];
        let meta = meta_with(&extents);
        let mut buf = vec![0u8; FMAP_MSG_MAX];
        encode_fmap(&mut buf, FmapFileKind::Regular, &meta).unwrap();

        let decoded = decode_fmap(&buf).unwrap();
        assert_eq!(decoded.kind, FmapFileKind::Regular);
        assert_eq!(decoded.size, meta.size);
        assert_eq!(decoded.extents, extents);
    }

    #[test]
    fn empty_extent_list_encodes() {
        let meta = meta_with(&[]);
        let mut buf = vec![0u8; FMAP_MSG_MAX];
        let len = encode_fmap(&mut buf, FmapFileKind::Regular, &meta).unwrap();
        assert_eq!(len, HEADER_LEN);
        assert!(decode_fmap(&buf).unwrap().extents.is_empty());
    }

    #[test]
    fn overflow_is_reported() {
        let extents: Vec<Extent> = (0..((FMAP_MSG_MAX - HEADER_LEN) / EXTENT_LEN + 1) as u64)
            .map(|i| Extent {
                offset: i,
                length: 1,
            })
            .collect();
        let meta = FileMeta {
            size: 0,
            flags: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            extents: smallvec::SmallVec::from_vec(extents),
        };
        let mut buf = vec![0u8; FMAP_MSG_MAX];
        assert!(matches!(
            encode_fmap(&mut buf, FmapFileKind::Regular, &meta),
            Err(FmapError::Overflow { .. })
        ));
    }

    #[test]
    fn truncated_message_is_malformed() {
        let meta = meta_with(&[Extent {
            offset: 1,
            length: 2,
        }]);
        let mut buf = vec![0u8; FMAP_MSG_MAX];
        encode_fmap(&mut buf, FmapFileKind::Regular, &meta).unwrap();
        assert!(decode_fmap(&buf[..8]).is_err());
        assert!(decode_fmap(&buf[..HEADER_LEN + 4]).is_err());
    }
}
