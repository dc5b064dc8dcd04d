//! Shadow metadata codec.
//!
//! Every regular file in the shadow tree is a small YAML document that
//! describes the real, DAX-backed file: ownership, permission bits, the
//! logical size, and the list of extents into the backing device.
//!
//! ```yaml
//! file:
//!   path: dir1/f1
//!   size: 4096
//!   flags: 2
//!   mode: 0o644
//!   uid: 1000
//!   gid: 1000
//!   nextents: 1
//!   simple_ext_list:
//!   - offset: 0x3f000000
//!     length: 0x1000
//! ```
//!
//! Mode is written in octal and extent offsets/lengths in hex, so numeric
//! scalars are accepted both as YAML integers and as strings carrying a
//! base prefix (`0x…`, `0o…`, `0…`).

use std::fmt;
use std::fmt::Write as _;

use serde::Deserialize;
use smallvec::SmallVec;

/// Upper bound on a shadow document. Anything larger is not a valid
/// shadow file.
pub const SHADOW_DOC_MAX: usize = 4096;

/// Ceiling on the extent list; matches what fits comfortably in one fmap
/// reply and keeps documents bounded.
pub const MAX_EXTENTS: usize = 16;

/// One contiguous run of bytes in the backing DAX device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

/// Parsed contents of a shadow document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub flags: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub extents: SmallVec<[Extent; 2]>,
}

#[derive(Debug)]
pub enum ShadowError {
    Yaml(serde_yaml::Error),
    Document(String),
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowError::Yaml(e) => write!(f, "shadow yaml: {e}"),
            ShadowError::Document(msg) => write!(f, "shadow document: {msg}"),
        }
    }
}

impl std::error::Error for ShadowError {}

impl From<serde_yaml::Error> for ShadowError {
    fn from(e: serde_yaml::Error) -> Self {
        ShadowError::Yaml(e)
    }
}

/// A numeric scalar that may arrive as a YAML integer or as a string with
/// a base prefix.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Num(u64),
    Text(String),
}

impl Scalar {
    fn value(&self) -> Result<u64, ShadowError> {
        match self {
            Scalar::Num(n) => Ok(*n),
            Scalar::Text(s) => parse_scalar_u64(s),
        }
    }

    fn value_u32(&self, key: &str) -> Result<u32, ShadowError> {
        let v = self.value()?;
        u32::try_from(v)
            .map_err(|_| ShadowError::Document(format!("{key} out of range: {v}")))
    }
}

/// `strtoull(s, NULL, 0)` semantics: `0x` hex, `0o` or leading-zero octal,
/// decimal otherwise.
fn parse_scalar_u64(s: &str) -> Result<u64, ShadowError> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        u64::from_str_radix(oct, 8)
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|_| ShadowError::Document(format!("bad numeric scalar {s:?}")))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShadowDoc {
    file: FileSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSection {
    #[serde(default)]
    #[allow(dead_code)]
    path: Option<String>,
    size: Scalar,
    flags: Scalar,
    mode: Scalar,
    uid: Scalar,
    gid: Scalar,
    nextents: Scalar,
    simple_ext_list: Vec<ExtentNode>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtentNode {
    offset: Scalar,
    length: Scalar,
}

/// Parse a complete shadow document.
pub fn parse_shadow_doc(buf: &[u8]) -> Result<FileMeta, ShadowError> {
    if buf.len() > SHADOW_DOC_MAX {
        return Err(ShadowError::Document(format!(
            "document too large ({} bytes, limit {})",
            buf.len(),
            SHADOW_DOC_MAX
        )));
    }
    let doc: ShadowDoc = serde_yaml::from_slice(buf)?;
    let file = doc.file;

    if file.simple_ext_list.len() > MAX_EXTENTS {
        return Err(ShadowError::Document(format!(
            "too many extents ({}, limit {})",
            file.simple_ext_list.len(),
            MAX_EXTENTS
        )));
    }

    let mut extents = SmallVec::new();
    for node in &file.simple_ext_list {
        extents.push(Extent {
            offset: node.offset.value()?,
            length: node.length.value()?,
        });
    }

    let nextents = file.nextents.value()? as usize;
    if nextents != extents.len() {
        log::warn!(
            "shadow document extent count mismatch: nextents={} list={}",
            nextents,
            extents.len()
        );
    }

    Ok(FileMeta {
        size: file.size.value()?,
        flags: file.flags.value_u32("flags")?,
        mode: file.mode.value_u32("mode")?,
        uid: file.uid.value_u32("uid")?,
        gid: file.gid.value_u32("gid")?,
        extents,
    })
}

/// Render `meta` as a shadow document. The inverse of [`parse_shadow_doc`]
/// for every field the parser retains.
pub fn emit_shadow_doc(meta: &FileMeta, relpath: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "file:");
    let _ = writeln!(out, "  path: {relpath}");
    let _ = writeln!(out, "  size: {}", meta.size);
    let _ = writeln!(out, "  flags: {}", meta.flags);
    let _ = writeln!(out, "  mode: 0o{:o}", meta.mode);
    let _ = writeln!(out, "  uid: {}", meta.uid);
    let _ = writeln!(out, "  gid: {}", meta.gid);
    let _ = writeln!(out, "  nextents: {}", meta.extents.len());
    let _ = writeln!(out, "  simple_ext_list:");
    for ext in &meta.extents {
        let _ = writeln!(out, "  - offset: 0x{:x}", ext.offset);
        let _ = writeln!(out, "    length: 0x{:x}", ext.length);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn sample_meta() -> FileMeta {
        FileMeta {
            size: 0x200000,
            flags: 2,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            extents: smallvec![Extent {
                offset: 0x3f000000,
                length: 0x200000,
            }],
        }
    }

    #[test]
    fn parse_canonical_document() {
        let doc = "\
file:
  path: dir1/f1
  size: 4096
  flags: 2
  mode: 0o644
  uid: 1000
  gid: 1000
  nextents: 1
  simple_ext_list:
  - offset: 0x3f000000
    length: 0x1000
";
        let meta = parse_shadow_doc(doc.as_bytes()).unwrap();
        assert_eq!(meta.size, 4096);
        assert_eq!(meta.mode, 0o644);
        assert_eq!(meta.uid, 1000);
        assert_eq!(meta.gid, 1000);
        assert_eq!(meta.flags, 2);
        assert_eq!(
            meta.extents.as_slice(),
            &[Extent {
                offset: 0x3f000000,
                length: 0x1000
            }]
        );
    }

    #[test]
    fn emit_parse_round_trip() {
        let meta = sample_meta();
        let doc = emit_shadow_doc(&meta, "a/f");
        let parsed = parse_shadow_doc(doc.as_bytes()).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn scalar_bases() {
        assert_eq!(parse_scalar_u64("0x10").unwrap(), 16);
        assert_eq!(parse_scalar_u64("0o644").unwrap(), 0o644);
        assert_eq!(parse_scalar_u64("0644").unwrap(), 0o644);
        assert_eq!(parse_scalar_u64("644").unwrap(), 644);
        assert_eq!(parse_scalar_u64("0").unwrap(), 0);
        assert!(parse_scalar_u64("0x").is_err());
        assert!(parse_scalar_u64("banana").is_err());
    }

    #[test]
    fn quoted_scalars_keep_their_base() {
        let doc = "\
file:
  size: '4096'
  flags: 0
  mode: '0644'
  uid: 0
  gid: 0
  nextents: 0
  simple_ext_list: []
";
        let meta = parse_shadow_doc(doc.as_bytes()).unwrap();
        assert_eq!(meta.mode, 0o644);
        assert_eq!(meta.size, 4096);
        assert!(meta.extents.is_empty());
    }

    #[test]
    fn multiple_extents_keep_order() {
        let mut meta = sample_meta();
        meta.extents = smallvec![
            Extent {
                offset: 0x1000,
                length: 0x1000
            },
            Extent {
                offset: 0x8000,
                length: 0x2000
            },
            Extent {
                offset: 0x2000,
                length: 0x1000
            },
        ];
        let doc = emit_shadow_doc(&meta, "f");
        let parsed = parse_shadow_doc(doc.as_bytes()).unwrap();
        assert_eq!(parsed.extents, meta.extents);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let doc = "\
file:
  size: 1
  flags: 0
  mode: 0o644
  uid: 0
  gid: 0
  nextents: 0
  simple_ext_list: []
  surprise: 1
";
        assert!(parse_shadow_doc(doc.as_bytes()).is_err());
    }

    #[test]
    fn oversized_document_is_rejected() {
        let mut doc = emit_shadow_doc(&sample_meta(), "f").into_bytes();
        doc.resize(SHADOW_DOC_MAX + 1, b' ');
        assert!(parse_shadow_doc(&doc).is_err());
    }

    #[test]
    fn extent_limit_enforced() {
        let mut meta = sample_meta();
        meta.extents = (0..MAX_EXTENTS as u64 + 1)
            .map(|i| Extent {
                offset: i * 0x1000,
                length: 0x1000,
            })
            .collect();
        let doc = emit_shadow_doc(&meta, "f");
        assert!(parse_shadow_doc(doc.as_bytes()).is_err());
    }

    #[test]
    fn garbage_is_a_yaml_error() {
        assert!(parse_shadow_doc(b"not: [valid").is_err());
        assert!(parse_shadow_doc(b"").is_err());
    }
}
