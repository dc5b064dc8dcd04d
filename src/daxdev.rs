//! DAX backing-device directory.
//!
//! The mount may name one DAX character device; the kernel client asks
//! for its metadata by table index and then maps file extents against it
//! directly. The table is fixed at mount time and read-only afterwards.

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Only one backing device is supported; the table has a single slot.
pub const DAXDEV_TABLE_SLOTS: usize = 1;

/// Fixed width of the device-name field in the wire reply, including the
/// terminating NUL.
pub const DAXDEV_NAME_LEN: usize = 128;

/// Fixed-layout reply for the device-metadata operation.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Debug)]
#[repr(C)]
pub struct DaxDevReply {
    pub index: U32,
    reserved: U32,
    pub name: [u8; DAXDEV_NAME_LEN],
}

impl DaxDevReply {
    /// Device name as stored, without the NUL padding.
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DaxDevError {
    /// Any index other than 0.
    BadIndex,
    /// No `daxdev=` was given at mount time.
    NotConfigured,
}

#[derive(Debug, Default)]
pub struct DaxDevTable {
    slots: [Option<String>; DAXDEV_TABLE_SLOTS],
}

impl DaxDevTable {
    pub fn new(primary: Option<&str>) -> DaxDevTable {
        DaxDevTable {
            slots: [primary.map(str::to_owned)],
        }
    }

    pub fn is_configured(&self) -> bool {
        self.slots[0].is_some()
    }

    pub fn primary(&self) -> Option<&str> {
        self.slots[0].as_deref()
    }

    /// Build the wire reply for `index`. Names longer than the field are
    /// truncated, keeping the terminating NUL.
    pub fn reply(&self, index: u32) -> Result<DaxDevReply, DaxDevError> {
        if index as usize >= DAXDEV_TABLE_SLOTS {
            return Err(DaxDevError::BadIndex);
        }
        let Some(name) = &self.slots[index as usize] else {
            return Err(DaxDevError::NotConfigured);
        };

        let mut out = DaxDevReply {
            index: U32::new(index),
            reserved: U32::new(0),
            name: [0u8; DAXDEV_NAME_LEN],
        };
        let bytes = name.as_bytes();
        let n = bytes.len().min(DAXDEV_NAME_LEN - 1);
        out.name[..n].copy_from_slice(&bytes[..n]);
        Ok(out)
    }
}
