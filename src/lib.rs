//! shadowfs: a read-oriented FUSE daemon backed by a shadow tree.
//!
//! The authoritative on-disk state is a directory hierarchy on a
//! conventional filesystem in which every regular file is a small YAML
//! document describing the real file: ownership, size, and a list of
//! extents into a shared DAX character device. The daemon answers
//! metadata operations out of a refcounted inode cache and hands the
//! kernel client fmaps, so file data never passes through userspace.
//! All mutating operations are refused; the shadow tree is managed
//! externally and is the sole write path.

pub mod daxdev;
pub mod fmap;
pub mod fs;
pub mod icache;
pub mod opts;
pub mod shadow;
pub mod sys;

pub use fs::{FlockOp, SetattrRequest, ShadowFs, IOC_GET_DAXDEV, IOC_GET_FMAP};
pub use opts::{CachePolicy, MountOpts, OptError};
