//! Core engine for creating and manipulating QCOW2 virtual disk
//! images: header and extension codec, the two-level guest-to-host
//! cluster map, refcount metadata, cluster allocation, image creation
//! with optional preallocation, open-time validation and resize.
//!
//! The guest-visible data path past the cluster lookup is out of
//! scope: [`dev::Qcow2Dev::get_mapping`] and
//! [`dev::Qcow2Dev::allocate_cluster`] hand out host offsets, payload
//! I/O stays with the caller.
//!
//! ```no_run
//! use qcow2_img::create::Qcow2CreateOptions;
//! use qcow2_img::dev::Qcow2Dev;
//!
//! # fn main() -> qcow2_img::error::Qcow2Result<()> {
//! let opts = Qcow2CreateOptions::new(64 << 30);
//! let dev = Qcow2Dev::create("disk.qcow2".as_ref(), &opts)?;
//!
//! let host = dev.allocate_cluster(0, false)?;
//! println!("guest 0 lives at host offset {:#x}", host);
//!
//! dev.truncate(128 << 30)?;
//! dev.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codec;
pub mod create;
pub mod dev;
pub mod error;
pub mod file;
pub mod helpers;
pub mod mapping;
pub mod meta;
pub mod ops;
pub mod refcount;
pub mod sync_io;
