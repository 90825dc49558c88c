//! Value records shared by every driver.
//!
//! Containers and objects are plain data: they carry provider metadata as
//! immutable [`metadata::Metadata`] snapshots and delegate all remote work
//! back to the driver that produced them.

pub mod container;
pub mod metadata;
pub mod multipart;
pub mod object;
