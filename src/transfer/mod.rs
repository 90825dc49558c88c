//! The transfer engine shared by every driver.
//!
//! - [`chunks`] and [`hashing`]: chunk iteration over byte sources and the
//!   running digests used for integrity checks.
//! - [`upload`]: direct and chunked single-request uploads, strategy choice.
//! - [`multipart`]: initiate / upload parts / commit with abort on failure.
//! - [`download`]: range handling and saving streams to disk.
//! - [`session`]: per-transfer state (digest, byte count, parts).

pub mod chunks;
pub mod download;
pub mod hashing;
pub mod multipart;
pub mod session;
pub mod upload;
