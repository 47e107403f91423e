//! Meridian State - durable cluster-state snapshots
//!
//! This crate persists cluster-state snapshots to one or more data
//! directories as checksummed, atomically-renamed generation files.
//!
//! # Guarantees
//!
//! - A successful [`StateFormat::write`] leaves every directory with a new
//!   `{prefix}{generation}.st` file whose whole-file CRC32 is verified on
//!   read.
//! - The greatest generation found on any directory is authoritative;
//!   [`StateFormat::load_latest`] never silently falls back to an older one.
//! - A failed write reports through [`WriteStateError::dirty`] whether any
//!   directory already holds the new generation under its final name, so the
//!   caller can decide between retry and repair.

pub mod error;
pub mod format;
pub mod store;

pub use error::{Result, StateError, WriteStateError};
pub use format::{LEGACY_FILE_VERSION, STATE_CODEC, STATE_FILE_VERSION};
pub use store::{StateFormat, STATE_DIR_NAME, STATE_FILE_EXTENSION};
