//! Bounded byte cursors for the ricochet transport.
//!
//! This crate provides [`ByteWriter`] and [`ByteReader`] for big-endian
//! encoding and decoding of fixed-width integers and raw byte runs.
//!
//! # Design Principles
//!
//! - **No unsafe code** - Safety is paramount.
//! - **Bounded operations** - All reads/writes are bounds-checked.
//! - **No allocation** - Writers fill caller buffers, readers borrow their input.
//! - **Explicit errors** - All failures return structured errors, never panic.
//!
//! # Example
//!
//! ```
//! use octets::{ByteReader, ByteWriter};
//!
//! let mut buf = [0u8; 6];
//! let mut writer = ByteWriter::new(&mut buf);
//! writer.write_u16(0x0102).unwrap();
//! writer.write_u32(42).unwrap();
//! let len = writer.finish();
//!
//! let mut reader = ByteReader::new(&buf[..len]);
//! assert_eq!(reader.read_u16().unwrap(), 0x0102);
//! assert_eq!(reader.read_u32().unwrap(), 42);
//! ```

mod error;
mod reader;
mod writer;

pub use error::{OctetError, OctetResult};
pub use reader::ByteReader;
pub use writer::ByteWriter;
