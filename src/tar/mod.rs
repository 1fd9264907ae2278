//! Stream-based POSIX ustar reader and writer: PAX long-name
//! support, gzip wrapper, and a safe extraction path policy. Hand-rolled
//! rather than built on the `tar` crate because the byte-level requirements
//! here (CRC32-derived fallback naming, blanked-checksum byte-sum, zeroed
//! uid/gid, directory-mtime-after-children) need header-level control that
//! crate's `Builder`/`Archive` API does not expose.

pub mod header;
pub mod pax;
pub mod reader;
pub mod writer;

pub use reader::{extract_archive, extract_stream, extract_tar_gz, ExtractOptions};
pub use writer::{write_tar, write_tar_gz};
