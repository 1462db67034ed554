//! Runtime Library (rtl)
//!
//! Read-only views over image bytes, shared by the raw file buffer and the
//! mapped image:
//!
//! - **Pod / ByteView**: bounds-checked unaligned structure reads
//! - **HeaderLayout**: validated offset table of the PE headers
//! - **rva_to_offset / import_names**: lookups on the unmapped file

pub mod image;

pub use image::{import_names, rva_to_offset, ByteView, HeaderLayout, Pod};
