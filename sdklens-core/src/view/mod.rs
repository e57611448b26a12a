//! Read-only projection of raw bytes through a [`StructureLayout`](crate::StructureLayout).
//!
//! A [`MemoryView`] never copies the buffer and never writes to it. Every field access is
//! bounds-checked against the buffer length before the slice is taken.

mod image;
mod memory_view;
mod value;
mod vector;

pub use image::MemoryImage;
pub use memory_view::{ArrayDecoding, MemoryView};
pub use value::FieldValue;
pub use vector::{ElementReader, UtlVectorHandle, VectorElements, MAX_VECTOR_ELEMENTS};
