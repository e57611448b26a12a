//! sdklens-core
//!
//! Loads offset dumps (`name -> offset // type` tables emitted by schema dumpers) into
//! immutable per-build layout registries, and projects raw byte buffers through those
//! layouts with bounds-checked, read-only field access.
//!
//! The pieces, bottom-up:
//! - [`format`] turns dump files into [`DescriptorSource`]s.
//! - [`layout`] resolves type annotations and builds a [`LayoutRegistry`].
//! - [`view`] reads fields out of a caller-supplied buffer via a [`MemoryView`].
//! - [`version`] picks the registry for an exact build identifier.
//! - [`snapshot`] caches a registry on disk, one file per build.

pub mod diff;
pub mod error;
pub mod format;
pub mod layout;
pub mod snapshot;
pub mod version;
pub mod view;

pub use error::{LayoutError, Result};
pub use format::{DescriptorSource, DumpFormat, RawField, RawTable};
pub use layout::{
    FieldDescriptor, KindTable, LayoutRegistry, LoadOptions, SizeSource, StorageKind,
    StructureLayout, VectorAbi,
};
pub use version::VersionResolver;
pub use view::{
    ArrayDecoding, ElementReader, FieldValue, MemoryImage, MemoryView, UtlVectorHandle, VectorElements,
};
