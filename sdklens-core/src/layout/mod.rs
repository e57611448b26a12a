//! Structure layouts and the per-build registry that owns them.

mod kind;
mod options;
mod registry;
mod structure;

pub use kind::{KindTable, StorageKind, VectorAbi};
pub use options::LoadOptions;
pub use registry::LayoutRegistry;
pub use structure::{FieldDescriptor, SizeSource, StructureLayout};
