use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::MemoryView;
use crate::layout::{LayoutRegistry, StructureLayout, VectorAbi};

/// Upper bound on the element count of a vector before any element memory is read.
pub const MAX_VECTOR_ELEMENTS: usize = 1_000_000;

/// The second memory read needed to follow a `CUtlVector` element pointer.
///
/// Implemented by whatever acquires process memory; the view itself never does I/O.
pub trait ElementReader {
    /// Read exactly `len` bytes at `address`.
    fn read_memory(&mut self, address: u64, len: usize) -> anyhow::Result<Vec<u8>>;
}

impl<R: ElementReader + ?Sized> ElementReader for &mut R {
    fn read_memory(&mut self, address: u64, len: usize) -> anyhow::Result<Vec<u8>> {
        (**self).read_memory(address, len)
    }
}

/// The raw header of a `CUtlVector<T>` field. Nothing behind `pointer` has been read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UtlVectorHandle {
    pub pointer: u64,
    /// Signed as stored; a negative count means the memory is not a live vector.
    pub count: i32,
    /// Allocation count of the embedded `CUtlMemory`.
    pub capacity: u32,
    pub element_type: String,
}

impl UtlVectorHandle {
    /// Decode from the handle bytes. `None` when `bytes` is shorter than the ABI needs.
    pub(crate) fn decode(bytes: &[u8], abi: &VectorAbi, element_type: &str) -> Option<Self> {
        let count = bytes.get(abi.count_offset..abi.count_offset.checked_add(4)?)?;
        let pointer = bytes.get(abi.pointer_offset..abi.pointer_offset.checked_add(8)?)?;
        let capacity = bytes.get(abi.capacity_offset..abi.capacity_offset.checked_add(4)?)?;
        Some(Self {
            pointer: LittleEndian::read_u64(pointer),
            count: LittleEndian::read_i32(count),
            capacity: LittleEndian::read_u32(capacity),
            element_type: element_type.to_string(),
        })
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.pointer == 0
    }
}

impl fmt::Display for UtlVectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CUtlVector<{}> {{ count: {}, capacity: {}, pointer: 0x{:X} }}",
            self.element_type, self.count, self.capacity, self.pointer
        )
    }
}

/// Element memory of one vector, read in a single call and projected per element.
#[derive(Debug)]
pub struct VectorElements<'a> {
    registry: &'a LayoutRegistry,
    layout: &'a StructureLayout,
    base: u64,
    stride: usize,
    count: usize,
    bytes: Vec<u8>,
}

impl<'a> VectorElements<'a> {
    pub(crate) fn new(
        registry: &'a LayoutRegistry,
        layout: &'a StructureLayout,
        base: u64,
        count: usize,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            registry,
            layout,
            base,
            stride: layout.total_size(),
            count,
            bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Layout of a single element.
    #[inline]
    pub fn layout(&self) -> &'a StructureLayout {
        self.layout
    }

    /// Address of element `index` in the inspected process.
    pub fn address(&self, index: usize) -> Option<u64> {
        if index >= self.count {
            return None;
        }
        let offset = u64::try_from(index.checked_mul(self.stride)?).ok()?;
        self.base.checked_add(offset)
    }

    pub fn get(&self, index: usize) -> Option<MemoryView<'_>> {
        if index >= self.count {
            return None;
        }
        let start = index.checked_mul(self.stride)?;
        let bytes = self.bytes.get(start..start.checked_add(self.stride)?)?;
        Some(MemoryView::with_registry(bytes, self.layout, self.registry))
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryView<'_>> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }
}
