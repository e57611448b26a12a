use std::collections::HashSet;

use super::kind::{StorageKind, VectorAbi};

/// A single `name -> offset` binding with its decoding rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    name: String,
    offset: usize,
    kind: StorageKind,
    size: usize,
    /// The type comment exactly as the dump spelled it.
    annotation: String,
    /// Declaration ordinal inside the owning structure.
    slot_index: usize,
}

impl FieldDescriptor {
    pub fn new(
        name: impl Into<String>,
        offset: usize,
        kind: StorageKind,
        annotation: impl Into<String>,
        slot_index: usize,
        abi: &VectorAbi,
    ) -> Result<Self, String> {
        let name = name.into();
        let size = kind.size(abi);
        if offset.checked_add(size).is_none() {
            return Err(format!("field {name} at 0x{offset:X} overflows the address space"));
        }
        Ok(Self {
            name,
            offset,
            kind,
            size,
            annotation: annotation.into(),
            slot_index,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn kind(&self) -> &StorageKind {
        &self.kind
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte of the field.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    #[inline]
    pub fn annotation(&self) -> &str {
        &self.annotation
    }

    #[inline]
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }
}

/// Where a structure's total size came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeSource {
    /// Taken from a class-size table.
    Declared,
    /// No size was known; the extent of the declared and inherited fields is used.
    Derived,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructureLayout {
    name: String,
    parent: Option<String>,
    origin: String,
    fields: Vec<FieldDescriptor>,
    total_size: usize,
    size_source: SizeSource,
    /// The vector header shape the field sizes were computed with.
    vector_abi: VectorAbi,
}

impl StructureLayout {
    pub fn new(
        name: impl Into<String>,
        parent: Option<String>,
        origin: impl Into<String>,
        fields: Vec<FieldDescriptor>,
        declared_size: Option<usize>,
        vector_abi: VectorAbi,
    ) -> Result<Self, String> {
        let name = name.into();

        let mut seen = HashSet::with_capacity(fields.len());
        for field in &fields {
            if !seen.insert(field.name()) {
                return Err(format!("field {} declared twice in {}", field.name(), name));
            }
        }

        let extent = fields.iter().map(FieldDescriptor::end).max().unwrap_or(0);
        let (total_size, size_source) = match declared_size {
            Some(size) if size < extent => {
                return Err(format!(
                    "{name} declares size 0x{size:X} but its fields extend to 0x{extent:X}"
                ))
            }
            Some(size) => (size, SizeSource::Declared),
            None => (extent, SizeSource::Derived),
        };

        Ok(Self {
            name,
            parent,
            origin: origin.into(),
            fields,
            total_size,
            size_source,
            vector_abi,
        })
    }

    /// Make the structure cover fields inherited from its bases, which end at `extent`.
    ///
    /// A derived size grows to `extent`; a declared size must already reach it.
    pub(crate) fn cover_inherited(&mut self, extent: usize) -> Result<(), String> {
        match self.size_source {
            SizeSource::Derived => self.total_size = self.total_size.max(extent),
            SizeSource::Declared if self.total_size < extent => {
                return Err(format!(
                    "{} declares size 0x{:X} but its inherited fields extend to 0x{extent:X}",
                    self.name, self.total_size
                ))
            }
            SizeSource::Declared => {}
        }
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base class named by the dump, if any. It may live in another module's dump.
    #[inline]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    #[inline]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Fields in declaration order.
    #[inline]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name() == name)
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    #[inline]
    pub fn size_source(&self) -> SizeSource {
        self.size_source
    }

    #[inline]
    pub fn vector_abi(&self) -> &VectorAbi {
        &self.vector_abi
    }

    /// Highest `offset + size` over the declared fields.
    pub fn extent(&self) -> usize {
        self.fields.iter().map(FieldDescriptor::end).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, offset: usize, kind: StorageKind, slot: usize) -> FieldDescriptor {
        let annotation = kind.to_string();
        FieldDescriptor::new(name, offset, kind, annotation, slot, &VectorAbi::default()).unwrap()
    }

    #[test]
    fn derived_size_is_field_extent() {
        let layout = StructureLayout::new(
            "VsInputSignatureElement_t",
            None,
            "test",
            vec![
                field("m_pName", 0x0, StorageKind::CharArray(64), 0),
                field("m_nD3DSemanticIndex", 0xC0, StorageKind::Int32, 1),
            ],
            None,
            VectorAbi::default(),
        )
        .unwrap();
        assert_eq!(layout.total_size(), 0xC4);
        assert_eq!(layout.size_source(), SizeSource::Derived);
    }

    #[test]
    fn declared_size_may_carry_trailing_padding() {
        let layout = StructureLayout::new(
            "VsInputSignatureElement_t",
            None,
            "test",
            vec![field("m_nD3DSemanticIndex", 0xC0, StorageKind::Int32, 0)],
            Some(0xC8),
            VectorAbi::default(),
        )
        .unwrap();
        assert_eq!(layout.total_size(), 0xC8);
        assert_eq!(layout.extent(), 0xC4);
        assert_eq!(layout.size_source(), SizeSource::Declared);
    }

    #[test]
    fn declared_size_smaller_than_fields_is_rejected() {
        let err = StructureLayout::new(
            "X",
            None,
            "test",
            vec![field("m_a", 0x10, StorageKind::Int64, 0)],
            Some(0x14),
            VectorAbi::default(),
        )
        .unwrap_err();
        assert!(err.contains("0x18"), "{err}");
    }

    #[test]
    fn overlapping_offsets_are_allowed() {
        let layout = StructureLayout::new(
            "Union_t",
            None,
            "test",
            vec![
                field("m_nAsInt", 0x0, StorageKind::Int32, 0),
                field("m_flAsFloat", 0x0, StorageKind::Float32, 1),
            ],
            None,
            VectorAbi::default(),
        )
        .unwrap();
        assert_eq!(layout.total_size(), 4);
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let err = StructureLayout::new(
            "X",
            None,
            "test",
            vec![
                field("m_a", 0x0, StorageKind::Int32, 0),
                field("m_a", 0x4, StorageKind::Int32, 1),
            ],
            None,
            VectorAbi::default(),
        )
        .unwrap_err();
        assert!(err.contains("m_a"));
    }

    #[test]
    fn inherited_fields_widen_derived_sizes_only() {
        let mut flow = StructureLayout::new(
            "CPulseCell_BaseFlow",
            Some("CPulseCell_Base".into()),
            "test",
            Vec::new(),
            None,
            VectorAbi::default(),
        )
        .unwrap();
        assert_eq!(flow.total_size(), 0);
        flow.cover_inherited(0xC).unwrap();
        assert_eq!(flow.total_size(), 0xC);
        assert_eq!(flow.extent(), 0);

        let mut padded = StructureLayout::new(
            "CPulseCell_BaseFlow",
            Some("CPulseCell_Base".into()),
            "test",
            Vec::new(),
            Some(0x8),
            VectorAbi::default(),
        )
        .unwrap();
        let err = padded.cover_inherited(0xC).unwrap_err();
        assert!(err.contains("0xC"), "{err}");
        padded.cover_inherited(0x8).unwrap();
    }
}
