use std::borrow::Cow;
use std::collections::HashSet;

use byteorder::{ByteOrder, LittleEndian};
use sdklens_nls::{Decoder, TextDecoder};

use super::value::FieldValue;
use super::vector::{ElementReader, UtlVectorHandle, VectorElements, MAX_VECTOR_ELEMENTS};
use crate::error::{LayoutError, Result};
use crate::layout::{FieldDescriptor, LayoutRegistry, StorageKind, StructureLayout};

/// How a fixed-size `uint8_t[N]` / `char[N]` field is handed back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArrayDecoding {
    /// All `N` bytes.
    #[default]
    Raw,
    /// Text up to the first NUL inside the array, or all `N` bytes when there is none.
    CString,
}

/// A structure layout laid over a borrowed byte buffer.
#[derive(Clone, Copy, Debug)]
pub struct MemoryView<'a> {
    bytes: &'a [u8],
    layout: &'a StructureLayout,
    registry: Option<&'a LayoutRegistry>,
    decoder: Decoder,
}

impl<'a> MemoryView<'a> {
    /// A view over a standalone layout. Inherited fields and vector elements need
    /// [`MemoryView::with_registry`]. Vector headers use the ABI the layout was sized with.
    pub fn new(bytes: &'a [u8], layout: &'a StructureLayout) -> Self {
        Self {
            bytes,
            layout,
            registry: None,
            decoder: Decoder::default(),
        }
    }

    pub fn with_registry(bytes: &'a [u8], layout: &'a StructureLayout, registry: &'a LayoutRegistry) -> Self {
        Self {
            bytes,
            layout,
            registry: Some(registry),
            decoder: Decoder::default(),
        }
    }

    /// Text encoding used for [`ArrayDecoding::CString`].
    pub fn with_decoder(mut self, decoder: Decoder) -> Self {
        self.decoder = decoder;
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn layout(&self) -> &'a StructureLayout {
        self.layout
    }

    /// Find a field on this structure, then on its bases when a registry is attached.
    pub fn field(&self, name: &str) -> Result<&'a FieldDescriptor> {
        if let Some(field) = self.layout.field(name) {
            return Ok(field);
        }
        match self.registry {
            Some(registry) => registry.field(self.layout.name(), name),
            None => Err(LayoutError::UnknownField {
                structure: self.layout.name().to_string(),
                field: name.to_string(),
            }),
        }
    }

    /// The bytes backing `field`. The range is checked before slicing.
    pub fn span(&self, field: &FieldDescriptor) -> Result<&'a [u8]> {
        let out_of_bounds = || LayoutError::FieldOutOfBounds {
            field: field.name().to_string(),
            offset: field.offset(),
            size: field.size(),
            len: self.bytes.len(),
        };
        let end = field.offset().checked_add(field.size()).ok_or_else(out_of_bounds)?;
        if end > self.bytes.len() {
            return Err(out_of_bounds());
        }
        Ok(&self.bytes[field.offset()..end])
    }

    /// The undecoded bytes of any field.
    pub fn raw_span(&self, name: &str) -> Result<&'a [u8]> {
        let field = self.field(name)?;
        self.span(field)
    }

    /// Decode a field; byte arrays come back raw.
    pub fn read_field(&self, name: &str) -> Result<FieldValue<'a>> {
        self.read_field_with(name, ArrayDecoding::Raw)
    }

    pub fn read_field_with(&self, name: &str, decoding: ArrayDecoding) -> Result<FieldValue<'a>> {
        let field = self.field(name)?;
        self.decode(field, decoding)
    }

    /// Decode `field`, which must belong to this view's layout or one of its bases.
    pub fn decode(&self, field: &FieldDescriptor, decoding: ArrayDecoding) -> Result<FieldValue<'a>> {
        let b = self.span(field)?;
        let value = match field.kind() {
            StorageKind::Bool => FieldValue::Bool(b[0] != 0),
            StorageKind::Int8 => FieldValue::I8(b[0] as i8),
            StorageKind::UInt8 => FieldValue::U8(b[0]),
            StorageKind::Int16 => FieldValue::I16(LittleEndian::read_i16(b)),
            StorageKind::UInt16 => FieldValue::U16(LittleEndian::read_u16(b)),
            StorageKind::Int32 => FieldValue::I32(LittleEndian::read_i32(b)),
            StorageKind::UInt32 => FieldValue::U32(LittleEndian::read_u32(b)),
            StorageKind::Int64 => FieldValue::I64(LittleEndian::read_i64(b)),
            StorageKind::UInt64 => FieldValue::U64(LittleEndian::read_u64(b)),
            StorageKind::Float32 => FieldValue::F32(LittleEndian::read_f32(b)),
            StorageKind::Float64 => FieldValue::F64(LittleEndian::read_f64(b)),
            StorageKind::Pointer => FieldValue::Pointer(LittleEndian::read_u64(b)),
            StorageKind::UInt8Array(_) | StorageKind::CharArray(_) => match decoding {
                ArrayDecoding::Raw => FieldValue::Bytes(b),
                ArrayDecoding::CString => FieldValue::Text(self.decoder.decode_cstr(b)),
            },
            StorageKind::NestedVector(elem) => FieldValue::Vector(self.vector_handle(field, b, elem)?),
        };
        Ok(value)
    }

    fn vector_handle(&self, field: &FieldDescriptor, b: &[u8], elem: &str) -> Result<UtlVectorHandle> {
        let abi = self.layout.vector_abi();
        UtlVectorHandle::decode(b, abi, elem).ok_or_else(|| LayoutError::FieldOutOfBounds {
            field: field.name().to_string(),
            offset: field.offset(),
            size: abi.size,
            len: self.bytes.len(),
        })
    }

    fn expect_kind(&self, name: &str, expected: &'static str, ok: fn(&StorageKind) -> bool) -> Result<&'a FieldDescriptor> {
        let field = self.field(name)?;
        if !ok(field.kind()) {
            return Err(mismatch(field, expected));
        }
        Ok(field)
    }

    /// The full array, NUL bytes included.
    pub fn read_bytes(&self, name: &str) -> Result<&'a [u8]> {
        let field = self.expect_kind(name, "a fixed-size array", StorageKind::is_array)?;
        self.span(field)
    }

    /// The array as text, cut at the first NUL within its declared length.
    pub fn read_cstr(&self, name: &str) -> Result<Cow<'a, str>> {
        let field = self.expect_kind(name, "a fixed-size array", StorageKind::is_array)?;
        Ok(self.decoder.decode_cstr(self.span(field)?))
    }

    pub fn read_bool(&self, name: &str) -> Result<bool> {
        let field = self.expect_kind(name, "bool", |k| *k == StorageKind::Bool)?;
        Ok(self.span(field)?[0] != 0)
    }

    pub fn read_i32(&self, name: &str) -> Result<i32> {
        let field = self.expect_kind(name, "int32_t", |k| *k == StorageKind::Int32)?;
        Ok(LittleEndian::read_i32(self.span(field)?))
    }

    pub fn read_u32(&self, name: &str) -> Result<u32> {
        let field = self.expect_kind(name, "uint32_t", |k| *k == StorageKind::UInt32)?;
        Ok(LittleEndian::read_u32(self.span(field)?))
    }

    pub fn read_f32(&self, name: &str) -> Result<f32> {
        let field = self.expect_kind(name, "float32", |k| *k == StorageKind::Float32)?;
        Ok(LittleEndian::read_f32(self.span(field)?))
    }

    pub fn read_pointer(&self, name: &str) -> Result<u64> {
        let field = self.expect_kind(name, "a pointer", |k| *k == StorageKind::Pointer)?;
        Ok(LittleEndian::read_u64(self.span(field)?))
    }

    pub fn read_vector(&self, name: &str) -> Result<UtlVectorHandle> {
        let field = self.field(name)?;
        let StorageKind::NestedVector(elem) = field.kind() else {
            return Err(mismatch(field, "CUtlVector<T>"));
        };
        self.vector_handle(field, self.span(field)?, elem)
    }

    /// Follow a vector field's pointer through `reader` and project each element.
    ///
    /// The element type must be a structure known to the attached registry. The count is
    /// validated before `reader` is called; the whole element block is read at once.
    pub fn read_elements<R: ElementReader + ?Sized>(&self, name: &str, reader: &mut R) -> Result<VectorElements<'a>> {
        let handle = self.read_vector(name)?;
        let registry = self.registry.ok_or_else(|| LayoutError::UnknownStructure {
            name: handle.element_type.clone(),
        })?;
        let elem = registry.lookup(&handle.element_type)?;

        let count = usize::try_from(handle.count)
            .ok()
            .filter(|c| *c <= MAX_VECTOR_ELEMENTS)
            .ok_or_else(|| LayoutError::InvalidVector {
                field: name.to_string(),
                count: handle.count as i64,
                limit: MAX_VECTOR_ELEMENTS,
            })?;
        if count == 0 {
            return Ok(VectorElements::new(registry, elem, handle.pointer, 0, Vec::new()));
        }

        let len = count.checked_mul(elem.total_size()).ok_or_else(|| LayoutError::InvalidVector {
            field: name.to_string(),
            count: handle.count as i64,
            limit: MAX_VECTOR_ELEMENTS,
        })?;
        if handle.is_null() {
            return Err(LayoutError::ElementRead {
                address: 0,
                len,
                reason: format!("{name} holds {count} elements behind a null pointer"),
            });
        }

        log::trace!("{name}: reading {count} x 0x{:X} bytes at 0x{:X}", elem.total_size(), handle.pointer);
        let bytes = reader
            .read_memory(handle.pointer, len)
            .map_err(|e| LayoutError::ElementRead {
                address: handle.pointer,
                len,
                reason: format!("{e:#}"),
            })?;
        if bytes.len() != len {
            return Err(LayoutError::ElementRead {
                address: handle.pointer,
                len,
                reason: format!("reader returned 0x{:X} bytes", bytes.len()),
            });
        }

        Ok(VectorElements::new(registry, elem, handle.pointer, count, bytes))
    }

    /// Every field of this structure in declaration order, preceded by the fields of its
    /// bases (farthest first) when a registry is attached. A field redeclared by a nearer
    /// structure hides the base's one.
    ///
    /// Each field carries its own result so a short buffer still yields the fields it covers.
    pub fn read_all(&self, decoding: ArrayDecoding) -> Vec<(&'a FieldDescriptor, Result<FieldValue<'a>>)> {
        let bases = self
            .registry
            .and_then(|registry| registry.ancestry(self.layout.name()).ok())
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut groups = Vec::new();
        for layout in std::iter::once(self.layout).chain(bases.into_iter().skip(1)) {
            let fields: Vec<&'a FieldDescriptor> =
                layout.fields().iter().filter(|&f| seen.insert(f.name())).collect();
            groups.push(fields);
        }

        groups
            .into_iter()
            .rev()
            .flatten()
            .map(|f| (f, self.decode(f, decoding)))
            .collect()
    }
}

fn mismatch(field: &FieldDescriptor, expected: &'static str) -> LayoutError {
    LayoutError::KindMismatch {
        field: field.name().to_string(),
        expected,
        found: field.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DescriptorSource, RawTable};
    use crate::layout::{LoadOptions, VectorAbi};
    use crate::view::MemoryImage;

    fn registry() -> LayoutRegistry {
        let source = DescriptorSource::from_tables(
            "rendersystemdx11.dll",
            vec![
                RawTable::new("RenderInputLayoutField_t")
                    .field("m_pSemanticName", 0x0, "uint8_t[32]")
                    .field("m_nSemanticIndex", 0x20, "int32_t")
                    .field("m_Format", 0x24, "uint32_t")
                    .field("m_nOffset", 0x28, "int32_t")
                    .field("m_nSlot", 0x2C, "int32_t")
                    .field("m_nSlotType", 0x30, "RenderSlotType_t")
                    .field("m_nInstanceStepRate", 0x34, "int32_t"),
                RawTable::new("VsInputSignatureElement_t")
                    .field("m_pName", 0x0, "char[64]")
                    .field("m_pSemantic", 0x40, "char[64]")
                    .field("m_pD3DSemanticName", 0x80, "char[64]")
                    .field("m_nD3DSemanticIndex", 0xC0, "int32_t"),
                RawTable::new("VsInputSignature_t").field("m_elems", 0x0, "CUtlVector<VsInputSignatureElement_t>"),
            ],
        )
        .unwrap();
        LayoutRegistry::load("2023-10-20T23:01:49", &[source], &LoadOptions::default()).unwrap()
    }

    fn element(name: &str, index: i32) -> Vec<u8> {
        let mut b = vec![0u8; 0xC4];
        b[..name.len()].copy_from_slice(name.as_bytes());
        b[0xC0..0xC4].copy_from_slice(&index.to_le_bytes());
        b
    }

    fn vector_header(count: i32, pointer: u64) -> Vec<u8> {
        let mut b = vec![0u8; 0x18];
        b[0x0..0x4].copy_from_slice(&count.to_le_bytes());
        b[0x8..0x10].copy_from_slice(&pointer.to_le_bytes());
        b[0x10..0x14].copy_from_slice(&(count.max(0) as u32).to_le_bytes());
        b
    }

    #[test]
    fn semantic_index_reads_native_int() {
        let reg = registry();
        let mut buf = vec![0u8; 0x38];
        buf[0x20..0x24].copy_from_slice(&[0x20, 0x00, 0x00, 0x00]);
        let view = reg.view("RenderInputLayoutField_t", &buf).unwrap();
        assert_eq!(view.read_field("m_nSemanticIndex").unwrap(), FieldValue::I32(32));
        assert_eq!(view.read_i32("m_nSemanticIndex").unwrap(), 32);
        assert_eq!(view.read_field("m_nSlotType").unwrap(), FieldValue::I32(0));
    }

    #[test]
    fn char_array_raw_or_cstring() {
        let reg = registry();
        let buf = element("POSITION", 0);
        let view = reg.view("VsInputSignatureElement_t", &buf).unwrap();

        assert_eq!(view.read_cstr("m_pName").unwrap(), "POSITION");
        assert_eq!(
            view.read_field_with("m_pName", ArrayDecoding::CString).unwrap(),
            FieldValue::Text("POSITION".into())
        );

        let raw = view.read_bytes("m_pName").unwrap();
        assert_eq!(raw.len(), 64);
        assert_eq!(&raw[..9], b"POSITION\0");
        assert_eq!(view.read_field("m_pName").unwrap(), FieldValue::Bytes(raw));
    }

    #[test]
    fn out_of_bounds_is_reported_not_sliced() {
        let reg = registry();
        let buf = vec![0u8; 0x22];
        let view = reg.view("RenderInputLayoutField_t", &buf).unwrap();
        match view.read_field("m_nSemanticIndex").unwrap_err() {
            LayoutError::FieldOutOfBounds { field, offset, size, len } => {
                assert_eq!(field, "m_nSemanticIndex");
                assert_eq!((offset, size, len), (0x20, 4, 0x22));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(view.read_bytes("m_pSemanticName").is_ok());
    }

    #[test]
    fn unknown_field_and_kind_mismatch() {
        let reg = registry();
        let buf = vec![0u8; 0x38];
        let view = reg.view("RenderInputLayoutField_t", &buf).unwrap();
        assert!(matches!(
            view.read_field("m_nMissing"),
            Err(LayoutError::UnknownField { .. })
        ));
        assert!(matches!(
            view.read_u32("m_nSemanticIndex"),
            Err(LayoutError::KindMismatch { expected: "uint32_t", .. })
        ));
        assert!(matches!(view.read_cstr("m_Format"), Err(LayoutError::KindMismatch { .. })));
    }

    #[test]
    fn read_all_keeps_declaration_order() {
        let reg = registry();
        let buf = vec![0u8; 0x30];
        let view = reg.view("RenderInputLayoutField_t", &buf).unwrap();
        let all = view.read_all(ArrayDecoding::CString);
        let names: Vec<_> = all.iter().map(|(f, _)| f.name()).collect();
        assert_eq!(names[..3], ["m_pSemanticName", "m_nSemanticIndex", "m_Format"]);
        assert!(all[4].1.is_ok());
        assert!(matches!(all[5].1, Err(LayoutError::FieldOutOfBounds { .. })));
    }

    #[test]
    fn vector_elements_through_reader() {
        let reg = registry();
        let base = 0x2000_0000u64;
        let mut heap = element("POSITION", 0);
        heap.extend(element("TEXCOORD", 1));
        let mut image = MemoryImage::new(base, heap);

        let header = vector_header(2, base);
        let view = reg.view("VsInputSignature_t", &header).unwrap();

        let handle = view.read_vector("m_elems").unwrap();
        assert_eq!((handle.count, handle.capacity, handle.pointer), (2, 2, base));
        assert_eq!(handle.element_type, "VsInputSignatureElement_t");

        let elems = view.read_elements("m_elems", &mut image).unwrap();
        assert_eq!(elems.len(), 2);
        assert_eq!(elems.address(1), Some(base + 0xC4));
        let names: Vec<_> = elems.iter().map(|e| e.read_cstr("m_pName").unwrap().into_owned()).collect();
        assert_eq!(names, ["POSITION", "TEXCOORD"]);
        assert_eq!(elems.get(1).unwrap().read_i32("m_nD3DSemanticIndex").unwrap(), 1);
        assert!(elems.get(2).is_none());
    }

    #[test]
    fn bad_vector_counts_never_reach_the_reader() {
        let reg = registry();
        let mut image = MemoryImage::new(0x1000, vec![0u8; 0x10]);

        for count in [-1, (MAX_VECTOR_ELEMENTS + 1) as i32] {
            let header = vector_header(count, 0x1000);
            let view = reg.view("VsInputSignature_t", &header).unwrap();
            assert!(matches!(
                view.read_elements("m_elems", &mut image),
                Err(LayoutError::InvalidVector { .. })
            ));
        }

        let header = vector_header(1, 0);
        let view = reg.view("VsInputSignature_t", &header).unwrap();
        assert!(matches!(
            view.read_elements("m_elems", &mut image),
            Err(LayoutError::ElementRead { address: 0, .. })
        ));

        let header = vector_header(1, 0x1000);
        let view = reg.view("VsInputSignature_t", &header).unwrap();
        assert!(matches!(
            view.read_elements("m_elems", &mut image),
            Err(LayoutError::ElementRead { address: 0x1000, .. })
        ));
    }

    #[test]
    fn empty_vector_needs_no_memory() {
        let reg = registry();
        let header = vector_header(0, 0);
        let view = reg.view("VsInputSignature_t", &header).unwrap();
        let mut image = MemoryImage::default();
        let elems = view.read_elements("m_elems", &mut image).unwrap();
        assert!(elems.is_empty());
        assert_eq!(elems.iter().count(), 0);
    }

    #[test]
    fn standalone_view_has_no_bases() {
        let reg = registry();
        let layout = reg.lookup("VsInputSignature_t").unwrap();
        let header = vector_header(1, 0x1000);
        let view = MemoryView::new(&header, layout);
        assert!(view.read_vector("m_elems").is_ok());
        assert!(matches!(
            view.read_elements("m_elems", &mut MemoryImage::default()),
            Err(LayoutError::UnknownStructure { .. })
        ));
    }

    fn pulse_registry() -> LayoutRegistry {
        let source = DescriptorSource::from_tables(
            "pulse_system.dll",
            vec![
                RawTable::new("CPulseCell_Base").field("m_nEditorNodeID", 0x8, "int32_t"),
                RawTable::new("CPulseCell_BaseFlow").with_parent("CPulseCell_Base"),
                RawTable::new("CPulseCell_Outflow_CycleOrdered")
                    .with_parent("CPulseCell_BaseFlow")
                    .field("m_Outputs", 0x48, "CUtlVector<CPulseCell_BaseFlow>"),
            ],
        )
        .unwrap();
        LayoutRegistry::load("2023-10-20T23:01:49", &[source], &LoadOptions::default()).unwrap()
    }

    #[test]
    fn elements_with_only_inherited_fields() {
        let reg = pulse_registry();
        assert_eq!(reg.lookup("CPulseCell_BaseFlow").unwrap().total_size(), 0xC);

        let base = 0x4000u64;
        let mut heap = vec![0u8; 0x18];
        heap[0x8..0xC].copy_from_slice(&11i32.to_le_bytes());
        heap[0x14..0x18].copy_from_slice(&12i32.to_le_bytes());
        let mut image = MemoryImage::new(base, heap);

        let mut cell = vec![0u8; 0x60];
        cell[0x48..0x60].copy_from_slice(&vector_header(2, base));
        let view = reg.view("CPulseCell_Outflow_CycleOrdered", &cell).unwrap();

        let elems = view.read_elements("m_Outputs", &mut image).unwrap();
        assert_eq!(elems.address(1), Some(base + 0xC));
        let ids: Vec<_> = elems.iter().map(|e| e.read_i32("m_nEditorNodeID").unwrap()).collect();
        assert_eq!(ids, [11, 12]);
    }

    #[test]
    fn read_all_starts_with_inherited_fields() {
        let reg = pulse_registry();
        let mut cell = vec![0u8; 0x60];
        cell[0x8..0xC].copy_from_slice(&5i32.to_le_bytes());

        let view = reg.view("CPulseCell_Outflow_CycleOrdered", &cell).unwrap();
        let all = view.read_all(ArrayDecoding::Raw);
        let names: Vec<_> = all.iter().map(|(f, _)| f.name()).collect();
        assert_eq!(names, ["m_nEditorNodeID", "m_Outputs"]);
        assert_eq!(all[0].1.as_ref().unwrap(), &FieldValue::I32(5));

        let layout = reg.lookup("CPulseCell_Outflow_CycleOrdered").unwrap();
        assert_eq!(MemoryView::new(&cell, layout).read_all(ArrayDecoding::Raw).len(), 1);
    }

    #[test]
    fn standalone_view_uses_the_layout_vector_abi() {
        let abi = VectorAbi {
            size: 0x20,
            count_offset: 0x10,
            pointer_offset: 0x0,
            capacity_offset: 0x14,
        };
        let source = DescriptorSource::from_tables(
            "rendersystemdx11.dll",
            vec![RawTable::new("VsInputSignature_t").field("m_elems", 0x0, "CUtlVector<VsInputSignatureElement_t>")],
        )
        .unwrap();
        let opts = LoadOptions {
            vector_abi: abi,
            ..LoadOptions::default()
        };
        let reg = LayoutRegistry::load("b", &[source], &opts).unwrap();

        let mut header = vec![0u8; 0x20];
        header[0x0..0x8].copy_from_slice(&0xABCDu64.to_le_bytes());
        header[0x10..0x14].copy_from_slice(&3i32.to_le_bytes());
        header[0x14..0x18].copy_from_slice(&4u32.to_le_bytes());

        let bound = reg.view("VsInputSignature_t", &header).unwrap().read_vector("m_elems").unwrap();
        let layout = reg.lookup("VsInputSignature_t").unwrap();
        let standalone = MemoryView::new(&header, layout).read_vector("m_elems").unwrap();
        assert_eq!(standalone, bound);
        assert_eq!((standalone.pointer, standalone.count, standalone.capacity), (0xABCD, 3, 4));
    }
}
