//! Binary registry snapshots, one file per build.
//!
//! ```text
//! magic "SDKL" | u16 version | build | vector ABI (4 x u64) | u32 structure count
//! structure: name | u8 has_parent [parent] | origin | u64 total size | u8 size source
//!            | u32 field count | fields
//! field:     name | u64 offset | annotation | u8 kind tag [u32 length | element type]
//! string:    u32 byte length | UTF-8
//! ```
//!
//! All integers are little-endian. Loading re-validates every layout as if it came from a dump.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{LayoutError, Result};
use crate::layout::{FieldDescriptor, LayoutRegistry, SizeSource, StorageKind, StructureLayout, VectorAbi};

pub const MAGIC: &[u8; 4] = b"SDKL";
pub const FORMAT_VERSION: u16 = 1;
pub const EXTENSION: &str = "sdkl";

const MAX_STRING_LEN: usize = 4096;
const MAX_STRUCTURES: usize = 1_000_000;
const MAX_FIELDS: usize = 100_000;

fn bad(reason: impl Into<String>) -> LayoutError {
    LayoutError::Snapshot(reason.into())
}

fn kind_tag(kind: &StorageKind) -> u8 {
    match kind {
        StorageKind::Bool => 0,
        StorageKind::Int8 => 1,
        StorageKind::UInt8 => 2,
        StorageKind::Int16 => 3,
        StorageKind::UInt16 => 4,
        StorageKind::Int32 => 5,
        StorageKind::UInt32 => 6,
        StorageKind::Int64 => 7,
        StorageKind::UInt64 => 8,
        StorageKind::Float32 => 9,
        StorageKind::Float64 => 10,
        StorageKind::Pointer => 11,
        StorageKind::UInt8Array(_) => 12,
        StorageKind::CharArray(_) => 13,
        StorageKind::NestedVector(_) => 14,
    }
}

/// Serialize `registry` into `w`.
pub fn write<W: Write>(registry: &LayoutRegistry, w: &mut W) -> Result<()> {
    w.write_all(MAGIC)?;
    w.write_u16::<LittleEndian>(FORMAT_VERSION)?;
    write_str(w, registry.build_version())?;

    let abi = registry.vector_abi();
    for v in [abi.size, abi.count_offset, abi.pointer_offset, abi.capacity_offset] {
        w.write_u64::<LittleEndian>(v as u64)?;
    }

    w.write_u32::<LittleEndian>(count_within(registry.len(), MAX_STRUCTURES, || "structure count".into())?)?;
    for layout in registry.structures() {
        write_str(w, layout.name())?;
        match layout.parent() {
            Some(parent) => {
                w.write_u8(1)?;
                write_str(w, parent)?;
            }
            None => w.write_u8(0)?,
        }
        write_str(w, layout.origin())?;
        w.write_u64::<LittleEndian>(layout.total_size() as u64)?;
        w.write_u8(match layout.size_source() {
            SizeSource::Declared => 0,
            SizeSource::Derived => 1,
        })?;

        let fields = count_within(layout.fields().len(), MAX_FIELDS, || format!("{}: field count", layout.name()))?;
        w.write_u32::<LittleEndian>(fields)?;
        for field in layout.fields() {
            write_str(w, field.name())?;
            w.write_u64::<LittleEndian>(field.offset() as u64)?;
            write_str(w, field.annotation())?;
            w.write_u8(kind_tag(field.kind()))?;
            match field.kind() {
                StorageKind::UInt8Array(len) | StorageKind::CharArray(len) => w.write_u32::<LittleEndian>(*len)?,
                StorageKind::NestedVector(elem) => write_str(w, elem)?,
                _ => {}
            }
        }
    }
    Ok(())
}

/// A count as stored on disk. Counts that `read` would refuse are refused here too.
fn count_within(count: usize, limit: usize, what: impl FnOnce() -> String) -> Result<u32> {
    if count > limit {
        return Err(bad(format!("{} {count} exceeds limit of {limit}", what())));
    }
    u32::try_from(count).map_err(|_| bad(format!("{} {count} does not fit in u32", what())))
}

fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    if s.len() > MAX_STRING_LEN {
        return Err(bad(format!("string of {} bytes exceeds limit of {MAX_STRING_LEN}", s.len())));
    }
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub fn to_bytes(registry: &LayoutRegistry) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write(registry, &mut out)?;
    Ok(out)
}

/// Parse a snapshot. The whole input must be consumed.
pub fn read(bytes: &[u8]) -> Result<LayoutRegistry> {
    let mut r = bytes;
    let registry = read_registry(&mut r).map_err(|e| match e {
        LayoutError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => bad("truncated snapshot"),
        other => other,
    })?;
    if !r.is_empty() {
        return Err(bad(format!("{} bytes of trailing data", r.len())));
    }
    Ok(registry)
}

fn read_registry<R: Read>(r: &mut R) -> Result<LayoutRegistry> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(bad(format!("bad magic {magic:02X?}")));
    }
    let version = r.read_u16::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(bad(format!("unsupported format version {version} (expected {FORMAT_VERSION})")));
    }

    let build = read_str(r)?;
    let vector_abi = VectorAbi {
        size: read_usize(r)?,
        count_offset: read_usize(r)?,
        pointer_offset: read_usize(r)?,
        capacity_offset: read_usize(r)?,
    };

    let count = r.read_u32::<LittleEndian>()? as usize;
    count_within(count, MAX_STRUCTURES, || "structure count".into())?;
    let mut layouts = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        layouts.push(read_layout(r, &vector_abi)?);
    }

    LayoutRegistry::from_layouts(build, layouts, vector_abi).map_err(bad)
}

fn read_layout<R: Read>(r: &mut R, abi: &VectorAbi) -> Result<StructureLayout> {
    let name = read_str(r)?;
    let parent = match r.read_u8()? {
        0 => None,
        1 => Some(read_str(r)?),
        other => return Err(bad(format!("{name}: bad parent flag {other}"))),
    };
    let origin = read_str(r)?;
    let total_size = read_usize(r)?;
    let size_source = match r.read_u8()? {
        0 => SizeSource::Declared,
        1 => SizeSource::Derived,
        other => return Err(bad(format!("{name}: bad size source {other}"))),
    };

    let field_count = r.read_u32::<LittleEndian>()? as usize;
    count_within(field_count, MAX_FIELDS, || format!("{name}: field count"))?;
    let mut fields = Vec::with_capacity(field_count.min(1024));
    for slot in 0..field_count {
        let field_name = read_str(r)?;
        let offset = read_usize(r)?;
        let annotation = read_str(r)?;
        let kind = match r.read_u8()? {
            0 => StorageKind::Bool,
            1 => StorageKind::Int8,
            2 => StorageKind::UInt8,
            3 => StorageKind::Int16,
            4 => StorageKind::UInt16,
            5 => StorageKind::Int32,
            6 => StorageKind::UInt32,
            7 => StorageKind::Int64,
            8 => StorageKind::UInt64,
            9 => StorageKind::Float32,
            10 => StorageKind::Float64,
            11 => StorageKind::Pointer,
            12 => StorageKind::UInt8Array(read_array_len(r, &name, &field_name)?),
            13 => StorageKind::CharArray(read_array_len(r, &name, &field_name)?),
            14 => StorageKind::NestedVector(read_str(r)?),
            tag => return Err(bad(format!("{name}::{field_name}: unknown kind tag {tag}"))),
        };
        fields.push(FieldDescriptor::new(field_name, offset, kind, annotation, slot, abi).map_err(bad)?);
    }

    let declared = match size_source {
        SizeSource::Declared => Some(total_size),
        SizeSource::Derived => None,
    };
    let mut layout = StructureLayout::new(name, parent, origin, fields, declared, *abi).map_err(bad)?;
    if layout.total_size() > total_size {
        return Err(bad(format!(
            "{}: stored size 0x{total_size:X} does not match field extent 0x{:X}",
            layout.name(),
            layout.total_size()
        )));
    }
    // Derived sizes may include inherited fields; the registry checks them against the bases.
    layout.cover_inherited(total_size).map_err(bad)?;
    Ok(layout)
}

fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if len > MAX_STRING_LEN {
        return Err(bad(format!("string length {len} exceeds limit of {MAX_STRING_LEN}")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| bad("invalid UTF-8 in string"))
}

fn read_usize<R: Read>(r: &mut R) -> Result<usize> {
    let v = r.read_u64::<LittleEndian>()?;
    usize::try_from(v).map_err(|_| bad(format!("value 0x{v:X} does not fit in usize")))
}

fn read_array_len<R: Read>(r: &mut R, structure: &str, field: &str) -> Result<u32> {
    match r.read_u32::<LittleEndian>()? {
        0 => Err(bad(format!("{structure}::{field}: zero-length array"))),
        len => Ok(len),
    }
}

/// `<build>.sdkl`, with every character outside `[A-Za-z0-9._-]` replaced by `_`.
pub fn file_name(build: &str) -> String {
    let stem: String = build
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    format!("{stem}.{EXTENSION}")
}

/// Write `registry` into `dir`, replacing the previous snapshot of the same build.
pub fn save(registry: &LayoutRegistry, dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name(registry.build_version()));
    std::fs::write(&path, to_bytes(registry)?)?;
    log::info!("wrote {} structures for build {} to {}", registry.len(), registry.build_version(), path.display());
    Ok(path)
}

pub fn load(path: impl AsRef<Path>) -> Result<LayoutRegistry> {
    let path = path.as_ref();
    let registry = read(&std::fs::read(path)?)?;
    log::debug!("{}: build {} with {} structures", path.display(), registry.build_version(), registry.len());
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DescriptorSource, RawTable};
    use crate::layout::LoadOptions;
    use pretty_assertions::assert_eq;

    fn registry() -> LayoutRegistry {
        let source = DescriptorSource::from_tables(
            "rendersystemdx11.dll",
            vec![
                RawTable::new("VsInputSignatureElement_t")
                    .field("m_pName", 0x0, "char[64]")
                    .field("m_nD3DSemanticIndex", 0xC0, "int32_t"),
                RawTable::new("VsInputSignature_t").field("m_elems", 0x0, "CUtlVector<VsInputSignatureElement_t>"),
                RawTable::new("RenderInputLayoutField_t")
                    .with_parent("RenderBase_t")
                    .field("m_pSemanticName", 0x0, "uint8_t[32]")
                    .field("m_nSlotType", 0x30, "RenderSlotType_t")
                    .field("m_flScale", 0x34, "float32")
                    .field("m_pNext", 0x38, "RenderInputLayoutField_t*"),
            ],
        )
        .unwrap();
        let mut opts = LoadOptions::default();
        opts.sizes.insert("VsInputSignature_t".into(), 0x18);
        LayoutRegistry::load("2023-10-20T23:01:49", &[source], &opts).unwrap()
    }

    #[test]
    fn round_trip() {
        let registry = registry();
        let bytes = to_bytes(&registry).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(read(&bytes).unwrap(), registry);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let path = save(&registry, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "2023-10-20T23_01_49.sdkl");
        assert_eq!(load(&path).unwrap(), registry);
    }

    #[test]
    fn bad_magic_and_version() {
        let mut bytes = to_bytes(&registry()).unwrap();
        bytes[0] = b'X';
        assert!(matches!(read(&bytes), Err(LayoutError::Snapshot(_))));

        let mut bytes = to_bytes(&registry()).unwrap();
        bytes[4..6].copy_from_slice(&2u16.to_le_bytes());
        let err = read(&bytes).unwrap_err();
        assert!(err.to_string().contains("version 2"), "{err}");
    }

    #[test]
    fn truncated_and_trailing_data() {
        let bytes = to_bytes(&registry()).unwrap();
        assert!(matches!(read(&bytes[..bytes.len() - 3]), Err(LayoutError::Snapshot(_))));

        let mut long = bytes.clone();
        long.push(0);
        assert!(matches!(read(&long), Err(LayoutError::Snapshot(_))));
    }

    #[test]
    fn oversized_string_is_rejected_before_allocation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = read(&bytes).unwrap_err();
        assert!(err.to_string().contains("exceeds limit"), "{err}");
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(file_name("2023-10-20T23:01:49"), "2023-10-20T23_01_49.sdkl");
        assert_eq!(file_name("cs2 / 1.39.7.2"), "cs2___1.39.7.2.sdkl");
    }

    #[test]
    fn counts_over_the_read_limits_are_not_written() {
        assert_eq!(count_within(MAX_STRUCTURES, MAX_STRUCTURES, || "structure count".into()).unwrap(), 1_000_000);
        let err = count_within(MAX_STRUCTURES + 1, MAX_STRUCTURES, || "structure count".into()).unwrap_err();
        assert!(err.to_string().contains("structure count 1000001 exceeds limit"), "{err}");
    }

    fn pulse_registry(abi: VectorAbi) -> LayoutRegistry {
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
        let opts = LoadOptions {
            vector_abi: abi,
            ..LoadOptions::default()
        };
        LayoutRegistry::load("2023-10-20T23:01:49", &[source], &opts).unwrap()
    }

    #[test]
    fn inherited_sizes_and_vector_abi_survive() {
        let abi = VectorAbi {
            size: 0x20,
            count_offset: 0x10,
            pointer_offset: 0x0,
            capacity_offset: 0x14,
        };
        let registry = pulse_registry(abi);
        let loaded = read(&to_bytes(&registry).unwrap()).unwrap();
        assert_eq!(loaded, registry);
        assert_eq!(loaded.lookup("CPulseCell_BaseFlow").unwrap().total_size(), 0xC);
        assert_eq!(loaded.lookup("CPulseCell_Outflow_CycleOrdered").unwrap().vector_abi(), &abi);
    }

    #[test]
    fn derived_size_that_misses_its_bases_is_rejected() {
        let registry = pulse_registry(VectorAbi::default());
        let mut bytes = to_bytes(&registry).unwrap();

        // Skip CPulseCell_BaseFlow's name, parent and origin to reach its stored size.
        let mut at = bytes.windows(19).position(|w| w == b"CPulseCell_BaseFlow").unwrap() + 19;
        at += 1 + 4 + "CPulseCell_Base".len() + 4 + "pulse_system.dll".len();
        assert_eq!(u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()), 0xC);
        bytes[at..at + 8].copy_from_slice(&0u64.to_le_bytes());

        let err = read(&bytes).unwrap_err();
        assert!(err.to_string().contains("CPulseCell_BaseFlow"), "{err}");
    }
}
