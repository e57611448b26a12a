use std::collections::BTreeMap;
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Decoding rule for the bytes at a field offset.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// A 64-bit address in the inspected process.
    Pointer,
    UInt8Array(u32),
    CharArray(u32),
    /// A `CUtlVector<T>` handle, carrying the element type name.
    NestedVector(String),
}

impl StorageKind {
    pub fn size(&self, abi: &VectorAbi) -> usize {
        match self {
            StorageKind::Bool | StorageKind::Int8 | StorageKind::UInt8 => 1,
            StorageKind::Int16 | StorageKind::UInt16 => 2,
            StorageKind::Int32 | StorageKind::UInt32 | StorageKind::Float32 => 4,
            StorageKind::Int64 | StorageKind::UInt64 | StorageKind::Float64 => 8,
            StorageKind::Pointer => 8,
            StorageKind::UInt8Array(len) | StorageKind::CharArray(len) => *len as usize,
            StorageKind::NestedVector(_) => abi.size,
        }
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, StorageKind::UInt8Array(_) | StorageKind::CharArray(_))
    }
}

/// Prints the canonical annotation, which [`KindTable::resolve`] maps back to the same kind.
impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Bool => write!(f, "bool"),
            StorageKind::Int8 => write!(f, "int8_t"),
            StorageKind::UInt8 => write!(f, "uint8_t"),
            StorageKind::Int16 => write!(f, "int16_t"),
            StorageKind::UInt16 => write!(f, "uint16_t"),
            StorageKind::Int32 => write!(f, "int32_t"),
            StorageKind::UInt32 => write!(f, "uint32_t"),
            StorageKind::Int64 => write!(f, "int64_t"),
            StorageKind::UInt64 => write!(f, "uint64_t"),
            StorageKind::Float32 => write!(f, "float32"),
            StorageKind::Float64 => write!(f, "float64"),
            StorageKind::Pointer => write!(f, "void*"),
            StorageKind::UInt8Array(len) => write!(f, "uint8_t[{len}]"),
            StorageKind::CharArray(len) => write!(f, "char[{len}]"),
            StorageKind::NestedVector(elem) => write!(f, "CUtlVector<{elem}>"),
        }
    }
}

/// Container ABI of `CUtlVector<T>`: an `i32` element count, then an embedded
/// `CUtlMemory<T>` holding the element pointer and the allocation count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorAbi {
    pub size: usize,
    pub count_offset: usize,
    pub pointer_offset: usize,
    pub capacity_offset: usize,
}

impl Default for VectorAbi {
    fn default() -> Self {
        Self {
            size: 0x18,
            count_offset: 0x0,
            pointer_offset: 0x8,
            capacity_offset: 0x10,
        }
    }
}

impl VectorAbi {
    pub fn validate(&self) -> Result<(), String> {
        let slots = [
            ("count_offset", self.count_offset, 4),
            ("pointer_offset", self.pointer_offset, 8),
            ("capacity_offset", self.capacity_offset, 4),
        ];
        for (name, offset, width) in slots {
            match offset.checked_add(width) {
                Some(end) if end <= self.size => {}
                _ => {
                    return Err(format!(
                        "vector ABI {name}=0x{offset:X} (+{width}) exceeds handle size 0x{:X}",
                        self.size
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Engine typedefs that the rendering dumps use with a primitive representation.
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("RenderSlotType_t", "int32_t"),
    ("CUtlSymbolLarge", "void*"),
    ("CUtlString", "void*"),
];

const MAX_ALIAS_DEPTH: usize = 16;

lazy_static! {
    static ref FIXED_ARRAY: Regex =
        Regex::new(r"^(uint8_t|char)\s*\[\s*(0[xX][0-9A-Fa-f]+|\d+)\s*\]$").unwrap();
    static ref UTL_VECTOR: Regex = Regex::new(r"^CUtlVector\s*<\s*(.+?)\s*>$").unwrap();
}

/// Maps free-text type annotations from a dump to storage kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindTable {
    aliases: BTreeMap<String, String>,
}

impl Default for KindTable {
    fn default() -> Self {
        Self::with_aliases(BTreeMap::new())
    }
}

impl KindTable {
    /// Builtin aliases plus `extra`; entries in `extra` win.
    pub fn with_aliases(extra: BTreeMap<String, String>) -> Self {
        let mut aliases: BTreeMap<String, String> = DEFAULT_ALIASES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        aliases.extend(extra);
        Self { aliases }
    }

    /// A table with no aliases at all, only the fixed mapping.
    pub fn fixed() -> Self {
        Self { aliases: BTreeMap::new() }
    }

    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.aliases
    }

    pub fn resolve(&self, annotation: &str) -> Result<StorageKind, String> {
        let mut current = annotation.trim();
        for _ in 0..=MAX_ALIAS_DEPTH {
            if let Some(kind) = fixed_kind(current)? {
                return Ok(kind);
            }
            match self.aliases.get(current) {
                Some(next) => current = next.trim(),
                None if current == annotation.trim() => {
                    return Err(format!("unrecognized storage annotation {annotation:?}"))
                }
                None => {
                    return Err(format!(
                        "storage annotation {annotation:?} aliases unrecognized {current:?}"
                    ))
                }
            }
        }
        Err(format!(
            "alias chain for {annotation:?} is cyclic or deeper than {MAX_ALIAS_DEPTH}"
        ))
    }
}

fn fixed_kind(annotation: &str) -> Result<Option<StorageKind>, String> {
    let kind = match annotation {
        "" => return Err("missing storage annotation".to_string()),
        "bool" => StorageKind::Bool,
        "int8_t" => StorageKind::Int8,
        "uint8_t" => StorageKind::UInt8,
        "int16_t" => StorageKind::Int16,
        "uint16_t" => StorageKind::UInt16,
        "int32_t" => StorageKind::Int32,
        "uint32_t" => StorageKind::UInt32,
        "int64_t" => StorageKind::Int64,
        "uint64_t" => StorageKind::UInt64,
        "float32" | "float" => StorageKind::Float32,
        "float64" | "double" => StorageKind::Float64,
        _ => {
            if let Some(caps) = FIXED_ARRAY.captures(annotation) {
                let len = parse_len(&caps[2])
                    .ok_or_else(|| format!("array length in {annotation:?} does not fit in 32 bits"))?;
                if len == 0 {
                    return Err(format!("zero-length array {annotation:?}"));
                }
                match &caps[1] {
                    "char" => StorageKind::CharArray(len),
                    _ => StorageKind::UInt8Array(len),
                }
            } else if let Some(caps) = UTL_VECTOR.captures(annotation) {
                StorageKind::NestedVector(caps[1].to_string())
            } else if annotation.ends_with('*') {
                StorageKind::Pointer
            } else {
                return Ok(None);
            }
        }
    };
    Ok(Some(kind))
}

fn parse_len(digits: &str) -> Option<u32> {
    match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}
