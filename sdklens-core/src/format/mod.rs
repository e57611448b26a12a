//! Offset dump readers.
//!
//! Dumpers emit the same `structure -> (field, offset, type comment)` tables in several
//! textual forms. Each reader here produces [`RawTable`]s; turning annotations into storage
//! kinds is left to [`LayoutRegistry::load`](crate::LayoutRegistry::load).

mod json;
mod text;

use std::collections::HashSet;
use std::path::Path;

use chrono::NaiveDateTime;

use crate::error::{LayoutError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DumpFormat {
    /// `public static class X { public const nint m_f = 0x20; // int32_t }`
    #[strum(to_string = "cs")]
    CSharp,
    /// `namespace X { constexpr std::ptrdiff_t m_f = 0x20; // int32_t }`
    #[strum(to_string = "hpp", serialize = "h")]
    Cpp,
    /// `{ "X": { "data": { "m_f": { "value": 32, "comment": "int32_t" } } } }`
    Json,
}

impl DumpFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()?.to_str()?.parse().ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawField {
    pub name: String,
    /// Signed so a bad dump can be reported instead of wrapping.
    pub offset: i64,
    pub annotation: String,
    /// 1-based line in the dump, when the format has lines.
    pub line: Option<usize>,
}

/// One structure table, as written in the dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTable {
    pub name: String,
    pub parent: Option<String>,
    pub fields: Vec<RawField>,
    pub line: Option<usize>,
}

impl RawTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            fields: Vec::new(),
            line: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, offset: i64, annotation: impl Into<String>) -> Self {
        self.fields.push(RawField {
            name: name.into(),
            offset,
            annotation: annotation.into(),
            line: None,
        });
        self
    }
}

/// The tables of one dump file (or one embedded table set).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSource {
    origin: String,
    stamp: Option<String>,
    tables: Vec<RawTable>,
}

impl DescriptorSource {
    /// Wrap tables built in code.
    pub fn from_tables(origin: impl Into<String>, tables: Vec<RawTable>) -> Result<Self> {
        let origin = origin.into();
        check_unique(&origin, &tables)?;
        Ok(Self {
            origin,
            stamp: None,
            tables,
        })
    }

    pub fn parse(origin: impl Into<String>, text: &str, format: DumpFormat) -> Result<Self> {
        let origin = origin.into();
        let (stamp, tables) = match format {
            DumpFormat::CSharp => text::parse(&origin, text, &text::CSHARP)?,
            DumpFormat::Cpp => text::parse(&origin, text, &text::CPP)?,
            DumpFormat::Json => (None, json::parse(&origin, text)?),
        };
        check_unique(&origin, &tables)?;
        log::debug!("{origin}: {} tables ({format})", tables.len());
        Ok(Self { origin, stamp, tables })
    }

    /// Read a dump file, picking the reader from its extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let origin = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let format = DumpFormat::from_path(path).ok_or_else(|| {
            LayoutError::malformed(&origin, None, "unknown dump format (expected .cs, .hpp, .h or .json)")
        })?;
        let text = std::fs::read_to_string(path)?;
        Self::parse(origin, &text, format)
    }

    #[inline]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The generation time written in the dump header, verbatim.
    #[inline]
    pub fn stamp(&self) -> Option<&str> {
        self.stamp.as_deref()
    }

    /// The header stamp normalized to a build identifier, e.g. `2023-10-20T23:01:49`.
    pub fn build_id(&self) -> Option<String> {
        self.stamp.as_deref().and_then(build_id_from_stamp)
    }

    #[inline]
    pub fn tables(&self) -> &[RawTable] {
        &self.tables
    }
}

/// `2023-10-20 23:01:49.150323200` -> `2023-10-20T23:01:49`. Sub-second digits are dropped.
pub fn build_id_from_stamp(stamp: &str) -> Option<String> {
    let stamp = stamp.trim().trim_end_matches("UTC").trim_end();
    let parsed = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Some(parsed.format("%Y-%m-%dT%H:%M:%S").to_string())
}

fn check_unique(origin: &str, tables: &[RawTable]) -> Result<()> {
    let mut seen = HashSet::with_capacity(tables.len());
    for table in tables {
        if !seen.insert(table.name.as_str()) {
            return Err(LayoutError::malformed(
                origin,
                table.line,
                format!("structure {} is declared twice", table.name),
            ));
        }
    }
    Ok(())
}
