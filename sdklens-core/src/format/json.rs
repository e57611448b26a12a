//! The JSON dump form: `{ "Table": { "data": { "m_f": { "value": 32, "comment": "int32_t" } }, "comment": "Base" } }`.
//!
//! The dumper writes `data` with its keys sorted by name, so declaration order is recovered by
//! a stable sort on offset. Objects are read as entry lists, so a repeated key reaches the
//! duplicate checks instead of silently overwriting the first one.

use std::fmt;
use std::marker::PhantomData;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use super::{RawField, RawTable};
use crate::error::{LayoutError, Result};

#[derive(Debug, Deserialize)]
struct JsonOffsetValue {
    value: i64,
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonTable {
    #[serde(default = "Entries::empty")]
    data: Entries<JsonOffsetValue>,
    comment: Option<String>,
}

/// A JSON object kept as `(key, value)` pairs in document order.
#[derive(Debug)]
struct Entries<T>(Vec<(String, T)>);

impl<T> Entries<T> {
    fn empty() -> Self {
        Entries(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

pub(super) fn parse(origin: &str, text: &str) -> Result<Vec<RawTable>> {
    let Entries(tables): Entries<JsonTable> =
        serde_json::from_str(text).map_err(|e| LayoutError::malformed(origin, Some(e.line()), e.to_string()))?;

    Ok(tables
        .into_iter()
        .map(|(name, table)| {
            let mut fields: Vec<RawField> = table
                .data
                .0
                .into_iter()
                .map(|(name, v)| RawField {
                    name,
                    offset: v.value,
                    annotation: v.comment.unwrap_or_default().trim().to_string(),
                    line: None,
                })
                .collect();
            fields.sort_by_key(|f| f.offset);
            RawTable {
                name,
                parent: table.comment.filter(|c| !c.trim().is_empty()),
                fields,
                line: None,
            }
        })
        .collect())
}
