//! Line-oriented reader shared by the C# and C++ dump forms.
//!
//! Both forms are one table per block:
//!
//! ```text
//! <open: class or namespace NAME {>  // optional base class
//!     <const NAME = 0xOFFSET;>        // type annotation
//! }
//! ```

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::{RawField, RawTable};
use crate::error::{LayoutError, Result};

pub(super) struct Grammar {
    open: &'static Regex,
    field: &'static Regex,
}

lazy_static! {
    static ref STAMP: Regex = Regex::new(r"(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?) UTC").unwrap();
    static ref CLOSE: Regex = Regex::new(r"^\s*\}\s*;?\s*$").unwrap();
    static ref CS_OPEN: Regex =
        Regex::new(r"^\s*public\s+static\s+class\s+(\w+)\s*\{\s*(?://\s*(.*?))?\s*$").unwrap();
    static ref CS_FIELD: Regex = Regex::new(
        r"^\s*public\s+const\s+\w+\s+(\w+)\s*=\s*(-?)\s*(0[xX][0-9A-Fa-f]+|\d+)\s*;\s*(?://\s*(.*?))?\s*$"
    )
    .unwrap();
    static ref CPP_OPEN: Regex = Regex::new(r"^\s*namespace\s+(\w+)\s*\{\s*(?://\s*(.*?))?\s*$").unwrap();
    static ref CPP_FIELD: Regex = Regex::new(
        r"^\s*constexpr\s+[\w:]+\s+(\w+)\s*=\s*(-?)\s*(0[xX][0-9A-Fa-f]+|\d+)\s*;\s*(?://\s*(.*?))?\s*$"
    )
    .unwrap();
    pub(super) static ref CSHARP: Grammar = Grammar {
        open: &*CS_OPEN,
        field: &*CS_FIELD,
    };
    pub(super) static ref CPP: Grammar = Grammar {
        open: &*CPP_OPEN,
        field: &*CPP_FIELD,
    };
}

/// Returns the header stamp (if any) and the tables in file order.
pub(super) fn parse(origin: &str, text: &str, grammar: &Grammar) -> Result<(Option<String>, Vec<RawTable>)> {
    let mut stamp = None;
    let mut tables = Vec::new();
    let mut open: Option<RawTable> = None;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if stamp.is_none() && open.is_none() {
            if let Some(caps) = STAMP.captures(line) {
                stamp = Some(caps[1].to_string());
                continue;
            }
        }

        if let Some(caps) = grammar.open.captures(line) {
            if let Some(outer) = &open {
                return Err(LayoutError::malformed(
                    origin,
                    Some(line_no),
                    format!("table {} opened inside {}", &caps[1], outer.name),
                ));
            }
            open = Some(RawTable {
                name: caps[1].to_string(),
                parent: comment(&caps, 2),
                fields: Vec::new(),
                line: Some(line_no),
            });
            continue;
        }

        if let Some(caps) = grammar.field.captures(line) {
            let Some(table) = open.as_mut() else {
                return Err(LayoutError::malformed(
                    origin,
                    Some(line_no),
                    format!("field {} declared outside of a table", &caps[1]),
                ));
            };
            let offset = parse_offset(&caps[2], &caps[3]).ok_or_else(|| {
                LayoutError::malformed(origin, Some(line_no), format!("offset {} does not fit in 64 bits", &caps[3]))
            })?;
            table.fields.push(RawField {
                name: caps[1].to_string(),
                offset,
                annotation: comment(&caps, 4).unwrap_or_default(),
                line: Some(line_no),
            });
            continue;
        }

        if CLOSE.is_match(line) {
            match open.take() {
                Some(table) => tables.push(table),
                None => return Err(LayoutError::malformed(origin, Some(line_no), "unbalanced '}'")),
            }
            continue;
        }

        if is_preamble(trimmed) {
            continue;
        }
        if let Some(table) = &open {
            return Err(LayoutError::malformed(
                origin,
                Some(line_no),
                format!("unrecognized line in table {}: {trimmed:?}", table.name),
            ));
        }
        log::trace!("{origin}:{line_no}: skipping {trimmed:?}");
    }

    if let Some(table) = open {
        return Err(LayoutError::malformed(
            origin,
            table.line,
            format!("table {} is never closed", table.name),
        ));
    }

    Ok((stamp, tables))
}

fn comment(caps: &Captures<'_>, group: usize) -> Option<String> {
    caps.get(group)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn is_preamble(line: &str) -> bool {
    ["/*", "*", "//", "#", "using "].iter().any(|p| line.starts_with(p))
}

fn parse_offset(sign: &str, digits: &str) -> Option<i64> {
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if sign == "-" { -magnitude } else { magnitude })
}
