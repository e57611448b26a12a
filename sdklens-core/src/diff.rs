//! Structural comparison of two builds' registries.

use std::fmt;

use crate::layout::{LayoutRegistry, StorageKind, StructureLayout};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutChange {
    StructureAdded { structure: String },
    StructureRemoved { structure: String },
    SizeChanged { structure: String, old: usize, new: usize },
    ParentChanged { structure: String, old: Option<String>, new: Option<String> },
    FieldAdded { structure: String, field: String, offset: usize },
    FieldRemoved { structure: String, field: String, offset: usize },
    FieldMoved { structure: String, field: String, old: usize, new: usize },
    FieldRetyped { structure: String, field: String, old: StorageKind, new: StorageKind },
}

impl LayoutChange {
    pub fn structure(&self) -> &str {
        match self {
            LayoutChange::StructureAdded { structure }
            | LayoutChange::StructureRemoved { structure }
            | LayoutChange::SizeChanged { structure, .. }
            | LayoutChange::ParentChanged { structure, .. }
            | LayoutChange::FieldAdded { structure, .. }
            | LayoutChange::FieldRemoved { structure, .. }
            | LayoutChange::FieldMoved { structure, .. }
            | LayoutChange::FieldRetyped { structure, .. } => structure,
        }
    }
}

impl fmt::Display for LayoutChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutChange::StructureAdded { structure } => write!(f, "+ {structure}"),
            LayoutChange::StructureRemoved { structure } => write!(f, "- {structure}"),
            LayoutChange::SizeChanged { structure, old, new } => {
                write!(f, "~ {structure}: size 0x{old:X} -> 0x{new:X}")
            }
            LayoutChange::ParentChanged { structure, old, new } => write!(
                f,
                "~ {structure}: base {} -> {}",
                old.as_deref().unwrap_or("(none)"),
                new.as_deref().unwrap_or("(none)")
            ),
            LayoutChange::FieldAdded { structure, field, offset } => {
                write!(f, "+ {structure}::{field} @ 0x{offset:X}")
            }
            LayoutChange::FieldRemoved { structure, field, offset } => {
                write!(f, "- {structure}::{field} @ 0x{offset:X}")
            }
            LayoutChange::FieldMoved { structure, field, old, new } => {
                write!(f, "~ {structure}::{field}: 0x{old:X} -> 0x{new:X}")
            }
            LayoutChange::FieldRetyped { structure, field, old, new } => {
                write!(f, "~ {structure}::{field}: {old} -> {new}")
            }
        }
    }
}

/// Changes from `old` to `new`, grouped by structure in name order.
///
/// Within a structure: size and base first, then field changes in `new`'s declaration
/// order, then removed fields in `old`'s declaration order.
pub fn diff(old: &LayoutRegistry, new: &LayoutRegistry) -> Vec<LayoutChange> {
    let mut names: Vec<&str> = old.structures().map(StructureLayout::name).collect();
    names.extend(new.structures().map(StructureLayout::name).filter(|n| !old.contains(n)));
    names.sort_unstable();

    let mut changes = Vec::new();
    for name in names {
        match (old.lookup(name).ok(), new.lookup(name).ok()) {
            (Some(a), Some(b)) => diff_structure(a, b, &mut changes),
            (Some(_), None) => changes.push(LayoutChange::StructureRemoved {
                structure: name.to_string(),
            }),
            (None, Some(_)) => changes.push(LayoutChange::StructureAdded {
                structure: name.to_string(),
            }),
            (None, None) => {}
        }
    }
    log::debug!(
        "diff {} -> {}: {} changes",
        old.build_version(),
        new.build_version(),
        changes.len()
    );
    changes
}

fn diff_structure(a: &StructureLayout, b: &StructureLayout, out: &mut Vec<LayoutChange>) {
    let structure = || a.name().to_string();

    if a.total_size() != b.total_size() {
        out.push(LayoutChange::SizeChanged {
            structure: structure(),
            old: a.total_size(),
            new: b.total_size(),
        });
    }
    if a.parent() != b.parent() {
        out.push(LayoutChange::ParentChanged {
            structure: structure(),
            old: a.parent().map(str::to_string),
            new: b.parent().map(str::to_string),
        });
    }

    for nf in b.fields() {
        let Some(of) = a.field(nf.name()) else {
            out.push(LayoutChange::FieldAdded {
                structure: structure(),
                field: nf.name().to_string(),
                offset: nf.offset(),
            });
            continue;
        };
        if of.offset() != nf.offset() {
            out.push(LayoutChange::FieldMoved {
                structure: structure(),
                field: nf.name().to_string(),
                old: of.offset(),
                new: nf.offset(),
            });
        }
        if of.kind() != nf.kind() {
            out.push(LayoutChange::FieldRetyped {
                structure: structure(),
                field: nf.name().to_string(),
                old: of.kind().clone(),
                new: nf.kind().clone(),
            });
        }
    }

    for of in a.fields().iter().filter(|f| b.field(f.name()).is_none()) {
        out.push(LayoutChange::FieldRemoved {
            structure: structure(),
            field: of.name().to_string(),
            offset: of.offset(),
        });
    }
}
