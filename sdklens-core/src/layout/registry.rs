use std::collections::{BTreeMap, HashSet};

use super::kind::{KindTable, VectorAbi};
use super::options::LoadOptions;
use super::structure::{FieldDescriptor, SizeSource, StructureLayout};
use crate::error::{LayoutError, Result};
use crate::format::{DescriptorSource, RawTable};
use crate::view::MemoryView;

/// All structure layouts of one build. Immutable once loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutRegistry {
    build: String,
    layouts: BTreeMap<String, StructureLayout>,
    vector_abi: VectorAbi,
}

impl LayoutRegistry {
    /// Build the registry for `build` from one or more parsed dumps.
    ///
    /// Every table of every source becomes one [`StructureLayout`]. A structure name may
    /// appear once per registry; a second declaration is rejected whether it comes from the
    /// same source or another one.
    pub fn load(
        build: impl Into<String>,
        sources: &[DescriptorSource],
        options: &LoadOptions,
    ) -> Result<Self> {
        let build = build.into();
        options
            .vector_abi
            .validate()
            .map_err(|reason| LayoutError::malformed("options.vector_abi", None, reason))?;

        let kinds = options.kind_table();
        let mut layouts: BTreeMap<String, StructureLayout> = BTreeMap::new();
        let mut derived = 0usize;

        for source in sources {
            for table in source.tables() {
                if let Some(prev) = layouts.get(&table.name) {
                    let reason = if prev.origin() == source.origin() {
                        format!("structure {} is declared twice", table.name)
                    } else {
                        format!("structure {} is already declared in {}", table.name, prev.origin())
                    };
                    return Err(LayoutError::malformed(source.origin(), table.line, reason));
                }

                let layout = build_layout(source.origin(), table, &kinds, options)?;
                if layout.size_source() == SizeSource::Derived {
                    derived += 1;
                }
                layouts.insert(table.name.clone(), layout);
            }
        }

        for name in options.sizes.keys() {
            if !layouts.contains_key(name) {
                log::warn!("class size given for {name}, which no dump declares");
            }
        }
        if derived > 0 {
            log::warn!(
                "build {build}: {derived} of {} structures have no class size; total sizes are derived from field extents",
                layouts.len()
            );
        }
        log::debug!("build {build}: loaded {} structures from {} sources", layouts.len(), sources.len());

        let mut registry = Self {
            build,
            layouts,
            vector_abi: options.vector_abi,
        };
        for (name, extent) in registry.inherited_extents() {
            if let Some(layout) = registry.layouts.get_mut(&name) {
                let origin = layout.origin().to_string();
                layout
                    .cover_inherited(extent)
                    .map_err(|reason| LayoutError::malformed(&origin, None, reason))?;
            }
        }
        for layout in registry.layouts.values().filter(|l| l.size_source() == SizeSource::Derived) {
            log::debug!("{}: no class size, using field extent 0x{:X}", layout.name(), layout.total_size());
        }
        Ok(registry)
    }

    /// Reassemble a registry from already validated layouts (snapshot files).
    pub(crate) fn from_layouts(
        build: String,
        layouts: Vec<StructureLayout>,
        vector_abi: VectorAbi,
    ) -> std::result::Result<Self, String> {
        vector_abi.validate()?;
        let mut map = BTreeMap::new();
        for layout in layouts {
            let name = layout.name().to_string();
            if map.insert(name.clone(), layout).is_some() {
                return Err(format!("structure {name} is declared twice"));
            }
        }
        let registry = Self {
            build,
            layouts: map,
            vector_abi,
        };

        for (name, extent) in registry.inherited_extents() {
            let Some(layout) = registry.layouts.get(&name) else {
                continue;
            };
            let expected = match layout.size_source() {
                SizeSource::Derived => layout.extent().max(extent),
                SizeSource::Declared if layout.total_size() >= extent => layout.total_size(),
                SizeSource::Declared => {
                    return Err(format!(
                        "{name} declares size 0x{:X} but its inherited fields extend to 0x{extent:X}",
                        layout.total_size()
                    ))
                }
            };
            if layout.total_size() != expected {
                return Err(format!(
                    "{name}: stored size 0x{:X} does not match field extent 0x{expected:X}",
                    layout.total_size()
                ));
            }
        }
        Ok(registry)
    }

    /// For every structure with known bases, how far the bases' fields reach.
    ///
    /// A declared base counts with its whole size, so trailing padding is inherited too.
    fn inherited_extents(&self) -> Vec<(String, usize)> {
        self.layouts
            .keys()
            .filter_map(|name| {
                let chain = self.ancestry(name).ok()?;
                let extent = chain
                    .iter()
                    .skip(1)
                    .map(|base| match base.size_source() {
                        SizeSource::Declared => base.total_size(),
                        SizeSource::Derived => base.extent(),
                    })
                    .max()?;
                Some((name.clone(), extent))
            })
            .collect()
    }

    #[inline]
    pub fn build_version(&self) -> &str {
        &self.build
    }

    #[inline]
    pub fn vector_abi(&self) -> &VectorAbi {
        &self.vector_abi
    }

    pub fn lookup(&self, name: &str) -> Result<&StructureLayout> {
        self.layouts.get(name).ok_or_else(|| LayoutError::UnknownStructure {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layouts.contains_key(name)
    }

    /// Layouts in name order.
    pub fn structures(&self) -> impl Iterator<Item = &StructureLayout> {
        self.layouts.values()
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// `name` followed by its known bases, nearest first.
    ///
    /// Stops at the first base this registry does not hold, or when the chain loops.
    pub fn ancestry(&self, name: &str) -> Result<Vec<&StructureLayout>> {
        let mut current = self.lookup(name)?;
        let mut chain = vec![current];
        let mut seen = HashSet::from([current.name()]);
        while let Some(parent) = current.parent() {
            if !seen.insert(parent) {
                log::warn!("inheritance cycle through {parent} while walking {name}");
                break;
            }
            match self.layouts.get(parent) {
                Some(layout) => {
                    chain.push(layout);
                    current = layout;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    /// Find `field` on `structure` or on one of its bases.
    pub fn field(&self, structure: &str, field: &str) -> Result<&FieldDescriptor> {
        self.ancestry(structure)?
            .into_iter()
            .find_map(|layout| layout.field(field))
            .ok_or_else(|| LayoutError::UnknownField {
                structure: structure.to_string(),
                field: field.to_string(),
            })
    }

    /// Project `bytes` through the layout of `structure`.
    pub fn view<'a>(&'a self, structure: &str, bytes: &'a [u8]) -> Result<MemoryView<'a>> {
        let layout = self.lookup(structure)?;
        Ok(MemoryView::with_registry(bytes, layout, self))
    }
}

fn build_layout(
    origin: &str,
    table: &RawTable,
    kinds: &KindTable,
    options: &LoadOptions,
) -> Result<StructureLayout> {
    let mut fields = Vec::with_capacity(table.fields.len());
    for (slot, raw) in table.fields.iter().enumerate() {
        let at = raw.line.or(table.line);
        let offset = usize::try_from(raw.offset).map_err(|_| {
            LayoutError::malformed(
                origin,
                at,
                format!("{}::{} has negative offset {}", table.name, raw.name, raw.offset),
            )
        })?;
        let kind = kinds
            .resolve(&raw.annotation)
            .map_err(|reason| LayoutError::malformed(origin, at, format!("{}::{}: {reason}", table.name, raw.name)))?;
        let field = FieldDescriptor::new(&raw.name, offset, kind, &raw.annotation, slot, &options.vector_abi)
            .map_err(|reason| LayoutError::malformed(origin, at, reason))?;
        fields.push(field);
    }

    StructureLayout::new(
        &table.name,
        table.parent.clone(),
        origin,
        fields,
        options.sizes.get(&table.name).copied(),
        options.vector_abi,
    )
    .map_err(|reason| LayoutError::malformed(origin, table.line, reason))
}
