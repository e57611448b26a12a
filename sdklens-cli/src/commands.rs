use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;

use sdklens_core::diff::diff;
use sdklens_core::snapshot;
use sdklens_core::{
    ArrayDecoding, DescriptorSource, FieldDescriptor, FieldValue, LayoutRegistry, MemoryImage, StorageKind,
    StructureLayout, VersionResolver,
};
use sdklens_nls::Decoder;

use crate::project::{BuildDumps, Project};

#[derive(Debug, Serialize)]
pub struct BuildOut {
    pub id: String,
    pub structures: usize,
}

#[derive(Debug, Serialize)]
pub struct FieldOut {
    pub name: String,
    pub offset: String,
    pub size: usize,
    pub kind: String,
    pub annotation: String,
}

#[derive(Debug, Serialize)]
pub struct StructureOut {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub origin: String,
    pub size: String,
    pub size_source: String,
    /// Known bases, nearest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bases: Vec<String>,
    pub fields: Vec<FieldOut>,
}

#[derive(Debug, Serialize)]
pub struct ValueOut {
    pub name: String,
    pub offset: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ElementOut {
    pub index: usize,
    pub address: String,
    pub fields: Vec<ValueOut>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReadOut {
    Fields(Vec<ValueOut>),
    Elements(Vec<ElementOut>),
}

#[derive(Debug, Serialize)]
pub struct StampOut {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    pub structures: usize,
}

/// What `read` should decode, and where vector elements live.
pub struct ReadRequest<'a> {
    pub build: &'a str,
    pub structure: &'a str,
    pub input: &'a Path,
    pub field: Option<&'a str>,
    pub text: bool,
    pub heap: Option<(&'a Path, u64)>,
}

/// Snapshots first. A project build is loaded from its dumps when it has no snapshot, or
/// when the project file, a dump or the size table changed after the snapshot was written.
pub fn load_resolver(project: &Project) -> Result<VersionResolver> {
    let mut resolver = VersionResolver::new();
    let dir = project.snapshot_dir();
    if dir.is_dir() {
        resolver.load_dir(&dir)?;
    }

    for entry in &project.builds {
        let mut parsed = None;
        let id = match &entry.id {
            Some(id) => id.clone(),
            None => {
                log::debug!("build without an id: parsing its dumps for the stamp");
                let dumps = BuildDumps::load(project, entry)?;
                let id = dumps.id.clone();
                parsed = Some(dumps);
                id
            }
        };

        if resolver.contains(&id) {
            let snap = dir.join(snapshot::file_name(&id));
            if !is_stale(&snap, &project.inputs(entry)?) {
                log::info!("build {id}: using snapshot {}", snap.display());
                continue;
            }
            log::warn!(
                "build {id}: snapshot {} is older than the project or its dumps, loading the dumps instead",
                snap.display()
            );
        }

        let dumps = match parsed {
            Some(dumps) => dumps,
            None => BuildDumps::load(project, entry)?,
        };
        resolver.register(dumps.into_registry()?);
    }
    Ok(resolver)
}

/// A snapshot is stale when it is missing or any input was modified after it.
fn is_stale(snapshot: &Path, inputs: &[PathBuf]) -> bool {
    let modified = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
    let Some(written) = modified(snapshot) else {
        return true;
    };
    inputs.iter().filter_map(|p| modified(p)).any(|t| t > written)
}

pub fn builds(project: &Project) -> Result<Vec<BuildOut>> {
    let resolver = load_resolver(project)?;
    resolver
        .builds()
        .map(|id| {
            Ok(BuildOut {
                id: id.to_string(),
                structures: resolver.resolve(id)?.len(),
            })
        })
        .collect()
}

pub fn inspect(project: &Project, build: &str, structure: &str) -> Result<StructureOut> {
    let registry = load_resolver(project)?.resolve(build)?;
    let layout = registry.lookup(structure)?;
    let bases = registry
        .ancestry(structure)?
        .into_iter()
        .skip(1)
        .map(|l| l.name().to_string())
        .collect();
    Ok(structure_out(layout, bases))
}

fn structure_out(layout: &StructureLayout, bases: Vec<String>) -> StructureOut {
    StructureOut {
        name: layout.name().to_string(),
        parent: layout.parent().map(str::to_string),
        origin: layout.origin().to_string(),
        size: format!("0x{:X}", layout.total_size()),
        size_source: format!("{:?}", layout.size_source()).to_lowercase(),
        bases,
        fields: layout
            .fields()
            .iter()
            .map(|f| FieldOut {
                name: f.name().to_string(),
                offset: format!("0x{:X}", f.offset()),
                size: f.size(),
                kind: f.kind().to_string(),
                annotation: f.annotation().to_string(),
            })
            .collect(),
    }
}

fn value_out(field: &FieldDescriptor, value: sdklens_core::Result<FieldValue<'_>>) -> ValueOut {
    let (value, error) = match value {
        Ok(v) => (Some(v.to_string()), None),
        Err(e) => (None, Some(e.to_string())),
    };
    ValueOut {
        name: field.name().to_string(),
        offset: format!("0x{:X}", field.offset()),
        kind: field.kind().to_string(),
        value,
        error,
    }
}

pub fn read(project: &Project, req: &ReadRequest<'_>) -> Result<ReadOut> {
    let registry = load_resolver(project)?.resolve(req.build)?;
    let bytes = std::fs::read(req.input).with_context(|| format!("reading {}", req.input.display()))?;
    let decoder = Decoder::new(project.encoding);
    let decoding = if req.text {
        ArrayDecoding::CString
    } else {
        ArrayDecoding::Raw
    };

    let view = registry.view(req.structure, &bytes)?.with_decoder(decoder);
    let Some(name) = req.field else {
        let fields = view.read_all(decoding).into_iter().map(|(f, v)| value_out(f, v)).collect();
        return Ok(ReadOut::Fields(fields));
    };

    let field = view.field(name)?;
    match (field.kind(), req.heap) {
        (StorageKind::NestedVector(_), Some((heap, base))) => {
            let heap_bytes = std::fs::read(heap).with_context(|| format!("reading {}", heap.display()))?;
            let mut image = MemoryImage::new(base, heap_bytes);
            let elems = view.read_elements(name, &mut image)?;
            let out = (0..elems.len())
                .filter_map(|i| Some((i, elems.address(i)?, elems.get(i)?)))
                .map(|(index, address, elem)| ElementOut {
                    index,
                    address: format!("0x{address:X}"),
                    fields: elem
                        .with_decoder(decoder)
                        .read_all(decoding)
                        .into_iter()
                        .map(|(f, v)| value_out(f, v))
                        .collect(),
                })
                .collect();
            Ok(ReadOut::Elements(out))
        }
        _ => Ok(ReadOut::Fields(vec![value_out(field, view.decode(field, decoding))])),
    }
}

/// Parse the dumps of every build (or just `only`) and write a snapshot for each.
pub fn snapshot(project: &Project, only: Option<&str>) -> Result<Vec<PathBuf>> {
    let dir = project.snapshot_dir();
    let mut written = Vec::new();
    for entry in &project.builds {
        if let (Some(only), Some(id)) = (only, entry.id.as_deref()) {
            if only != id {
                continue;
            }
        }
        let dumps = BuildDumps::load(project, entry)?;
        if only.is_some_and(|only| only != dumps.id) {
            continue;
        }
        let registry: LayoutRegistry = dumps.into_registry()?;
        written.push(snapshot::save(&registry, &dir)?);
    }
    if let (Some(only), true) = (only, written.is_empty()) {
        bail!("no build {only:?} in the project");
    }
    Ok(written)
}

pub fn diff_builds(project: &Project, old: &str, new: &str) -> Result<Vec<String>> {
    let resolver = load_resolver(project)?;
    let (a, b) = (resolver.resolve(old)?, resolver.resolve(new)?);
    Ok(diff(&a, &b).iter().map(ToString::to_string).collect())
}

pub fn stamp(path: &Path) -> Result<StampOut> {
    let source = DescriptorSource::from_path(path)?;
    Ok(StampOut {
        file: source.origin().to_string(),
        stamp: source.stamp().map(str::to_string),
        build: source.build_id(),
        structures: source.tables().len(),
    })
}
