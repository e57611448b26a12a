use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use sdklens_core::{DescriptorSource, LayoutRegistry, LoadOptions};
use sdklens_nls::Encoding;

/// `sdklens.toml`: where the dumps of each build live and how to load them.
///
/// ```toml
/// snapshot_dir = "snapshots"
///
/// [options.aliases]
/// PulseDocNodeID_t = "int32_t"
///
/// [[builds]]
/// dumps = ["2023-10-20/*.cs", "2023-10-20/*.hpp"]
/// sizes = "2023-10-20/sizes.toml"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    /// Encoding of `char[N]` text in inspected memory.
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub options: LoadOptions,
    #[serde(default)]
    pub builds: Vec<BuildEntry>,

    /// Directory of the project file; relative paths above are resolved against it.
    #[serde(skip)]
    root: PathBuf,
    #[serde(skip)]
    file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEntry {
    /// Build identifier. Taken from the dump header stamp when omitted.
    pub id: Option<String>,
    /// Glob patterns of `.cs` / `.hpp` / `.json` dumps.
    pub dumps: Vec<String>,
    /// Class-size table for this build.
    pub sizes: Option<PathBuf>,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

impl Project {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading project {}", path.display()))?;
        let mut project: Project =
            toml::from_str(&text).with_context(|| format!("parsing project {}", path.display()))?;
        project.root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        project.file = path.to_path_buf();
        Ok(project)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.resolve(&self.snapshot_dir)
    }

    /// Every file a build's layouts depend on: its dumps, its size table and this project file.
    pub fn inputs(&self, entry: &BuildEntry) -> Result<Vec<PathBuf>> {
        let mut inputs = entry.dump_paths(self)?;
        inputs.extend(entry.sizes.as_deref().map(|sizes| self.resolve(sizes)));
        inputs.push(self.file.clone());
        Ok(inputs)
    }
}

impl BuildEntry {
    /// The dump files matched by `dumps`, sorted and without repeats.
    pub fn dump_paths(&self, project: &Project) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for pattern in &self.dumps {
            let full = project.resolve(Path::new(pattern));
            let full = full.to_string_lossy();
            let before = paths.len();
            for path in glob::glob(&full).with_context(|| format!("bad dump pattern {pattern:?}"))? {
                paths.push(path?);
            }
            if paths.len() == before {
                log::warn!("dump pattern {pattern:?} matched nothing");
            }
        }
        paths.sort();
        paths.dedup();
        if paths.is_empty() {
            bail!("build {} has no dump files", self.id.as_deref().unwrap_or("<unnamed>"));
        }
        Ok(paths)
    }
}

/// The dumps of one build, parsed but not yet turned into a registry.
pub struct BuildDumps {
    pub id: String,
    pub sources: Vec<DescriptorSource>,
    pub options: LoadOptions,
}

impl BuildDumps {
    pub fn load(project: &Project, entry: &BuildEntry) -> Result<Self> {
        let paths = entry.dump_paths(project)?;
        let sources = paths
            .iter()
            .map(|p| DescriptorSource::from_path(p).with_context(|| format!("loading {}", p.display())))
            .collect::<Result<Vec<_>>>()?;

        let id = match &entry.id {
            Some(id) => id.clone(),
            None => stamp_id(&sources)?,
        };

        let mut options = project.options.clone();
        if let Some(sizes) = &entry.sizes {
            options.merge_sizes_file(project.resolve(sizes))?;
        }

        Ok(Self { id, sources, options })
    }

    pub fn into_registry(self) -> Result<LayoutRegistry> {
        let registry = LayoutRegistry::load(&self.id, &self.sources, &self.options)
            .with_context(|| format!("building layouts for {}", self.id))?;
        log::info!(
            "build {}: {} structures from {} dump(s)",
            self.id,
            registry.len(),
            self.sources.len()
        );
        Ok(registry)
    }
}

/// All stamped dumps of a build must agree on the identifier.
fn stamp_id(sources: &[DescriptorSource]) -> Result<String> {
    let mut id: Option<String> = None;
    for source in sources {
        let Some(this) = source.build_id() else {
            continue;
        };
        match &id {
            Some(prev) if *prev != this => {
                log::warn!("{} is stamped {this}, other dumps say {prev}", source.origin());
            }
            Some(_) => {}
            None => id = Some(this),
        }
    }
    id.context("no build id given and no dump carries a generation stamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDER_CS: &str = "/*\n * 2023-10-20 23:01:49.150323200 UTC\n */\n\npublic static class VsInputSignature_t {\n    public const nint m_elems = 0x0; // CUtlVector<VsInputSignatureElement_t>\n}\n";

    #[test]
    fn project_paths_are_relative_to_the_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("dumps"))?;
        std::fs::write(dir.path().join("dumps/rendersystemdx11.dll.cs"), RENDER_CS)?;
        std::fs::write(dir.path().join("dumps/sizes.toml"), "VsInputSignature_t = 0x18\n")?;
        std::fs::write(
            dir.path().join("sdklens.toml"),
            "encoding = \"cp1252\"\n\n[[builds]]\ndumps = [\"dumps/*.cs\"]\nsizes = \"dumps/sizes.toml\"\n",
        )?;

        let project = Project::new(dir.path().join("sdklens.toml"))?;
        assert_eq!(project.encoding, Encoding::Cp1252);
        assert_eq!(project.snapshot_dir(), dir.path().join("snapshots"));
        assert_eq!(
            project.inputs(&project.builds[0])?,
            [
                dir.path().join("dumps/rendersystemdx11.dll.cs"),
                dir.path().join("dumps/sizes.toml"),
                dir.path().join("sdklens.toml"),
            ]
        );

        let dumps = BuildDumps::load(&project, &project.builds[0])?;
        assert_eq!(dumps.id, "2023-10-20T23:01:49");
        let registry = dumps.into_registry()?;
        assert_eq!(registry.lookup("VsInputSignature_t")?.total_size(), 0x18);
        Ok(())
    }

    #[test]
    fn unstamped_dumps_need_an_id() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.hpp"), "namespace X {\n}\n")?;
        std::fs::write(dir.path().join("sdklens.toml"), "[[builds]]\ndumps = [\"*.hpp\"]\n")?;
        let project = Project::new(dir.path().join("sdklens.toml"))?;
        assert!(BuildDumps::load(&project, &project.builds[0]).is_err());
        Ok(())
    }
}
