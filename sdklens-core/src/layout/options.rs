use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::kind::{KindTable, VectorAbi};
use crate::error::{LayoutError, Result};

/// Knobs for [`LayoutRegistry::load`](super::LayoutRegistry::load).
///
/// Deserializes from the `[options]` table of a project file:
///
/// ```toml
/// [options.aliases]
/// PulseDocNodeID_t = "int32_t"
///
/// [options.sizes]
/// RenderInputLayoutField_t = 0x38
///
/// [options.vector_abi]
/// size = 0x18
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Extra `annotation -> annotation` rewrites, applied on top of the builtin ones.
    pub aliases: BTreeMap<String, String>,
    /// Companion class-size table: structure name -> full instance size in bytes.
    pub sizes: BTreeMap<String, usize>,
    pub vector_abi: VectorAbi,
}

impl LoadOptions {
    pub fn kind_table(&self) -> KindTable {
        KindTable::with_aliases(self.aliases.clone())
    }

    /// Merge a class-size table kept in its own TOML file (`Name = 0x38` per line).
    pub fn merge_sizes_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let sizes: BTreeMap<String, usize> = toml::from_str(&text).map_err(|e| {
            LayoutError::malformed(&path.display().to_string(), None, format!("class size table: {e}"))
        })?;
        log::debug!("{} class sizes from {}", sizes.len(), path.display());
        self.sizes.extend(sizes);
        Ok(())
    }
}
