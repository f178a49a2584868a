//! Loading a model from a directory of YAML files.
//!
//! Layout:
//!
//! ```text
//! model.yml          optional model-wide defaults
//! dimensions/*.yml   one dimension per file
//! cubes/*.yml        one cube per file
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use serde::de::DeserializeOwned;

use crate::error::{CubistError, Result};
use crate::metadata::{CubeDef, DimensionDef, ModelDefaults};
use crate::model::Model;

/// Raw definitions read from disk, before validation.
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    pub defaults: ModelDefaults,
    pub dimensions: Vec<DimensionDef>,
    pub cubes: Vec<CubeDef>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(
        defaults: ModelDefaults,
        dimensions: Vec<DimensionDef>,
        cubes: Vec<CubeDef>,
    ) -> Self {
        Self {
            defaults,
            dimensions,
            cubes,
        }
    }

    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let mut registry = ModelRegistry::new();
        for name in ["model.yml", "model.yaml"] {
            let path = root.join(name);
            if path.exists() {
                registry.defaults = read_yaml(&path)?;
                break;
            }
        }
        registry.dimensions = load_dir(root.join("dimensions"), false)?;
        registry.cubes = load_dir(root.join("cubes"), true)?;
        tracing::debug!(
            root = %root.display(),
            dimensions = registry.dimensions.len(),
            cubes = registry.cubes.len(),
            "loaded model definitions"
        );
        Ok(registry)
    }

    /// Validate the definitions into a model.
    pub fn build(self) -> Result<Model> {
        Model::build(&self.defaults, self.dimensions, self.cubes)
    }

    pub fn get_cube(&self, name: &str) -> Option<&CubeDef> {
        self.cubes.iter().find(|c| c.name == name)
    }

    pub fn get_dimension(&self, name: &str) -> Option<&DimensionDef> {
        self.dimensions.iter().find(|d| d.name == name)
    }
}

/// Load and validate a model directory in one step.
pub fn load_model<P: AsRef<Path>>(root: P) -> Result<Model> {
    ModelRegistry::load_from_dir(root)?.build()
}

fn load_dir<T: DeserializeOwned>(dir: PathBuf, required: bool) -> Result<Vec<T>> {
    if !dir.exists() {
        if required {
            return Err(CubistError::Config(format!(
                "directory not found: {}",
                dir.display()
            )));
        }
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for pattern in ["*.yml", "*.yaml"] {
        let entries = glob(&format!("{}/{pattern}", dir.display()))
            .map_err(|e| CubistError::Other(e.into()))?;
        paths.extend(entries.flatten());
    }
    paths.sort();
    paths.iter().map(|p| read_yaml(p)).collect()
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    serde_yaml::from_str(&contents).map_err(|e| {
        CubistError::Config(format!("failed to parse {}: {e}", path.display()))
    })
}
