//! Validated, immutable logical model: cubes, dimensions, levels and attributes.

mod attribute;
mod cube;
mod dimension;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{CubistError, Result};
use crate::metadata::{CubeDef, DimensionDef, ModelDefaults};

pub use attribute::{Additivity, Aggregate, Attribute, AttributeRef, Measure};
pub use cube::Cube;
pub use dimension::{Dimension, Hierarchy, Level, DEFAULT_HIERARCHY};

#[derive(Debug, Clone, Default)]
pub struct Model {
    name: Option<String>,
    label: Option<String>,
    info: Option<Value>,
    dimensions: BTreeMap<String, Arc<Dimension>>,
    cubes: BTreeMap<String, Cube>,
}

impl Model {
    /// Build and validate a whole model. Model-wide defaults are merged into
    /// every cube before it is constructed.
    pub fn build(
        defaults: &ModelDefaults,
        dimensions: Vec<DimensionDef>,
        cubes: Vec<CubeDef>,
    ) -> Result<Self> {
        let mut dims = BTreeMap::new();
        for def in dimensions {
            let dim = Dimension::from_def(def)?;
            let name = dim.name().to_string();
            if dims.insert(name.clone(), Arc::new(dim)).is_some() {
                return Err(CubistError::Model(format!("duplicate dimension '{name}'")));
            }
        }

        let mut built = BTreeMap::new();
        for def in cubes {
            // model-wide mappings are only kept where they name a cube attribute
            let merged = CubeDef {
                mappings: def.mappings.clone(),
                ..defaults.apply(&def)
            };
            let cube = Cube::from_def(&merged, &dims)?.with_shared_mappings(&defaults.mappings);
            tracing::debug!(
                cube = cube.name(),
                dimensions = cube.dimensions().count(),
                aggregates = cube.aggregates().len(),
                "built cube"
            );
            if built.insert(def.name.clone(), cube).is_some() {
                return Err(CubistError::Model(format!("duplicate cube '{}'", def.name)));
            }
        }

        Ok(Self {
            name: defaults.name.clone(),
            label: defaults.label.clone(),
            info: defaults.info.clone(),
            dimensions: dims,
            cubes: built,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }

    pub fn cube(&self, name: &str) -> Result<&Cube> {
        self.cubes
            .get(name)
            .ok_or_else(|| CubistError::NoSuchCube(name.to_string()))
    }

    pub fn cubes(&self) -> impl Iterator<Item = &Cube> {
        self.cubes.values()
    }

    pub fn dimension(&self, name: &str) -> Result<&Dimension> {
        self.dimensions
            .get(name)
            .map(|d| d.as_ref())
            .ok_or_else(|| CubistError::NoSuchDimension(name.to_string()))
    }

    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.values().map(|d| d.as_ref())
    }
}
