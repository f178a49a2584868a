use std::collections::{BTreeSet, HashSet};

use serde_json::Value;

use crate::depsort::{depsort, DependencyMap};
use crate::error::{CubistError, Result};
use crate::metadata::{AttributeDef, DimensionDef, HierarchyDef, LevelObject};

use super::attribute::{check_name, Attribute};

/// One step of a dimension hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    name: String,
    label: Option<String>,
    attributes: Vec<Attribute>,
    key: usize,
    order_attribute: usize,
    label_attribute: Option<usize>,
    info: Option<Value>,
}

impl Level {
    fn from_def(def: LevelObject, dimension: &str) -> Result<Self> {
        check_name(&def.name, "level")?;
        let attribute_defs = if def.attributes.is_empty() {
            vec![AttributeDef::Name(def.name.clone())]
        } else {
            def.attributes
        };
        let attributes = attribute_defs
            .into_iter()
            .map(|a| Attribute::from_def(a.into_object(), Some(dimension)))
            .collect::<Result<Vec<_>>>()?;

        let position = |what: &str, name: &str| {
            attributes.iter().position(|a| a.name == name).ok_or_else(|| {
                CubistError::Model(format!(
                    "{what} '{name}' of level '{dimension}.{}' is not one of its attributes",
                    def.name
                ))
            })
        };
        let key = match &def.key {
            Some(name) => position("key", name)?,
            None => 0,
        };
        let order_attribute = match &def.order_attribute {
            Some(name) => position("order attribute", name)?,
            None => key,
        };
        let label_attribute = def
            .label_attribute
            .as_deref()
            .map(|name| position("label attribute", name))
            .transpose()?;

        Ok(Self {
            name: def.name,
            label: def.label,
            attributes,
            key,
            order_attribute,
            label_attribute,
            info: def.info,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn key(&self) -> &Attribute {
        &self.attributes[self.key]
    }

    pub fn order_attribute(&self) -> &Attribute {
        &self.attributes[self.order_attribute]
    }

    pub fn label_attribute(&self) -> Option<&Attribute> {
        self.label_attribute.map(|idx| &self.attributes[idx])
    }

    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }
}

/// Name of the hierarchy spanning every level when none is declared.
pub const DEFAULT_HIERARCHY: &str = "default";

/// Ordered path through some of a dimension's levels, top-down.
#[derive(Debug, Clone, PartialEq)]
pub struct Hierarchy {
    name: String,
    label: Option<String>,
    levels: Vec<usize>,
    info: Option<Value>,
}

impl Hierarchy {
    fn from_def(def: HierarchyDef, levels: &[Level], dimension: &str) -> Result<Self> {
        check_name(&def.name, "hierarchy")?;
        if def.levels.is_empty() {
            return Err(CubistError::Model(format!(
                "hierarchy '{}' of dimension '{dimension}' has no levels",
                def.name
            )));
        }
        let mut seen = HashSet::new();
        let mut indices = Vec::with_capacity(def.levels.len());
        for level in &def.levels {
            if !seen.insert(level.as_str()) {
                return Err(CubistError::Model(format!(
                    "level '{level}' appears twice in hierarchy '{}' of dimension '{dimension}'",
                    def.name
                )));
            }
            let idx = levels.iter().position(|l| &l.name == level).ok_or_else(|| {
                CubistError::Model(format!(
                    "hierarchy '{}' of dimension '{dimension}' uses unknown level '{level}'",
                    def.name
                ))
            })?;
            indices.push(idx);
        }
        Ok(Self {
            name: def.name,
            label: def.label,
            levels: indices,
            info: def.info,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }
}

/// Hierarchical axis of a cube. Owns its levels and attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    name: String,
    label: Option<String>,
    description: Option<String>,
    role: Option<String>,
    levels: Vec<Level>,
    hierarchies: Vec<Hierarchy>,
    default_hierarchy: usize,
    default_level: usize,
    info: Option<Value>,
}

impl Dimension {
    pub fn from_def(def: DimensionDef) -> Result<Self> {
        check_name(&def.name, "dimension")?;
        let name = def.name;
        let level_objects: Vec<LevelObject> = if def.levels.is_empty() {
            let attributes = if def.attributes.is_empty() {
                vec![AttributeDef::Name(name.clone())]
            } else {
                def.attributes
            };
            vec![LevelObject {
                name: name.clone(),
                attributes,
                ..LevelObject::default()
            }]
        } else if !def.attributes.is_empty() {
            return Err(CubistError::Model(format!(
                "dimension '{name}' declares both levels and top-level attributes"
            )));
        } else {
            def.levels.into_iter().map(|l| l.into_object()).collect()
        };

        let levels = level_objects
            .into_iter()
            .map(|l| Level::from_def(l, &name))
            .collect::<Result<Vec<_>>>()?;

        let mut level_names = HashSet::new();
        for level in &levels {
            if !level_names.insert(level.name.as_str()) {
                return Err(CubistError::Model(format!(
                    "duplicate level '{}' in dimension '{name}'",
                    level.name
                )));
            }
        }

        let hierarchies = if def.hierarchies.is_empty() {
            vec![Hierarchy {
                name: DEFAULT_HIERARCHY.to_string(),
                label: None,
                levels: (0..levels.len()).collect(),
                info: None,
            }]
        } else {
            def.hierarchies
                .into_iter()
                .map(|h| Hierarchy::from_def(h, &levels, &name))
                .collect::<Result<Vec<_>>>()?
        };
        let mut hierarchy_names = HashSet::new();
        for hierarchy in &hierarchies {
            if !hierarchy_names.insert(hierarchy.name.as_str()) {
                return Err(CubistError::Model(format!(
                    "duplicate hierarchy '{}' in dimension '{name}'",
                    hierarchy.name
                )));
            }
        }
        let default_hierarchy = match &def.default_hierarchy_name {
            Some(wanted) => hierarchies.iter().position(|h| &h.name == wanted).ok_or_else(|| {
                CubistError::Model(format!(
                    "default hierarchy '{wanted}' is not a hierarchy of dimension '{name}'"
                ))
            })?,
            None => hierarchies
                .iter()
                .position(|h| h.name == DEFAULT_HIERARCHY)
                .unwrap_or(0),
        };

        let default_level = match &def.default_level {
            Some(level) => levels.iter().position(|l| &l.name == level).ok_or_else(|| {
                CubistError::Model(format!(
                    "default level '{level}' is not a level of dimension '{name}'"
                ))
            })?,
            None => hierarchies[default_hierarchy].levels.first().copied().unwrap_or(0),
        };

        let dimension = Self {
            name,
            label: def.label,
            description: def.description,
            role: def.role,
            levels,
            hierarchies,
            default_hierarchy,
            default_level,
            info: def.info,
        };
        dimension.validate_attributes()?;
        Ok(dimension)
    }

    fn validate_attributes(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for attr in self.attributes() {
            if !seen.insert(attr.reference()) {
                return Err(CubistError::Model(format!(
                    "duplicate attribute '{}' in dimension '{}'",
                    attr.name, self.name
                )));
            }
        }
        let deps: DependencyMap = self
            .attributes()
            .map(|a| (a.reference(), a.depends_on.clone()))
            .collect();
        for attr in self.attributes() {
            if let Some(missing) = attr.depends_on.iter().find(|d| !seen.contains(*d)) {
                return Err(CubistError::Model(format!(
                    "attribute '{}' refers to '{missing}', which is not an attribute of dimension '{}'",
                    attr.reference(),
                    self.name
                )));
            }
        }
        depsort(&seen.into_iter().collect::<Vec<_>>(), &deps)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn info(&self) -> Option<&Value> {
        self.info.as_ref()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn default_level(&self) -> &Level {
        &self.levels[self.default_level]
    }

    pub fn level(&self, name: &str) -> Result<&Level> {
        self.levels.iter().find(|l| l.name == name).ok_or_else(|| {
            CubistError::NoSuchAttribute(format!("level '{name}' in dimension '{}'", self.name))
        })
    }

    pub fn hierarchies(&self) -> &[Hierarchy] {
        &self.hierarchies
    }

    pub fn default_hierarchy(&self) -> &Hierarchy {
        &self.hierarchies[self.default_hierarchy]
    }

    /// Hierarchy by name, or the default one.
    pub fn hierarchy(&self, name: Option<&str>) -> Result<&Hierarchy> {
        match name {
            None => Ok(self.default_hierarchy()),
            Some(name) => self.hierarchies.iter().find(|h| h.name == name).ok_or_else(|| {
                CubistError::NoSuchAttribute(format!(
                    "hierarchy '{name}' in dimension '{}'",
                    self.name
                ))
            }),
        }
    }

    fn hierarchy_levels(&self, hierarchy: &Hierarchy) -> Vec<&Level> {
        hierarchy.levels.iter().map(|&idx| &self.levels[idx]).collect()
    }

    /// Levels of a hierarchy, top-down.
    pub fn levels_in(&self, hierarchy: Option<&str>) -> Result<Vec<&Level>> {
        Ok(self.hierarchy_levels(self.hierarchy(hierarchy)?))
    }

    /// Levels of a hierarchy from the top down to and including `name`.
    pub fn levels_through(&self, hierarchy: Option<&str>, name: &str) -> Result<Vec<&Level>> {
        let hierarchy = self.hierarchy(hierarchy)?;
        let mut levels = self.hierarchy_levels(hierarchy);
        let idx = levels.iter().position(|l| l.name == name).ok_or_else(|| {
            CubistError::NoSuchAttribute(format!(
                "level '{name}' in hierarchy '{}' of dimension '{}'",
                hierarchy.name, self.name
            ))
        })?;
        levels.truncate(idx + 1);
        Ok(levels)
    }

    /// Levels addressed by a path of `depth` key values.
    pub fn levels_for_path(&self, hierarchy: Option<&str>, depth: usize) -> Result<Vec<&Level>> {
        let hierarchy = self.hierarchy(hierarchy)?;
        let mut levels = self.hierarchy_levels(hierarchy);
        if depth == 0 || depth > levels.len() {
            return Err(CubistError::Argument(format!(
                "path of {depth} values does not fit hierarchy '{}' of dimension '{}' with {} levels",
                hierarchy.name,
                self.name,
                levels.len()
            )));
        }
        levels.truncate(depth);
        Ok(levels)
    }

    /// Levels of a hierarchy down to the default level, or just its top
    /// level when the hierarchy does not contain the default level.
    pub fn default_levels(&self, hierarchy: Option<&str>) -> Result<Vec<&Level>> {
        let default = self.default_level();
        let mut levels = self.levels_in(hierarchy)?;
        let depth = levels
            .iter()
            .position(|l| l.name == default.name)
            .map_or(1, |pos| pos + 1);
        levels.truncate(depth);
        Ok(levels)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.levels.iter().flat_map(|l| l.attributes.iter())
    }

    pub fn attribute(&self, name: &str) -> Result<&Attribute> {
        self.attributes().find(|a| a.name == name).ok_or_else(|| {
            CubistError::NoSuchAttribute(format!("{}.{name}", self.name))
        })
    }

    pub fn is_flat(&self) -> bool {
        self.levels.len() == 1
    }

    pub fn has_details(&self) -> bool {
        self.levels.iter().any(|l| l.attributes.len() > 1)
    }

    /// Single level with a single attribute; such a dimension needs no table
    /// of its own.
    pub fn is_plain(&self) -> bool {
        self.is_flat() && !self.has_details()
    }
}
