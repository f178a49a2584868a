//! Logical to physical reference resolution.
//!
//! A mapper turns a cube attribute into the schema, table and column it is
//! read from. Two policies exist: [`StarMapper`] for star and snowflake
//! schemas (explicit mappings with naming-convention fallback) and
//! [`DenormalizedMapper`] for a single wide table or view.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::config::{MapperPolicy, NamingConfig};
use crate::error::{CubistError, Result};
use crate::model::{AttributeRef, Cube};
use crate::star::JoinSpec;

/// Physical column locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnReference {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: String,
    /// Date part to extract, e.g. `year`.
    pub extract: Option<String>,
    /// SQL function applied to the column.
    pub function: Option<String>,
}

impl ColumnReference {
    pub fn new(schema: Option<&str>, table: &str, column: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: Some(table.to_string()),
            column: column.to_string(),
            extract: None,
            function: None,
        }
    }
}

impl fmt::Display for ColumnReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(schema) = &self.schema {
            write!(f, "{schema}.")?;
        }
        if let Some(table) = &self.table {
            write!(f, "{table}.")?;
        }
        f.write_str(&self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

pub trait Mapper: Send + Sync {
    fn cube(&self) -> &Cube;

    /// Table every query of the cube is rooted on.
    fn fact_table(&self) -> &TableName;

    /// Schema assumed for tables that do not name one.
    fn default_schema(&self) -> Option<&str>;

    /// Joins needed to reach every mapped table.
    fn joins(&self) -> &[JoinSpec];

    fn resolve(&self, attribute: AttributeRef<'_>, locale: Option<&str>) -> Result<ColumnReference>;

    /// Resolve a logical reference such as `product.name` or `amount`.
    fn resolve_reference(&self, reference: &str, locale: Option<&str>) -> Result<ColumnReference> {
        let attribute = self.cube().attribute(reference)?;
        self.resolve(attribute, locale)
    }
}

/// Construct the mapper for `policy`.
pub fn create_mapper<'a>(
    cube: &'a Cube,
    naming: &NamingConfig,
    policy: MapperPolicy,
    locale: Option<&str>,
) -> Box<dyn Mapper + 'a> {
    match policy {
        MapperPolicy::Star => Box::new(StarMapper::new(cube, naming, locale)),
        MapperPolicy::Denormalized => Box::new(DenormalizedMapper::new(cube, naming, locale)),
    }
}

fn require_base(attribute: &AttributeRef<'_>) -> Result<()> {
    if attribute.is_base() {
        Ok(())
    } else {
        Err(CubistError::Model(format!(
            "attribute '{}' has an expression and no physical representation",
            attribute.reference()
        )))
    }
}

fn chosen_locale<'a>(
    attribute: &AttributeRef<'a>,
    requested: Option<&str>,
) -> Option<&'a str> {
    let chosen = attribute.locale_for(requested);
    if let (Some(req), Some(loc)) = (requested, chosen) {
        if req != loc {
            tracing::debug!(
                attribute = %attribute.reference(),
                requested = req,
                using = loc,
                "locale not supported, using default locale"
            );
        }
    }
    chosen
}

/// Mapper for star and snowflake schemas.
pub struct StarMapper<'a> {
    cube: &'a Cube,
    naming: NamingConfig,
    locale: Option<String>,
    fact: TableName,
    cache: RwLock<HashMap<(String, Option<String>), ColumnReference>>,
}

impl<'a> StarMapper<'a> {
    pub fn new(cube: &'a Cube, naming: &NamingConfig, locale: Option<&str>) -> Self {
        let naming = naming.merge(cube.options());
        let name = match cube.fact() {
            Some(fact) => fact.to_string(),
            None => format!("{}{}{}", naming.fact_prefix, cube.name(), naming.fact_suffix),
        };
        let fact = TableName {
            schema: naming.fact_schema.clone().or_else(|| naming.schema.clone()),
            name,
        };
        Self {
            cube,
            naming,
            locale: locale.map(str::to_string),
            fact,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn naming(&self) -> &NamingConfig {
        &self.naming
    }

    /// Physical table of a dimension under the naming convention.
    pub fn dimension_table(&self, dimension: &str) -> TableName {
        TableName {
            schema: self
                .naming
                .dimension_schema
                .clone()
                .or_else(|| self.naming.schema.clone()),
            name: format!(
                "{}{dimension}{}",
                self.naming.dimension_prefix, self.naming.dimension_suffix
            ),
        }
    }

    fn physical(&self, attribute: &AttributeRef<'_>, locale: Option<&str>) -> Result<ColumnReference> {
        let logical = attribute.reference();
        let mappings = self.cube.mappings();
        let explicit = locale
            .and_then(|loc| mappings.get(&format!("{logical}.{loc}")))
            .or_else(|| mappings.get(&logical))
            .or_else(|| {
                // plain dimensions may be mapped by the dimension name alone
                attribute
                    .dimension()
                    .filter(|dim| *dim == attribute.name())
                    .and_then(|dim| mappings.get(dim))
            });

        if let Some(spec) = explicit {
            let mut column = spec.to_column_reference(None, None)?;
            match &column.table {
                Some(_) => {
                    if column.schema.is_none() {
                        column.schema = self.naming.schema.clone();
                    }
                }
                None => {
                    column.table = Some(self.fact.name.clone());
                    column.schema = column.schema.or_else(|| self.fact.schema.clone());
                }
            }
            return Ok(column);
        }

        let table = match attribute.dimension() {
            Some(dim_name) => {
                let dimension = self.cube.dimension(dim_name)?;
                if dimension.is_plain() && self.naming.simplify_dimension_references {
                    self.fact.clone()
                } else {
                    self.dimension_table(dim_name)
                }
            }
            None => self.fact.clone(),
        };
        let column = match locale {
            Some(loc) => format!("{}_{loc}", attribute.name()),
            None => attribute.name().to_string(),
        };
        Ok(ColumnReference {
            schema: table.schema,
            table: Some(table.name),
            column,
            extract: None,
            function: None,
        })
    }
}

impl Mapper for StarMapper<'_> {
    fn cube(&self) -> &Cube {
        self.cube
    }

    fn fact_table(&self) -> &TableName {
        &self.fact
    }

    fn default_schema(&self) -> Option<&str> {
        self.naming.schema.as_deref()
    }

    fn joins(&self) -> &[JoinSpec] {
        self.cube.joins()
    }

    fn resolve(&self, attribute: AttributeRef<'_>, locale: Option<&str>) -> Result<ColumnReference> {
        require_base(&attribute)?;
        let requested = locale.or(self.locale.as_deref());
        let locale = chosen_locale(&attribute, requested);
        let cache_key = (attribute.reference(), locale.map(str::to_string));

        {
            let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(&cache_key) {
                return Ok(hit.clone());
            }
        }

        let column = self.physical(&attribute, locale)?;
        tracing::trace!(attribute = %cache_key.0, column = %column, "resolved attribute");
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(cache_key).or_insert(column).clone())
    }
}

/// Mapper for a single denormalized table or view where every attribute is
/// stored in a column named after its logical reference.
pub struct DenormalizedMapper<'a> {
    cube: &'a Cube,
    locale: Option<String>,
    view: TableName,
    schema: Option<String>,
}

impl<'a> DenormalizedMapper<'a> {
    pub fn new(cube: &'a Cube, naming: &NamingConfig, locale: Option<&str>) -> Self {
        let naming = naming.merge(cube.options());
        let name = naming
            .denormalized_view
            .clone()
            .unwrap_or_else(|| format!("{}{}", naming.denormalized_view_prefix, cube.name()));
        let schema = naming
            .denormalized_view_schema
            .clone()
            .or_else(|| naming.schema.clone());
        Self {
            cube,
            locale: locale.map(str::to_string),
            view: TableName {
                schema: schema.clone(),
                name,
            },
            schema,
        }
    }
}

impl Mapper for DenormalizedMapper<'_> {
    fn cube(&self) -> &Cube {
        self.cube
    }

    fn fact_table(&self) -> &TableName {
        &self.view
    }

    fn default_schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn joins(&self) -> &[JoinSpec] {
        &[]
    }

    fn resolve(&self, attribute: AttributeRef<'_>, locale: Option<&str>) -> Result<ColumnReference> {
        require_base(&attribute)?;
        let requested = locale.or(self.locale.as_deref());
        let column = match chosen_locale(&attribute, requested) {
            Some(loc) => format!("{}_{loc}", attribute.reference()),
            None => attribute.reference(),
        };
        Ok(ColumnReference {
            schema: self.view.schema.clone(),
            table: Some(self.view.name.clone()),
            column,
            extract: None,
            function: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{CubeDef, DimensionDef, ModelDefaults};
    use crate::model::Model;

    fn model() -> Model {
        let dims: Vec<DimensionDef> = serde_yaml::from_str(
            r#"
- name: product
  attributes:
    - product_key
    - name: name
      locales: [en, sk]
    - {name: code_upper, expression: "code"}
    - code
- name: flag
- name: date
  levels: [year, month]
"#,
        )
        .unwrap();
        let cubes: Vec<CubeDef> = serde_yaml::from_str(
            r#"
- name: sales
  dimensions: [product, flag, date]
  measures: [amount]
  details: [order_no]
  mappings:
    product.name.sk: store.dim_product.product_name_slovak
    date.year: {table: dim_date, column: created_at, extract: year}
    flag.flag: bad.arity.really.long
- name: sales_override
  dimensions: [product]
  mappings:
    product.name: [store, dim_product, product_name]
  options:
    schema: analytics
- name: events
  dimensions: [flag]
"#,
        )
        .unwrap();
        Model::build(&ModelDefaults::default(), dims, cubes).unwrap()
    }

    fn naming() -> NamingConfig {
        NamingConfig {
            fact_prefix: "fact_".to_string(),
            dimension_prefix: "dim_".to_string(),
            ..NamingConfig::default()
        }
    }

    #[test]
    fn explicit_mapping_bypasses_naming_convention() {
        let model = model();
        let cube = model.cube("sales_override").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);
        let column = mapper.resolve_reference("product.name", Some("en")).unwrap();
        assert_eq!(
            column,
            ColumnReference::new(Some("store"), "dim_product", "product_name")
        );
    }

    #[test]
    fn plain_mapping_serves_every_locale() {
        let model = model();
        let cube = model.cube("sales_override").unwrap();
        let mapper = StarMapper::new(cube, &naming(), Some("sk"));
        let expected = ColumnReference::new(Some("store"), "dim_product", "product_name");
        for locale in [None, Some("en"), Some("sk"), Some("de")] {
            let column = mapper.resolve_reference("product.name", locale).unwrap();
            assert_eq!(column, expected, "locale {locale:?}");
        }

        // the locale-specific key still wins when both exist
        let cube = model.cube("sales").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);
        let sk = mapper.resolve_reference("product.name", Some("sk")).unwrap();
        assert_eq!(sk.column, "product_name_slovak");
    }

    #[test]
    fn implicit_naming() {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);

        let code = mapper.resolve_reference("product.code", None).unwrap();
        assert_eq!(code, ColumnReference::new(None, "dim_product", "code"));

        let amount = mapper.resolve_reference("amount", None).unwrap();
        assert_eq!(amount, ColumnReference::new(None, "fact_sales", "amount"));

        let order_no = mapper.resolve_reference("order_no", None).unwrap();
        assert_eq!(order_no.table.as_deref(), Some("fact_sales"));

        let month = mapper.resolve_reference("date.month", None).unwrap();
        assert_eq!(month, ColumnReference::new(None, "dim_date", "month"));

        let year = mapper.resolve_reference("date.year", None).unwrap();
        assert_eq!(year.table.as_deref(), Some("dim_date"));
        assert_eq!(year.extract.as_deref(), Some("year"));
    }

    #[test]
    fn plain_dimension_lives_on_fact_table() {
        let model = model();
        let cube = model.cube("events").unwrap();

        let mapper = StarMapper::new(cube, &naming(), None);
        let flag = mapper.resolve_reference("flag", None).unwrap();
        assert_eq!(flag, ColumnReference::new(None, "fact_events", "flag"));

        let naming = NamingConfig {
            simplify_dimension_references: false,
            ..naming()
        };
        let mapper = StarMapper::new(cube, &naming, None);
        let flag = mapper.resolve_reference("flag.flag", None).unwrap();
        assert_eq!(flag, ColumnReference::new(None, "dim_flag", "flag"));
    }

    #[test]
    fn cube_options_set_schema() {
        let model = model();
        let cube = model.cube("sales_override").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);
        assert_eq!(mapper.fact_table().schema.as_deref(), Some("analytics"));
        let key = mapper.resolve_reference("product.product_key", None).unwrap();
        assert_eq!(
            key,
            ColumnReference::new(Some("analytics"), "dim_product", "product_key")
        );
    }

    #[test]
    fn locale_fallback_and_localized_mapping() {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);

        let en = mapper.resolve_reference("product.name", Some("en")).unwrap();
        assert_eq!(en, ColumnReference::new(None, "dim_product", "name_en"));

        let de = mapper.resolve_reference("product.name", Some("de")).unwrap();
        assert_eq!(de, en);

        let default = mapper.resolve_reference("product.name", None).unwrap();
        assert_eq!(default, en);

        let sk = mapper.resolve_reference("product.name", Some("sk")).unwrap();
        assert_eq!(
            sk,
            ColumnReference::new(Some("store"), "dim_product", "product_name_slovak")
        );

        // locale is ignored for attributes without locales
        let code = mapper.resolve_reference("product.code", Some("sk")).unwrap();
        assert_eq!(code.column, "code");
    }

    #[test]
    fn mapper_default_locale() {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let mapper = StarMapper::new(cube, &naming(), Some("sk"));
        let column = mapper.resolve_reference("product.name", None).unwrap();
        assert_eq!(column.column, "product_name_slovak");
    }

    #[test]
    fn failure_modes() {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);

        let err = mapper.resolve_reference("product.colour", None).unwrap_err();
        assert!(matches!(err, CubistError::NoSuchAttribute(_)));

        let err = mapper.resolve_reference("product.code_upper", None).unwrap_err();
        assert!(matches!(err, CubistError::Model(_)));

        let err = mapper.resolve_reference("flag.flag", None).unwrap_err();
        assert!(matches!(err, CubistError::Argument(_)));

        let err = mapper.resolve_reference("record_count", None).unwrap_err();
        assert!(matches!(err, CubistError::Model(_)));
    }

    #[test]
    fn resolve_is_idempotent_and_shareable() {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let mapper = StarMapper::new(cube, &naming(), None);
        let first = mapper.resolve_reference("product.code", None).unwrap();
        let results: Vec<ColumnReference> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| mapper.resolve_reference("product.code", None).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for column in results {
            assert_eq!(column, first);
        }
    }

    #[test]
    fn denormalized_policy() {
        let model = model();
        let cube = model.cube("sales").unwrap();
        let mapper = create_mapper(cube, &naming(), MapperPolicy::Denormalized, None);
        assert_eq!(mapper.fact_table().name, "mft_sales");
        assert!(mapper.joins().is_empty());

        let column = mapper.resolve_reference("product.code", None).unwrap();
        assert_eq!(column, ColumnReference::new(None, "mft_sales", "product.code"));

        // explicit mappings are not consulted
        let column = mapper.resolve_reference("product.name", Some("sk")).unwrap();
        assert_eq!(column.column, "product.name_sk");

        let err = mapper
            .resolve_reference("product.code_upper", None)
            .unwrap_err();
        assert!(matches!(err, CubistError::Model(_)));
    }
}
