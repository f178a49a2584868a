pub mod aggregates;
pub mod backends;
pub mod conditions;
pub mod config;
pub mod depsort;
pub mod dialect;
pub mod error;
pub mod expr;
pub mod logging;
pub mod mapper;
pub mod metadata;
pub mod model;
pub mod query_builder;
pub mod registry;
pub mod runtime;
pub mod schema_cache;
pub mod sql_ast;
pub mod star;

use std::path::Path;

use crate::error::Result;

/// Load a model directory and validate it.
pub fn load_model<P: AsRef<Path>>(model_dir: P) -> Result<Model> {
    registry::load_model(model_dir)
}

pub use backends::{BackendConnection, ConnectionManager, QueryResult};
pub use conditions::Condition;
pub use config::{CubistConfig, MapperPolicy, NamingConfig, QueryConfig};
pub use error::CubistError;
pub use mapper::{create_mapper, ColumnReference, Mapper};
pub use model::{Cube, Dimension, Hierarchy, Level, Model};
pub use query_builder::{
    AggregateRequest, Drilldown, FactsRequest, MembersRequest, OrderSpec, QueryBuilder, SqlBuilder,
};
pub use runtime::Workspace;
pub use schema_cache::{PhysicalSchema, SchemaCatalog, TableSchema};
pub use star::{JoinMethod, JoinSpec, StarSchema};
