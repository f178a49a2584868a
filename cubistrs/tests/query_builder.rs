//! Integration tests for the query builder.
//!
//! These tests exercise the public API: SqlBuilder, Model, the request types.

use cubist::conditions::Condition;
use cubist::config::{MapperPolicy, NamingConfig, QueryConfig};
use cubist::dialect::DuckDbDialect;
use cubist::metadata::{CubeDef, DimensionDef, ModelDefaults, SortDirection};
use cubist::model::Model;
use cubist::query_builder::{
    AggregateRequest, Drilldown, FactsRequest, MembersRequest, OrderSpec, SqlBuilder,
};
use cubist::schema_cache::{ColumnSchema, SchemaCatalog, TableSchema};
use cubist::CubistError;
use serde_json::json;

// ============================================================================
// Test fixtures
// ============================================================================

mod fixtures {
    use super::*;

    const DIMENSIONS: &str = r#"
- name: date
  levels: [year, month]
- name: product
  levels:
    - name: category
      attributes: [category_key, category_label]
      order_attribute: category_label
    - name: product
      attributes: [product_key, {name: name, locales: [en, sk]}]
- name: flag
"#;

    const CUBES: &str = r#"
- name: sales
  key: id
  dimensions: [date, product, flag]
  measures:
    - {name: amount, aggregates: [sum, min]}
    - {name: clicks, aggregates: [sum]}
    - {name: impressions, aggregates: [sum]}
  aggregates:
    - {name: ctr, function: fraction, depends_on: [clicks_sum, impressions_sum]}
  joins:
    - {master: date_key, detail: dim_date.date_key}
    - {master: product_key, detail: dim_product.product_key}
"#;

    pub fn model() -> Model {
        let dims: Vec<DimensionDef> = serde_yaml::from_str(DIMENSIONS).unwrap();
        let cubes: Vec<CubeDef> = serde_yaml::from_str(CUBES).unwrap();
        Model::build(&ModelDefaults::default(), dims, cubes).unwrap()
    }

    pub fn builder<'a>() -> SqlBuilder<'a> {
        SqlBuilder::new().with_naming(NamingConfig {
            fact_prefix: "fact_".to_string(),
            dimension_prefix: "dim_".to_string(),
            ..NamingConfig::default()
        })
    }

    const INVENTORY_DIMENSIONS: &str = r#"
- name: date
  role: time
  levels:
    - year
    - quarter
    - name: month
      attributes: [month_key, month_name]
  hierarchies:
    - {name: ym, levels: [year, month]}
    - {name: yqm, levels: [year, quarter, month]}
  default_hierarchy_name: yqm
- name: warehouse
"#;

    const INVENTORY_CUBES: &str = r#"
- name: inventory
  dimensions: [date, warehouse]
  measures:
    - {name: stock, nonadditive: time, aggregates: [sum]}
    - {name: received, aggregates: [sum]}
  joins:
    - {master: date_key, detail: dim_date.date_key}
- name: shelf
  dimensions: [warehouse]
  measures:
    - {name: stock, nonadditive: time, aggregates: [sum]}
"#;

    pub fn inventory_model() -> Model {
        let dims: Vec<DimensionDef> = serde_yaml::from_str(INVENTORY_DIMENSIONS).unwrap();
        let cubes: Vec<CubeDef> = serde_yaml::from_str(INVENTORY_CUBES).unwrap();
        Model::build(&ModelDefaults::default(), dims, cubes).unwrap()
    }

    pub fn inventory(aggregates: &[&str], drilldown: &[Drilldown]) -> AggregateRequest {
        AggregateRequest {
            cube: "inventory".to_string(),
            ..aggregate(aggregates, drilldown)
        }
    }

    pub fn aggregate(aggregates: &[&str], drilldown: &[Drilldown]) -> AggregateRequest {
        AggregateRequest {
            cube: "sales".to_string(),
            aggregates: aggregates.iter().map(|s| s.to_string()).collect(),
            drilldown: drilldown.to_vec(),
            ..AggregateRequest::default()
        }
    }
}

use fixtures::*;

// ============================================================================
// Aggregation
// ============================================================================

#[test]
fn aggregate_with_drilldown_groups_and_orders_by_level() {
    let sql = builder()
        .build_aggregate(
            &model(),
            &aggregate(&["amount_sum"], &[Drilldown::new("date", Some("year"))]),
            &DuckDbDialect,
        )
        .unwrap();
    assert_eq!(
        sql,
        "SELECT \"dim_date\".\"year\" AS \"date.year\", coalesce(SUM(\"fact_sales\".\"amount\"), 0) AS \"amount_sum\" \
         FROM \"fact_sales\" JOIN \"dim_date\" ON (\"fact_sales\".\"date_key\" = \"dim_date\".\"date_key\") \
         GROUP BY \"dim_date\".\"year\" ORDER BY \"date.year\" ASC"
    );
}

#[test]
fn drilldown_selects_every_level_through_the_target() {
    let query = builder()
        .aggregate_query(
            &model(),
            &aggregate(&["amount_sum"], &[Drilldown::new("product", Some("product"))]),
        )
        .unwrap();
    let labels: Vec<&str> = query
        .select
        .iter()
        .filter_map(|s| s.alias.as_deref())
        .collect();
    assert_eq!(
        labels,
        vec![
            "product.category_key",
            "product.category_label",
            "product.product_key",
            "amount_sum"
        ]
    );
    assert_eq!(query.group_by.len(), 3);

    let sql = builder()
        .build_aggregate(
            &model(),
            &aggregate(&["amount_sum"], &[Drilldown::new("product", Some("product"))]),
            &DuckDbDialect,
        )
        .unwrap();
    assert!(sql.ends_with("ORDER BY \"product.category_label\" ASC, \"product.product_key\" ASC"));
}

#[test]
fn drilldown_without_level_uses_default_level() {
    let query = builder()
        .aggregate_query(&model(), &aggregate(&[], &[Drilldown::new("date", None)]))
        .unwrap();
    assert_eq!(query.select[0].alias.as_deref(), Some("date.year"));
    assert_eq!(query.group_by.len(), 1);
}

#[test]
fn repeated_drilldown_dimension_is_rejected() {
    let err = builder()
        .aggregate_query(
            &model(),
            &aggregate(
                &["amount_sum"],
                &[Drilldown::new("date", None), Drilldown::new("date", Some("month"))],
            ),
        )
        .unwrap_err();
    assert!(matches!(err, CubistError::Argument(_)));
}

#[test]
fn summary_is_one_unpaged_row() {
    let request = AggregateRequest {
        page: Some(2),
        page_size: Some(10),
        ..aggregate(&["ctr"], &[])
    };
    let sql = builder()
        .build_aggregate(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(sql.contains("nullif(coalesce(SUM(\"fact_sales\".\"impressions\"), 0), 0)"), "{sql}");
    assert!(sql.ends_with("AS \"ctr\" FROM \"fact_sales\""), "{sql}");
    assert!(!sql.contains("GROUP BY"));
    assert!(!sql.contains("LIMIT"));
}

#[test]
fn summary_defaults_to_every_aggregate() {
    let query = builder()
        .aggregate_query(&model(), &aggregate(&[], &[]))
        .unwrap();
    let mut labels: Vec<&str> = query
        .select
        .iter()
        .filter_map(|s| s.alias.as_deref())
        .collect();
    labels.sort_unstable();
    assert_eq!(
        labels,
        vec!["amount_min", "amount_sum", "clicks_sum", "ctr", "impressions_sum"]
    );
}

#[test]
fn unknown_aggregate_is_a_lookup_error() {
    let err = builder()
        .aggregate_query(&model(), &aggregate(&["revenue"], &[]))
        .unwrap_err();
    assert!(err.is_lookup());

    let err = builder()
        .aggregate_query(
            &model(),
            &AggregateRequest {
                cube: "inventory".to_string(),
                ..AggregateRequest::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, CubistError::NoSuchCube(_)));
}

// ============================================================================
// Ordering and paging
// ============================================================================

#[test]
fn user_order_comes_before_natural_order() {
    let request = AggregateRequest {
        order: vec![OrderSpec::new("amount_sum", SortDirection::Desc)],
        ..aggregate(&["amount_sum"], &[Drilldown::new("date", Some("month"))])
    };
    let sql = builder()
        .build_aggregate(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(sql.ends_with(
        "ORDER BY \"amount_sum\" DESC, \"date.year\" ASC, \"date.month\" ASC"
    ));
}

#[test]
fn order_by_unselected_column_is_rejected() {
    let request = AggregateRequest {
        order: vec![OrderSpec::new("product.name", SortDirection::Asc)],
        ..aggregate(&["amount_sum"], &[Drilldown::new("date", None)])
    };
    let err = builder().aggregate_query(&model(), &request).unwrap_err();
    assert!(matches!(err, CubistError::Argument(_)));
}

#[test]
fn paging_uses_page_size_and_default() {
    let request = AggregateRequest {
        page: Some(2),
        page_size: Some(10),
        ..aggregate(&["amount_sum"], &[Drilldown::new("date", None)])
    };
    let query = builder().aggregate_query(&model(), &request).unwrap();
    assert_eq!((query.limit, query.offset), (Some(10), Some(20)));

    let request = AggregateRequest {
        page: Some(1),
        ..aggregate(&["amount_sum"], &[Drilldown::new("date", None)])
    };
    let query = builder().aggregate_query(&model(), &request).unwrap();
    assert_eq!((query.limit, query.offset), (None, None));

    let paged = builder().with_query_config(QueryConfig {
        default_page_size: Some(50),
        ..QueryConfig::default()
    });
    let query = paged.aggregate_query(&model(), &request).unwrap();
    assert_eq!((query.limit, query.offset), (Some(50), Some(50)));
}

// ============================================================================
// Conditions
// ============================================================================

#[test]
fn conditions_become_where_clauses() {
    let request = AggregateRequest {
        conditions: vec![
            Condition::point("date", Some("year"), vec![json!(2024)]),
            Condition::matching("product", Some("category"), "Bev%"),
        ],
        ..aggregate(&["amount_sum"], &[Drilldown::new("date", None)])
    };
    let sql = builder()
        .build_aggregate(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(sql.contains(
        "WHERE (\"dim_date\".\"year\" = 2024) AND (\"dim_product\".\"category_key\" LIKE 'Bev%')"
    ), "{sql}");
    assert!(sql.contains("JOIN \"dim_product\""));
}

#[test]
fn condition_on_unknown_dimension_fails() {
    let request = AggregateRequest {
        conditions: vec![Condition::point("store", None, vec![json!(1)])],
        ..aggregate(&["amount_sum"], &[])
    };
    let err = builder().aggregate_query(&model(), &request).unwrap_err();
    assert!(matches!(err, CubistError::NoSuchDimension(_)));
}

// ============================================================================
// Facts, counts and members
// ============================================================================

#[test]
fn facts_default_to_key_and_fact_attributes() {
    let request = FactsRequest {
        cube: "sales".to_string(),
        ..FactsRequest::default()
    };
    let query = builder().facts_query(&model(), &request).unwrap();
    assert_eq!(query.select[0].alias.as_deref(), Some("id"));
    let labels: Vec<&str> = query
        .select
        .iter()
        .filter_map(|s| s.alias.as_deref())
        .collect();
    assert!(labels.contains(&"product.name"));
    assert!(labels.contains(&"flag.flag"));
    assert!(labels.contains(&"amount"));

    let sql = builder()
        .build_facts(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(sql.starts_with("SELECT \"fact_sales\".\"id\" AS \"id\""));
    assert!(sql.contains("\"dim_product\".\"name_en\" AS \"product.name\""));
    assert!(sql.ends_with("ORDER BY \"id\" ASC"));
}

#[test]
fn facts_with_fields_and_locale() {
    let request = FactsRequest {
        cube: "sales".to_string(),
        fields: vec!["product.name".to_string(), "amount".to_string()],
        locale: Some("sk".to_string()),
        page: Some(0),
        page_size: Some(25),
        ..FactsRequest::default()
    };
    let sql = builder()
        .build_facts(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert_eq!(
        sql,
        "SELECT \"dim_product\".\"name_sk\" AS \"product.name\", \"fact_sales\".\"amount\" AS \"amount\" \
         FROM \"fact_sales\" JOIN \"dim_product\" ON (\"fact_sales\".\"product_key\" = \"dim_product\".\"product_key\") \
         LIMIT 25 OFFSET 0"
    );
}

#[test]
fn facts_reject_aggregates() {
    let request = FactsRequest {
        cube: "sales".to_string(),
        fields: vec!["amount_sum".to_string()],
        ..FactsRequest::default()
    };
    let err = builder().facts_query(&model(), &request).unwrap_err();
    assert!(matches!(err, CubistError::Argument(_)));
}

#[test]
fn fact_count_counts_rows() {
    let request = FactsRequest {
        cube: "sales".to_string(),
        page_size: Some(5),
        ..FactsRequest::default()
    };
    let sql = builder()
        .build_fact_count(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert_eq!(sql, "SELECT COUNT(*) AS \"count\" FROM \"fact_sales\"");
}

#[test]
fn members_read_only_the_dimension_table() {
    let request = MembersRequest {
        cube: "sales".to_string(),
        dimension: "date".to_string(),
        level: Some("month".to_string()),
        ..MembersRequest::default()
    };
    let sql = builder()
        .build_members(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert_eq!(
        sql,
        "SELECT DISTINCT \"dim_date\".\"year\" AS \"date.year\", \"dim_date\".\"month\" AS \"date.month\" \
         FROM \"dim_date\" ORDER BY \"date.year\" ASC, \"date.month\" ASC"
    );
}

#[test]
fn members_with_conditions_join_the_fact() {
    let request = MembersRequest {
        cube: "sales".to_string(),
        dimension: "date".to_string(),
        level: Some("year".to_string()),
        conditions: vec![Condition::point("product", None, vec![json!("c1")])],
        ..MembersRequest::default()
    };
    let sql = builder()
        .build_members(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(sql.contains("FROM \"fact_sales\""), "{sql}");
    assert!(sql.contains("JOIN \"dim_date\""));
    assert!(sql.contains("JOIN \"dim_product\""));
}

#[test]
fn members_of_plain_dimension_come_from_the_fact() {
    let request = MembersRequest {
        cube: "sales".to_string(),
        dimension: "flag".to_string(),
        ..MembersRequest::default()
    };
    let sql = builder()
        .build_members(&model(), &request, &DuckDbDialect)
        .unwrap();
    assert_eq!(
        sql,
        "SELECT DISTINCT \"fact_sales\".\"flag\" AS \"flag.flag\" FROM \"fact_sales\" ORDER BY \"flag.flag\" ASC"
    );
}

// ============================================================================
// Hierarchies
// ============================================================================

fn labels(query: &cubist::sql_ast::SelectQuery) -> Vec<&str> {
    query.select.iter().filter_map(|s| s.alias.as_deref()).collect()
}

#[test]
fn drilldown_follows_the_requested_hierarchy() {
    let model = inventory_model();
    let query = builder()
        .aggregate_query(
            &model,
            &inventory(&["received_sum"], &[Drilldown::new("date", Some("month")).in_hierarchy("ym")]),
        )
        .unwrap();
    assert_eq!(labels(&query), vec!["date.year", "date.month_key", "received_sum"]);

    let query = builder()
        .aggregate_query(&model, &inventory(&["received_sum"], &[Drilldown::new("date", Some("month"))]))
        .unwrap();
    assert_eq!(
        labels(&query),
        vec!["date.year", "date.quarter", "date.month_key", "received_sum"]
    );

    let err = builder()
        .aggregate_query(
            &model,
            &inventory(&["received_sum"], &[Drilldown::new("date", Some("quarter")).in_hierarchy("ym")]),
        )
        .unwrap_err();
    assert!(err.is_lookup());
}

#[test]
fn members_of_a_named_hierarchy() {
    let request = MembersRequest {
        cube: "inventory".to_string(),
        dimension: "date".to_string(),
        hierarchy: Some("ym".to_string()),
        ..MembersRequest::default()
    };
    let query = builder().members_query(&inventory_model(), &request).unwrap();
    assert_eq!(labels(&query), vec!["date.year", "date.month_key", "date.month_name"]);
}

#[test]
fn path_conditions_use_the_hierarchy_levels() {
    let request = AggregateRequest {
        conditions: vec![
            Condition::path("date", Some("ym"), vec![json!(2024), json!(202403)]),
            Condition::set("warehouse", None, vec![vec![json!("north")], vec![json!("south")]]),
        ],
        ..inventory(&["received_sum"], &[])
    };
    let sql = builder()
        .build_aggregate(&inventory_model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(
        sql.ends_with(
            "WHERE ((\"dim_date\".\"year\" = 2024) AND (\"dim_date\".\"month_key\" = 202403)) \
             AND ((\"fact_inventory\".\"warehouse\" = 'north') OR (\"fact_inventory\".\"warehouse\" = 'south'))"
        ),
        "{sql}"
    );

    let request = AggregateRequest {
        conditions: vec![Condition::path(
            "date",
            Some("ym"),
            vec![json!(2024), json!(202403), json!(1)],
        )],
        ..inventory(&["received_sum"], &[])
    };
    let err = builder().aggregate_query(&inventory_model(), &request).unwrap_err();
    assert!(matches!(err, CubistError::Argument(_)));
}

// ============================================================================
// Non-additive measures
// ============================================================================

#[test]
fn nonadditive_summary_reads_the_latest_snapshot() {
    let sql = builder()
        .build_aggregate(&inventory_model(), &inventory(&["stock_sum"], &[]), &DuckDbDialect)
        .unwrap();
    assert_eq!(
        sql,
        "SELECT coalesce(SUM(\"fact_inventory\".\"stock\"), 0) AS \"stock_sum\" \
         FROM \"fact_inventory\" JOIN \"dim_date\" ON (\"fact_inventory\".\"date_key\" = \"dim_date\".\"date_key\") \
         JOIN (SELECT MAX(\"dim_date\".\"month_key\") AS \"__latest_0\" \
         FROM \"fact_inventory\" JOIN \"dim_date\" ON (\"fact_inventory\".\"date_key\" = \"dim_date\".\"date_key\")) \
         AS \"__semiadditive\" ON (\"dim_date\".\"month_key\" = \"__semiadditive\".\"__latest_0\")"
    );
}

#[test]
fn nonadditive_snapshot_is_taken_per_group() {
    let request = AggregateRequest {
        conditions: vec![Condition::point("date", Some("year"), vec![json!(2024)])],
        ..inventory(&["stock_sum", "received_sum"], &[Drilldown::new("warehouse", None)])
    };
    let query = builder().aggregate_query(&inventory_model(), &request).unwrap();
    assert_eq!(query.from.join_count(), 2);

    let sql = builder()
        .build_aggregate(&inventory_model(), &request, &DuckDbDialect)
        .unwrap();
    assert!(
        sql.contains(
            "JOIN (SELECT \"fact_inventory\".\"warehouse\" AS \"__group_0\", \
             MAX(\"dim_date\".\"month_key\") AS \"__latest_0\" FROM \"fact_inventory\" \
             JOIN \"dim_date\" ON (\"fact_inventory\".\"date_key\" = \"dim_date\".\"date_key\") \
             WHERE (\"dim_date\".\"year\" = 2024) GROUP BY \"fact_inventory\".\"warehouse\") AS \"__semiadditive\" \
             ON (\"fact_inventory\".\"warehouse\" = \"__semiadditive\".\"__group_0\") \
             AND (\"dim_date\".\"month_key\" = \"__semiadditive\".\"__latest_0\")"
        ),
        "{sql}"
    );
    assert!(sql.ends_with("WHERE (\"dim_date\".\"year\" = 2024) GROUP BY \"fact_inventory\".\"warehouse\" ORDER BY \"warehouse.warehouse\" ASC"), "{sql}");
}

#[test]
fn additive_aggregates_need_no_snapshot() {
    let query = builder()
        .aggregate_query(&inventory_model(), &inventory(&["received_sum"], &[Drilldown::new("warehouse", None)]))
        .unwrap();
    assert_eq!(query.from.join_count(), 0);
}

#[test]
fn nonadditive_without_time_dimension_is_a_model_error() {
    let request = AggregateRequest {
        cube: "shelf".to_string(),
        ..AggregateRequest::default()
    };
    let err = builder().aggregate_query(&inventory_model(), &request).unwrap_err();
    assert!(matches!(err, CubistError::Model(ref msg) if msg.contains("time dimension")), "{err}");
}

// ============================================================================
// Mapper policy and physical schema
// ============================================================================

#[test]
fn denormalized_policy_reads_one_view() {
    let sql = builder()
        .with_policy(MapperPolicy::Denormalized)
        .build_aggregate(
            &model(),
            &aggregate(&["amount_sum"], &[Drilldown::new("date", None)]),
            &DuckDbDialect,
        )
        .unwrap();
    assert!(sql.contains("FROM \"mft_sales\" GROUP BY"), "{sql}");
    assert!(sql.contains("\"mft_sales\".\"date.year\" AS \"date.year\""));
    assert!(!sql.contains("JOIN"));
}

fn table(name: &str, columns: &[&str]) -> TableSchema {
    TableSchema {
        schema: None,
        name: name.to_string(),
        columns: columns
            .iter()
            .map(|c| ColumnSchema {
                name: c.to_string(),
                data_type: "INTEGER".to_string(),
                nullable: true,
            })
            .collect(),
    }
}

#[test]
fn physical_schema_checks_columns() {
    let catalog: SchemaCatalog = vec![
        table("fact_sales", &["id", "date_key", "product_key", "flag", "clicks"]),
        table("dim_date", &["date_key", "year", "month"]),
        table("dim_product", &["product_key", "category_key", "category_label"]),
    ]
    .into_iter()
    .collect();

    let builder = builder().with_schema(&catalog);
    let err = builder
        .aggregate_query(&model(), &aggregate(&["amount_sum"], &[]))
        .unwrap_err();
    assert!(matches!(err, CubistError::Schema(ref msg) if msg.contains("amount")), "{err}");

    let query = builder
        .aggregate_query(&model(), &aggregate(&["clicks_sum"], &[Drilldown::new("date", None)]))
        .unwrap();
    assert_eq!(query.from.join_count(), 1);
}
