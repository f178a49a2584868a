use std::{env, fs, path::PathBuf, sync::Arc};

use cubist::{
    backends::DuckDbConnection, config::CubistConfig, logging::init_tracing,
    registry::load_model, AggregateRequest, ConnectionManager, Workspace,
};

const SEED: &str = r#"
CREATE TABLE dim_date (date_key INTEGER, year INTEGER, month INTEGER, month_name VARCHAR);
CREATE TABLE dim_product (product_key INTEGER, category VARCHAR, name_en VARCHAR, name_sk VARCHAR);
CREATE TABLE fact_sales (id INTEGER, date_key INTEGER, product_key INTEGER, amount DOUBLE, taps INTEGER, impressions INTEGER);
INSERT INTO dim_date VALUES (1, 2024, 1, 'January'), (2, 2024, 2, 'February');
INSERT INTO dim_product VALUES (10, 'drinks', 'Tea', 'Caj'), (11, 'food', 'Bread', 'Chlieb');
INSERT INTO fact_sales VALUES (1, 1, 10, 2.5, 3, 40), (2, 1, 11, 1.0, 0, 12), (3, 2, 10, 4.0, 5, 0);
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = env::args().skip(1).collect::<Vec<_>>();
    let [models_dir, request_path] = args.as_slice() else {
        eprintln!("Usage: run_query <models_dir> <request_json>");
        std::process::exit(1);
    };

    let model = Arc::new(load_model(PathBuf::from(models_dir))?);
    let request: AggregateRequest = serde_json::from_str(&fs::read_to_string(request_path)?)?;

    let duckdb = DuckDbConnection::open(None)?;
    duckdb.execute_batch(SEED)?;
    let mut connections = ConnectionManager::new();
    connections.insert("default", Arc::new(duckdb));

    let workspace = Workspace::new(model, CubistConfig::load_default(), connections);
    let result = workspace.aggregate(&request).await?;
    for row in result.rows {
        println!("{}", serde_json::Value::Object(row));
    }
    Ok(())
}
