use std::{env, fs, path::PathBuf};

use cubist::{
    config::CubistConfig, dialect::DuckDbDialect, logging::init_tracing, registry::ModelRegistry,
    AggregateRequest, SqlBuilder,
};

fn usage() {
    eprintln!("Usage: print_sql <models_dir> <request_json>");
    eprintln!("Example: cargo run --example print_sql -- examples/models examples/requests/sales_by_month.json");
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let models_dir = PathBuf::from(args.remove(0));
    let request_path = PathBuf::from(args.remove(0));

    let model = ModelRegistry::load_from_dir(models_dir)?.build()?;
    let request_str = fs::read_to_string(request_path)?;
    let request: AggregateRequest = serde_json::from_str(&request_str)?;

    let config = CubistConfig::load_default().for_store("default");
    let builder = SqlBuilder::from_config(&config);
    let sql = builder.build_aggregate(&model, &request, &DuckDbDialect)?;
    println!("{sql}");
    Ok(())
}
