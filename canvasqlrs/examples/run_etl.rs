use std::{env, fs};

use canvasql::{CanvasqlConfig, ConnectionFactory, EtlEngine, EtlMode, EtlRequest};

fn usage() {
    eprintln!("Usage: run_etl <request_json> [run|refresh|full_refresh]   (e.g. demos/etl_request.json)");
    eprintln!("Configuration is read from CANVASQL_CONFIG, ./canvasql.toml or the user config dir.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    canvasql::telemetry::init_tracing();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let Some(request_path) = args.first() else {
        usage();
        std::process::exit(1);
    };
    let mode: EtlMode = match args.get(1) {
        Some(m) => serde_json::from_value(serde_json::Value::String(m.clone()))?,
        None => EtlMode::Run,
    };

    let config = CanvasqlConfig::load_default();
    let request: EtlRequest = serde_json::from_str(&fs::read_to_string(request_path)?)?;

    let engine = EtlEngine::from_config(&config)?;
    let report = engine
        .execute_request(mode, &request, &ConnectionFactory::for_etl(&config))
        .await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    for failed in report.failed_tables() {
        eprintln!(
            "{} failed: {}",
            failed.source_table,
            failed.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
