use std::collections::BTreeMap;
use std::{env, fs, path::PathBuf};

use canvasql::{QueryCompiler, QueryRequest, SchemaMetadata};
use serde::Deserialize;

/// Offline schema description: column types per table, keys and relations.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SchemaFile {
    tables: BTreeMap<String, Vec<(String, String)>>,
    primary_keys: BTreeMap<String, Vec<String>>,
    foreign_keys: Vec<[String; 4]>,
}

impl SchemaFile {
    fn into_metadata(self) -> SchemaMetadata {
        let mut builder = SchemaMetadata::builder();
        for (table, columns) in &self.tables {
            let columns: Vec<(&str, &str)> = columns
                .iter()
                .map(|(name, ty)| (name.as_str(), ty.as_str()))
                .collect();
            builder = builder.typed_table(table, &columns);
        }
        for (table, keys) in &self.primary_keys {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            builder = builder.primary_key(table, &keys);
        }
        for [from_table, from_column, to_table, to_column] in &self.foreign_keys {
            builder = builder.foreign_key(from_table, from_column, to_table, to_column);
        }
        builder.build()
    }
}

fn usage() {
    eprintln!("Usage: print_sql <schema_json> <request_json>");
    eprintln!("Example: cargo run --example print_sql -- demos/shop_schema.json demos/sales_by_region.json");
}

fn main() -> anyhow::Result<()> {
    canvasql::telemetry::init_tracing();

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let schema_path = PathBuf::from(args.remove(0));
    let request_path = PathBuf::from(args.remove(0));

    let schema: SchemaFile = serde_json::from_str(&fs::read_to_string(schema_path)?)?;
    let request = QueryRequest::from_json(serde_json::from_str(&fs::read_to_string(request_path)?)?)?;

    let compiled = QueryCompiler::default().compile(&request, Some(&schema.into_metadata()))?;
    println!("{}", compiled.sql);
    if !compiled.params.is_empty() {
        println!("-- params: {:?}", compiled.params);
        println!("{}", compiled.rendered_sql);
    }
    Ok(())
}
