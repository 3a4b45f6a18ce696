use anyhow::{bail, Context};
use docrel::config::AppConfig;
use docrel::logic::compile;
use docrel::model::SchemaDefinition;

const USAGE: &str = "usage: docrel <schema.json> [--blob <out>]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (schema_path, blob_path) = match args.as_slice() {
        [schema] => (schema, None),
        [schema, flag, out] if flag == "--blob" => (schema, Some(out)),
        _ => bail!(USAGE),
    };

    let raw = std::fs::read_to_string(schema_path)
        .with_context(|| format!("Failed to read schema file {}", schema_path))?;
    let schema: SchemaDefinition = serde_json::from_str(&raw).context("Failed to parse schema")?;
    let model = compile(&schema, &config.compiler)?;

    match blob_path {
        Some(out) => {
            let blob = model.to_blob()?;
            std::fs::write(out, &blob).with_context(|| format!("Failed to write {}", out))?;
            log::info!(
                "Wrote compiled model {} ({} bytes) to {}",
                model.schema_hash,
                blob.len(),
                out
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&model)?),
    }

    Ok(())
}
