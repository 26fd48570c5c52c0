//! `kohai serve` — Start the HTTP inference server.

use std::path::PathBuf;

use kohai_config::AppConfig;

pub async fn run(
    port_override: Option<u16>,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &config_path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("⛩️  Kōhai inference service");
    println!("   Base model: {}", config.model.base_model);
    match &config.model.adapter_repo {
        Some(repo) if !repo.is_empty() => println!("   Adapters:   {repo}"),
        _ => println!("   Adapters:   (none — base model only)"),
    }
    println!("   Device:     {}", config.model.device);
    println!("   Listening:  {}:{}", config.gateway.host, config.gateway.port);

    kohai_gateway::start(config).await?;

    Ok(())
}
