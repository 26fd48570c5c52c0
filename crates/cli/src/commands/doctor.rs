//! `kohai doctor` — Diagnose configuration and environment.

use kohai_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Kōhai Doctor — System Diagnostics");
    println!("====================================\n");

    let mut issues = 0;

    // Check config
    let config_path = AppConfig::config_dir().join("config.toml");
    let config = if config_path.exists() {
        match AppConfig::load() {
            Ok(config) => {
                println!("  ✅ Config file valid: {}", config_path.display());
                Some(config)
            }
            Err(e) => {
                println!("  ❌ Config file invalid: {e}");
                issues += 1;
                None
            }
        }
    } else {
        println!("  ⚠️  No config file at {} — defaults in effect", config_path.display());
        Some(AppConfig::default())
    };

    if let Some(config) = &config {
        println!("  ✅ Base model: {}", config.model.base_model);

        match &config.model.adapter_repo {
            Some(repo) if !repo.is_empty() => println!("  ✅ Adapter repo: {repo}"),
            _ => {
                println!("  ⚠️  No adapter repo configured — service will run the bare base model");
                issues += 1;
            }
        }

        match config.model.device.as_str() {
            "auto" | "cpu" | "cuda" => {
                println!("  ✅ Device preference: {}", config.model.device)
            }
            other => {
                println!("  ❌ Unknown device preference '{other}' (use auto, cpu, or cuda)");
                issues += 1;
            }
        }
    }

    // Check the hub cache — first request downloads several GB without it
    let cache_dir = std::env::var("HF_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|h| std::path::PathBuf::from(h).join(".cache").join("huggingface"))
                .unwrap_or_else(|_| std::path::PathBuf::from("/tmp"))
        });
    if cache_dir.exists() {
        println!("  ✅ Hub cache present: {}", cache_dir.display());
    } else {
        println!(
            "  ⚠️  No hub cache at {} — first start will download the model",
            cache_dir.display()
        );
        issues += 1;
    }

    // Summary
    println!();
    if issues == 0 {
        println!("All checks passed. Run `kohai serve` to start the service.");
    } else {
        println!("{issues} issue(s) found.");
    }

    Ok(())
}
