use anyhow::Result;
use std::path::Path;

use claimfleet::config::Config;

/// Load a TOML config, apply environment overrides and validate it
pub fn check_config(path: &Path) -> Result<()> {
    let config = Config::load(Some(path))?;
    config.validate()?;

    println!("Config OK: {}", path.display());
    println!("================================");
    println!(
        "  Concurrency:     {} total, {} per account",
        config.scheduler.max_concurrent, config.scheduler.max_per_account
    );
    println!("  Target gap:      {}s", config.scheduler.min_gap_secs);
    println!(
        "  Breaker:         {} failures, {}s cooldown",
        config.breaker.failure_threshold, config.breaker.cooldown_secs
    );
    println!("  Retry budget:    {}", config.recovery.max_retries);
    println!(
        "  Session file:    {} ({} backups)",
        config.storage.session_path.display(),
        config.storage.backup_count
    );
    println!("  Heartbeat file:  {}", config.storage.heartbeat_path.display());
    println!("  Logging:         {} / {}", config.logging.level, config.logging.format);
    Ok(())
}
