//! Project initialization — `foreman init`.

use anyhow::{Context, Result};
use std::path::Path;

use foreman::config::Config;
use foreman::foreman_config::ForemanToml;
use foreman::tracker::TrackerDb;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let foreman_dir = project_dir.join(".foreman");
    std::fs::create_dir_all(&foreman_dir).context("Failed to create .foreman directory")?;

    let config_path = foreman_dir.join("foreman.toml");
    let created_config = if config_path.exists() {
        false
    } else {
        ForemanToml::default().save(&config_path)?;
        true
    };

    let config = Config::new(project_dir.to_path_buf(), false)?;
    config.ensure_directories()?;
    let created_db = !config.tracker_db.exists();
    // Opening creates the schema.
    TrackerDb::new(&config.tracker_db)?;

    if created_config || created_db {
        println!(
            "Initialized foreman project at {}",
            config.foreman_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .foreman/");
        println!("  ├── foreman.toml  # Pool, limits, health and role settings");
        println!("  ├── tracker.db    # Local work-item tracker");
        println!("  ├── signals/      # Drop-box for control signals");
        println!("  ├── progress/     # Worker progress records");
        println!("  └── logs/         # Orchestrator and worker logs");
        println!();
        println!("Next steps:");
        println!("  1. Add work with `foreman item add \"<title>\"`");
        println!("  2. Set [worker] command in foreman.toml");
        println!("  3. Run `foreman run`");
    } else {
        println!(
            "Foreman project already initialized at {}",
            config.foreman_dir.display()
        );
        println!("Directory structure verified.");
    }

    Ok(())
}
