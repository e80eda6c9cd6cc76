use {anyhow::Result, clap::Subcommand, std::path::PathBuf};

use chatrelay_config::RelayConfig;

#[derive(Subcommand)]
pub enum DbAction {
    /// Run all pending database migrations.
    Migrate,
    /// Delete the job database file (and its WAL/SHM companions).
    Reset,
}

pub async fn handle_db(action: DbAction, config: &RelayConfig) -> Result<()> {
    let url = chatrelay_config::resolve_database_url(config);
    match action {
        DbAction::Migrate => {
            let pool =
                chatrelay_dispatch::store_sqlite::connect(&url, config.database.max_connections)
                    .await?;
            chatrelay_dispatch::run_migrations(&pool).await?;
            println!("Migrations applied to {url}");
            Ok(())
        },
        DbAction::Reset => reset(&url),
    }
}

fn reset(url: &str) -> Result<()> {
    let Some(path) = sqlite_file(url) else {
        anyhow::bail!("{url} is not a file-backed sqlite database");
    };

    let mut deleted = false;
    for suffix in ["", "-wal", "-shm"] {
        let candidate = PathBuf::from(format!("{}{suffix}", path.display()));
        if candidate.exists() {
            std::fs::remove_file(&candidate)?;
            println!("Deleted: {}", candidate.display());
            deleted = true;
        }
    }

    if deleted {
        println!("Job database deleted. It is recreated on the next run.");
    } else {
        println!("No database files found.");
    }
    Ok(())
}

/// File path behind a `sqlite:` URL, ignoring query parameters.
fn sqlite_file(url: &str) -> Option<PathBuf> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}
