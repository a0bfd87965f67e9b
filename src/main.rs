use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use gridcache::collection::{import_directory, CollectionService, SqliteCollection};
use gridcache::layout::ViewportMetrics;
use gridcache::{EngineConfig, GalleryEngine};

/// Imports a directory and resolves the first page of thumbnails.
#[derive(Parser, Debug)]
#[command(name = "gridcache", version)]
struct Args {
    /// Directory to import.
    dir: PathBuf,

    /// Collection database. Defaults to the XDG data directory.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("gridcache=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = EngineConfig::load_default().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load engine config, using defaults");
        EngineConfig::default()
    });

    let collection = match &args.db {
        Some(path) => SqliteCollection::open(path)?,
        None => SqliteCollection::open_default()?,
    };
    let imported = import_directory(&args.dir, &collection).await?;
    info!(
        dir = ?args.dir,
        discovered = imported.discovered,
        inserted = imported.inserted,
        errors = imported.errors,
        "Import finished"
    );

    let engine = GalleryEngine::builder(Arc::new(collection) as Arc<dyn CollectionService>)
        .config(config)
        .build();
    engine.update_viewport(
        ViewportMetrics {
            scroll_top: 0.0,
            client_height: 800.0,
            client_width: 1200.0,
        },
        Some(4),
    );

    engine.init().await?;
    engine.settle().await;

    let entries = engine.cache_map();
    let thumbnails = entries.values().filter(|e| e.thumbnail.is_some()).count();
    info!(
        shown = engine.window().len(),
        total = engine.window().collection_total(),
        thumbnails,
        pending = engine.store().pending_ids().len(),
        memory_bytes = engine.store().memory_usage(),
        "Initial page resolved"
    );

    engine.dispose();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_take_dir_and_optional_db() {
        let args = Args::try_parse_from(["gridcache", "/photos", "--db", "/tmp/g.db"]).unwrap();
        assert_eq!(args.dir, PathBuf::from("/photos"));
        assert_eq!(args.db, Some(PathBuf::from("/tmp/g.db")));

        let args = Args::try_parse_from(["gridcache", "/photos"]).unwrap();
        assert!(args.db.is_none());
    }

    #[test]
    fn test_args_reject_missing_dir_and_extras() {
        assert!(Args::try_parse_from(["gridcache"]).is_err());
        assert!(Args::try_parse_from(["gridcache", "/a", "/b"]).is_err());
        assert!(Args::try_parse_from(["gridcache", "/a", "--db"]).is_err());
    }
}
