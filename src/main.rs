//! RadixDB driver binary.
//! Usage: radixdb [CONFIG_PATH]

use anyhow::Result;
use radixdb::{Config, DataManager, ABSENT, DEFAULT_PAGE_SIZE};
use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match env::args().nth(1) {
        Some(path) => Config::from_path(&PathBuf::from(path))?,
        None => Config::default_config(),
    };

    let mut db = DataManager::<DEFAULT_PAGE_SIZE>::new(&config)?;

    // short smoke sequence over the driver surface
    let n = 1000i64;
    for i in 0..n {
        db.insert(i, i * 7)?;
    }
    for i in (0..n).step_by(3) {
        db.delete_value(i)?;
    }
    let live = (0..n).filter(|i| i % 3 != 0).count();
    let hit = db.get_value(1)?;
    let miss = db.get_value(0)?;
    let reduction = db.scan(1, 64)?;
    let valid = db.validate(live)?;
    tracing::info!(
        live,
        hit,
        miss = (miss == ABSENT),
        reduction,
        valid,
        cache_bytes = db.cache_size(),
        buffered_pages = db.buffer_len(),
        "smoke run complete"
    );

    db.destroy()?;
    Ok(())
}
