//! `rollcall uids`: inspect or edit the processed-message log.

use std::path::Path;

use anyhow::{Context, Result};
use rollcall_core::{FileUidStore, UidStore};

use super::load_config;

fn open_store(config_path: &Path) -> Result<FileUidStore> {
    let config = load_config(config_path)?;
    FileUidStore::open(&config.uid_log)
        .with_context(|| format!("failed to open uid log {}", config.uid_log.display()))
}

/// Prints every processed UID.
pub fn list(config_path: &Path) -> Result<()> {
    let store = open_store(config_path)?;
    if store.is_empty() {
        println!("No processed messages ({}).", store.path().display());
        return Ok(());
    }
    for uid in store.uids() {
        println!("{uid}");
    }
    Ok(())
}

/// Marks `uid` as processed so no run picks it up.
pub fn mark(config_path: &Path, uid: &str) -> Result<()> {
    let store = open_store(config_path)?;
    if store.contains(uid) {
        println!("UID {uid} is already marked as processed.");
        return Ok(());
    }
    store
        .record(uid)
        .with_context(|| format!("failed to record uid {uid}"))?;
    tracing::info!(uid, "message marked as processed");
    println!("UID {uid} marked as processed.");
    Ok(())
}
