//! Store administration commands: list and delete stores, forget documents.

use anyhow::{bail, Result};
use tracing::info;

use wikirag_core::models::StoreReference;

use crate::config::{Config, Credential};
use crate::gateway::{self, RemoteStoreGateway};
use crate::mapping_store::{self, MappingStore};
use crate::prompt;
use crate::query::configured_store;

fn connect(config: &Config) -> Result<RemoteStoreGateway> {
    let credential = Credential::from_env(&config.api.api_key_env)?;
    gateway::connect(config, credential)
}

pub async fn run_store_list(config: &Config) -> Result<()> {
    let gateway = connect(config)?;
    let table = mapping_store::load(&config.corpus.mapping_file)?;
    let current = configured_store(config, &table);
    let stores = gateway.list_stores().await?;

    if stores.is_empty() {
        println!("No stores.");
        return Ok(());
    }

    println!(
        "{:<2}{:<56} {:<32} {:>9} {:>12}",
        "", "STORE", "DISPLAY NAME", "DOCUMENTS", "BYTES"
    );
    for store in &stores {
        let marker = match &current {
            Some(c) if c.name == store.name => "*",
            _ => "",
        };
        println!(
            "{:<2}{:<56} {:<32} {:>9} {:>12}",
            marker,
            store.name,
            store.display_name.as_deref().unwrap_or("-"),
            store
                .active_documents
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
            store
                .size_bytes
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

/// Delete a store and every document in it. When the store is the one the
/// mapping table is bound to, the table is cleared as well.
pub async fn run_store_delete(config: &Config, name: Option<String>, yes: bool) -> Result<()> {
    let mut mapping = MappingStore::open(&config.corpus.mapping_file)?;
    let store = match name {
        Some(name) => StoreReference::reused(name),
        None => match configured_store(config, mapping.table()) {
            Some(store) => store,
            None => bail!("No store given and none configured."),
        },
    };

    if !yes {
        let question = format!(
            "This permanently deletes {} and all its documents. Type DELETE to confirm:",
            store
        );
        if !prompt::confirm(&question, &["DELETE"])? {
            println!("Aborted.");
            return Ok(());
        }
    }

    let gateway = connect(config)?;
    gateway.delete_store(&store).await?;
    info!(store = %store, "deleted store");

    if mapping.table().store() == Some(store.as_str()) {
        mapping.clear()?;
        println!("cleared {}", mapping.path().display());
    }
    println!("deleted {}", store);
    Ok(())
}

/// Delete one local document's remote copy and drop its mapping record.
pub async fn run_forget(config: &Config, local_name: &str) -> Result<()> {
    let mut mapping = MappingStore::open(&config.corpus.mapping_file)?;
    let Some(record) = mapping.get(local_name).cloned() else {
        bail!(
            "'{}' is not tracked in {}",
            local_name,
            mapping.path().display()
        );
    };

    if let Some(handle) = &record.remote_handle {
        let Some(store) = configured_store(config, mapping.table()) else {
            bail!("'{}' has a remote document but no store is configured", local_name);
        };
        connect(config)?.delete(&store, handle).await?;
        println!("deleted {}", handle);
    }

    mapping.remove(local_name)?;
    println!("forgot {} ({})", record.local_name, record.safe_id);
    Ok(())
}
