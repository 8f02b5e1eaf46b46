//! Reading and writing `config.toml` without losing what users wrote by hand.
//!
//! Saving re-serializes the config and overlays it onto the document already
//! on disk, so comments, key order and value decorations survive.

use std::path::Path;

use log::{debug, error, warn};
use toml_edit::{DocumentMut, Item, Table};

use crate::config::{sanitize_config, EngineConfig};

/// Replaces `target[key]`, keeping the old value's surrounding whitespace and
/// trailing comment.
fn replace_keeping_decor(target: &mut Table, key: &str, replacement: Item) {
    let decor = target
        .get(key)
        .and_then(Item::as_value)
        .map(|value| value.decor().clone());
    target[key] = replacement;
    if let (Some(decor), Some(value)) = (decor, target[key].as_value_mut()) {
        *value.decor_mut() = decor;
    }
}

/// Writes every key of `update` into `target`, recursing into sub-tables.
/// Plain keys that `update` no longer has are dropped.
fn overlay_table(target: &mut Table, update: &Table) {
    for (key, item) in update.iter() {
        let Item::Table(update_table) = item else {
            replace_keeping_decor(target, key, item.clone());
            continue;
        };
        if !target.get(key).is_some_and(Item::is_table) {
            target.insert(key, Item::Table(Table::new()));
        }
        if let Some(target_table) = target.get_mut(key).and_then(Item::as_table_mut) {
            overlay_table(target_table, update_table);
        }
    }

    let removed: Vec<String> = target
        .iter()
        .filter(|(key, item)| !item.is_table() && !update.contains_key(key))
        .map(|(key, _)| key.to_string())
        .collect();
    for key in removed {
        target.remove(&key);
    }
}

/// TOML text for `config`, laid over `existing` when there is one.
pub fn render_config(existing: Option<&str>, config: &EngineConfig) -> Result<String, String> {
    let fresh = toml::to_string(config).map_err(|err| format!("serialize: {}", err))?;
    let Some(existing) = existing else {
        return Ok(fresh);
    };

    let update = fresh
        .parse::<DocumentMut>()
        .map_err(|err| format!("reparse serialized config: {}", err))?;
    let mut document = existing
        .parse::<DocumentMut>()
        .map_err(|err| format!("parse existing config: {}", err))?;
    overlay_table(document.as_table_mut(), update.as_table());
    Ok(document.to_string())
}

pub fn persist_config_file(config: &EngineConfig, path: &Path) {
    let existing = std::fs::read_to_string(path).ok();
    let text = match render_config(existing.as_deref(), config) {
        Ok(text) => text,
        Err(err) if existing.is_some() => {
            warn!(
                "Config: could not keep the layout of {} ({}), rewriting it",
                path.display(),
                err
            );
            match render_config(None, config) {
                Ok(text) => text,
                Err(err) => {
                    error!("Config: {}", err);
                    return;
                }
            }
        }
        Err(err) => {
            error!("Config: {}", err);
            return;
        }
    };

    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            error!("Config: cannot create {}: {}", parent.display(), err);
            return;
        }
    }
    if let Err(err) = std::fs::write(path, text) {
        error!("Config: cannot write {}: {}", path.display(), err);
    }
}

pub fn load_config_file(path: &Path) -> EngineConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("Config: {} not found, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            warn!("Config: cannot read {}: {}; using defaults", path.display(), err);
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&text) {
        Ok(config) => sanitize_config(config),
        Err(err) => {
            warn!("Config: cannot parse {}: {}; using defaults", path.display(), err);
            EngineConfig::default()
        }
    }
}
