use std::{path::PathBuf, sync::Arc};

use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tracklist::{
    media_file_discovery::{discover, Discovered},
    title_format::format_length,
    DbManager, Engine, EngineConfig, EngineEvent, LoftyProbe, PlaylistAddItem,
};

const CONFIG_FILE: &str = "config.toml";
const PLAYLISTS_DIR: &str = "playlists";
const STATE_DB: &str = "state.db";

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tracklist").join(CONFIG_FILE))
}

/// Blocks until every playlist has finished its background scan.
fn wait_for_scan(engine: &Engine, receiver: &mut tokio::sync::broadcast::Receiver<EngineEvent>) {
    let config = engine.config();
    if !config.scan.enabled || config.scan.metadata_on_play {
        return;
    }
    while engine.scan_in_progress(None) {
        match receiver.blocking_recv() {
            Ok(EngineEvent::ScanComplete) => {}
            Ok(EngineEvent::PersistenceFailed { path, error }) => {
                warn!("Could not access {}: {}", path.display(), error);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event receiver lagged by {} messages", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_summary(engine: &Engine) {
    let active = engine.active();
    for id in engine.playlist_ids() {
        let marker = if Some(id) == active { "*" } else { " " };
        println!(
            "{} {:>6}  {:<32} {:>5} entries  {:>9}",
            marker,
            id,
            engine.title(id).unwrap_or_default(),
            engine.entry_count(id),
            format_length(engine.total_length(id))
        );
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_file = config_path();
    let config = config_file
        .as_deref()
        .map(EngineConfig::load)
        .unwrap_or_default();

    let mut clog = colog::default_builder();
    clog.filter(None, config.general.log_level.to_level_filter());
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        let payload = panic_payload_to_string(panic_info.payload());
        log::error!("panic in thread '{}': {} ({:?})", thread_name, payload, panic_info.location());
    }));

    let engine = Engine::new(config.clone(), Arc::new(LoftyProbe))?;
    let mut receiver = engine.subscribe();

    let data_dir = config.data_dir();
    let mut db = None;
    if let Some(dir) = &data_dir {
        if let Err(err) = engine.load_playlists(&dir.join(PLAYLISTS_DIR)) {
            warn!("Failed to restore playlists from {}: {}", dir.display(), err);
        }
        match DbManager::new(&dir.join(STATE_DB)) {
            Ok(manager) => {
                if let Err(err) = engine.load_state(&manager) {
                    warn!("Failed to restore session state: {}", err);
                }
                db = Some(manager);
            }
            Err(err) => warn!("Failed to open state database: {}", err),
        }
    } else {
        warn!("No data directory available; playlists will not be saved");
    }

    let inputs: Vec<String> = std::env::args().skip(1).collect();
    let discovered = discover(&inputs);
    if !discovered.is_empty() {
        let mut tracks = Vec::new();
        for found in discovered {
            match found {
                Discovered::Track(filename) => tracks.push(PlaylistAddItem::new(filename)),
                Discovered::Playlist(path) => {
                    let target = engine.new_playlist();
                    match engine.import_playlist(target, &path) {
                        Ok(count) => info!("Imported {} entries from {}", count, path.display()),
                        Err(err) => warn!("Failed to import {}: {}", path.display(), err),
                    }
                }
            }
        }
        if !tracks.is_empty() {
            let target = engine.blank_playlist();
            let added = engine.insert_entries(target, None, tracks);
            engine.set_active(target);
            info!("Added {} entries", added);
        }
    }

    wait_for_scan(&engine, &mut receiver);
    print_summary(&engine);

    if let Some(dir) = &data_dir {
        if let Err(err) = engine.save_playlists(&dir.join(PLAYLISTS_DIR)) {
            warn!("Failed to save playlists: {}", err);
        }
        if let Some(manager) = db.as_mut() {
            if let Err(err) = engine.save_state(manager) {
                warn!("Failed to save session state: {}", err);
            }
        }
    }
    if let Some(path) = &config_file {
        engine.config().save(path);
    }

    engine.shutdown();
    Ok(())
}
