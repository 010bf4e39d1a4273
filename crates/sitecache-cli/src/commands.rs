use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sitecache_core::{
    CachedEntity, FileBackend, HttpRemote, ListFilter, LocalStore, PendingOperation, RemoteApi,
    Resolution, SessionOutcome, SyncEngine, SyncError, SyncEvent, SyncSession, SyncState,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;

pub type Engine = SyncEngine<HttpRemote>;

/// Open the cache and wire up the engine. Unless `offline`, the API host is
/// pinged once so the probe starts with a fresh reachability sample.
pub async fn open_engine(config: &Config, offline: bool) -> Result<Engine> {
    let cache_dir = config.cache_dir()?;
    let backend = FileBackend::new(&cache_dir)
        .with_context(|| format!("Failed to open cache directory {}", cache_dir.display()))?;
    let store = LocalStore::open(backend).context("Failed to load local store")?;

    let device_id = store.device_id().await;
    let mut remote = HttpRemote::new(config.api_url()?, device_id, config.sync.request_timeout())?;
    if let Some(ref token) = config.token {
        remote = remote.with_token(token);
    }

    let engine = SyncEngine::builder(store, Arc::new(remote))
        .config(config.sync.clone())
        .build();

    if !offline {
        engine.probe().set_link_up(true);
        let reachable = tokio::time::timeout(config.sync.probe_timeout(), engine.remote().ping())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        engine.probe().record_reachability(reachable);
        if !reachable {
            warn!("API host unreachable, working from cache");
        }
    }
    Ok(engine)
}

// ===== Output =====

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn state_label(state: SyncState) -> &'static str {
    match state {
        SyncState::Clean => "clean",
        SyncState::Pending => "pending",
        SyncState::Conflict => "CONFLICT",
    }
}

fn print_entity(entity: &CachedEntity) {
    let version = entity
        .server_version
        .map(|v| format!("v{}", v))
        .unwrap_or_else(|| "unsynced".to_string());
    let deleted = if entity.deleted { " (deleted)" } else { "" };
    println!(
        "{}/{} [{}] {}{}",
        entity.collection,
        entity.id,
        state_label(entity.sync_state),
        version,
        deleted
    );
    println!("  {}", entity.payload);
    if let Some(ref held) = entity.held_server {
        println!("  server v{}: {}", held.version, held.data);
    }
}

fn show_entity(entity: &CachedEntity, json: bool) -> Result<()> {
    if json {
        print_json(entity)
    } else {
        print_entity(entity);
        Ok(())
    }
}

fn print_operation(op: &PendingOperation) {
    println!("#{} {:?} {}/{}", op.op_id, op.kind, op.collection, op.target_id);
    println!("  {}", SyncError::exhausted(op));
}

fn print_session(session: &SyncSession) {
    let outcome = match session.outcome {
        SessionOutcome::Running => "running".to_string(),
        SessionOutcome::Completed => "completed".to_string(),
        SessionOutcome::Cancelled => "cancelled, connection lost".to_string(),
        SessionOutcome::Recovering(ref error) => format!("stopped early: {}", error),
    };
    println!(
        "Sync {}: {} sent, {} conflicts, {} failed",
        outcome, session.drained_count, session.conflict_count, session.failed_count
    );
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::EntityChanged {
            collection,
            id,
            sync_state,
        } => println!("changed  {}/{} [{}]", collection, id, state_label(*sync_state)),
        SyncEvent::EntityRemoved { collection, id } => println!("removed  {}/{}", collection, id),
        SyncEvent::IdReassigned {
            collection,
            client_id,
            id,
        } => println!("synced   {}/{} is now {}/{}", collection, client_id, collection, id),
        SyncEvent::ConflictDetected {
            collection, id, kind, ..
        } => println!("conflict {}/{} ({:?} lost to a server change)", collection, id, kind),
        SyncEvent::OperationFailed {
            op_id,
            collection,
            target_id,
            error,
            ..
        } => println!("failed   #{} {}/{}: {}", op_id, collection, target_id, error),
        SyncEvent::SessionCompleted(session) => print_session(session),
    }
}

fn parse_object(input: &str, what: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(input).with_context(|| format!("{} is not valid JSON", what))?;
    if !value.is_object() {
        anyhow::bail!("{} must be a JSON object", what);
    }
    Ok(value)
}

// ===== Commands =====

pub async fn get(engine: &Engine, collection: &str, id: &str, json: bool) -> Result<()> {
    let entity = engine.gateway().read(collection, id).await?;
    show_entity(&entity, json)
}

pub async fn list(
    engine: &Engine,
    collection: &str,
    filters: Vec<(String, String)>,
    json: bool,
) -> Result<()> {
    let filter: ListFilter = filters.into_iter().collect();
    let entities = engine.gateway().list(collection, &filter).await?;
    if json {
        return print_json(&entities);
    }
    if entities.is_empty() {
        println!("No records in {}", collection);
    }
    for entity in &entities {
        print_entity(entity);
    }
    Ok(())
}

pub async fn create(engine: &Engine, collection: &str, data: &str, json: bool) -> Result<()> {
    let payload = parse_object(data, "Payload")?;
    let entity = engine.gateway().create(collection, payload).await?;
    show_entity(&entity, json)
}

pub async fn update(
    engine: &Engine,
    collection: &str,
    id: &str,
    patch: &str,
    json: bool,
) -> Result<()> {
    let patch = parse_object(patch, "Patch")?;
    let entity = engine.gateway().update(collection, id, patch).await?;
    show_entity(&entity, json)
}

pub async fn remove(engine: &Engine, collection: &str, id: &str) -> Result<()> {
    engine.gateway().remove(collection, id).await?;
    let pending = engine.gateway().pending_count().await;
    println!("Removed {}/{} ({} changes queued)", collection, id, pending);
    Ok(())
}

pub async fn sync(engine: &Engine, json: bool) -> Result<()> {
    let Some(session) = engine.manager().sync_now().await else {
        println!("Offline, nothing synced");
        return Ok(());
    };
    if json {
        return print_json(&session);
    }
    print_session(&session);
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    online: bool,
    device_id: String,
    pending: usize,
    failed: usize,
    conflicts: usize,
    /// RFC 3339
    last_sync_session_at: Option<String>,
}

pub async fn status(engine: &Engine, json: bool) -> Result<()> {
    let gateway = engine.gateway();
    let metadata = engine.store().metadata().await;
    let status = Status {
        online: engine.probe().is_online(),
        device_id: metadata.device_id,
        pending: gateway.pending_count().await,
        failed: gateway.failed_operations().await.len(),
        conflicts: gateway.conflicts().await.len(),
        last_sync_session_at: metadata.last_sync_session_at.map(|at| at.to_rfc3339()),
    };
    if json {
        return print_json(&status);
    }

    println!("Connection:  {}", if status.online { "online" } else { "offline" });
    println!("Device:      {}", status.device_id);
    println!("Queued:      {}", status.pending);
    println!("Failed:      {}", status.failed);
    println!("Conflicts:   {}", status.conflicts);
    println!(
        "Last sync:   {}",
        status.last_sync_session_at.as_deref().unwrap_or("never")
    );
    Ok(())
}

pub async fn failed(engine: &Engine, json: bool) -> Result<()> {
    let ops = engine.gateway().failed_operations().await;
    if json {
        return print_json(&ops);
    }
    if ops.is_empty() {
        println!("No failed operations");
    }
    for op in &ops {
        print_operation(op);
    }
    Ok(())
}

pub async fn retry(engine: &Engine, op_id: u64) -> Result<()> {
    engine.gateway().retry_failed(op_id).await?;
    println!("Operation #{} requeued", op_id);
    Ok(())
}

pub async fn discard(engine: &Engine, op_id: u64) -> Result<()> {
    engine.gateway().discard_failed(op_id).await?;
    println!("Operation #{} discarded", op_id);
    Ok(())
}

pub async fn resolve(
    engine: &Engine,
    collection: &str,
    id: &str,
    resolution: Resolution,
    json: bool,
) -> Result<()> {
    match engine
        .gateway()
        .resolve_conflict(collection, id, resolution)
        .await?
    {
        Some(entity) => show_entity(&entity, json),
        None => {
            println!("{}/{} resolved and removed", collection, id);
            Ok(())
        }
    }
}

pub async fn watch(engine: &Engine, json: bool) -> Result<()> {
    let mut events = engine.subscribe();
    let tasks = engine.spawn_background();
    info!("Watching for changes");
    eprintln!("Watching for changes, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if json => println!("{}", serde_json::to_string(&event)?),
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    tasks.shutdown();
    Ok(())
}

pub fn configure(mut config: Config, api_url: Option<String>, token: Option<String>) -> Result<()> {
    let changed = api_url.is_some() || token.is_some();
    if let Some(url) = api_url {
        config.api_base_url = Some(url);
    }
    if let Some(token) = token {
        config.token = Some(token);
    }
    if changed {
        config.save()?;
        println!("Saved {}", Config::config_path()?.display());
    }

    println!(
        "API URL: {}",
        config.api_base_url.as_deref().unwrap_or("(not set)")
    );
    println!(
        "Token:   {}",
        if config.token.is_some() { "set" } else { "(not set)" }
    );
    println!("Cache:   {}", config.cache_dir()?.display());
    Ok(())
}
