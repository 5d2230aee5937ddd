//! Backend file watcher.
//!
//! Watches the config document's directory and folds external edits back
//! into the store through the normal `set` path, so reloaded keys get real
//! versions and subscribers see ordinary change events. Writes made by the
//! store's own backend also raise events; the diff against the current
//! snapshot makes those reloads no-ops.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::backend::FileBackend;
use crate::error::{io_err, StoreError};
use crate::store::StoreHandle;

/// Events for the same file inside this window collapse into one reload.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Watch `path` and reload it into `store` on change, until shutdown.
pub async fn watch_config_file(
    path: PathBuf,
    store: StoreHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), StoreError> {
    let Some(dir) = path.parent().map(Path::to_path_buf) else {
        return Err(io_err(
            &path,
            std::io::Error::other("config document has no parent directory"),
        ));
    };
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut _watcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    // Watch the directory, not the file: atomic tmp + rename replaces the
    // inode, which a file-level watch would lose track of.
    _watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    let file_name = path.file_name().map(|name| name.to_os_string());
    let mut last_reload: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "config watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                let touches_document = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if !touches_document {
                    continue;
                }
                if !should_reload(&mut last_reload, Instant::now(), DEBOUNCE_WINDOW) {
                    continue;
                }

                match reload_file(&path, &store).await {
                    Ok(applied) if applied > 0 => {
                        tracing::info!(path = %path.display(), applied, "config document reloaded");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "config reload failed");
                    }
                }
            }
        }
    }

    Ok(())
}

/// Fold the document at `path` into the store; returns how many keys were
/// actually written. Keys absent from the file keep their current value;
/// the store has no delete operation.
pub async fn reload_file(path: &Path, store: &StoreHandle) -> Result<usize, StoreError> {
    if !path.exists() {
        return Ok(0);
    }
    let document = FileBackend::read_document(path)?;
    let current = store.snapshot().await?;

    let mut applied = 0usize;
    for (key, value) in document.entries {
        if current.get(&key) == Some(&value) {
            continue;
        }
        store.set(key, value).await?;
        applied += 1;
    }
    Ok(applied)
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_))
}

fn should_reload(last: &mut Option<Instant>, now: Instant, threshold: Duration) -> bool {
    match last {
        Some(seen_at) if now.duration_since(*seen_at) < threshold => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConfigStore;
    use foreman_core::types::ConfigVersion;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::advance;

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn debounce_coalesces_rapid_events() {
        let threshold = Duration::from_millis(100);
        let mut last = None;
        let mut reloads = 0usize;

        for _ in 0..5 {
            if should_reload(&mut last, Instant::now(), threshold) {
                reloads += 1;
            }
            advance(Duration::from_millis(10)).await;
        }
        assert_eq!(reloads, 1, "rapid saves should collapse to one reload");

        advance(Duration::from_millis(150)).await;
        assert!(
            should_reload(&mut last, Instant::now(), threshold),
            "a later event outside the window reloads again"
        );
    }

    #[tokio::test]
    async fn reload_applies_only_changed_keys() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("config.json");
        let (store, _join) = ConfigStore::spawn(8, None).expect("spawn");

        store.set("keep", json!("same")).await.expect("set");
        store.set("change", json!("old")).await.expect("set");

        std::fs::write(
            &path,
            r#"{"version": 0, "entries": {"keep": "same", "change": "new", "added": 1}}"#,
        )
        .expect("write");

        let applied = reload_file(&path, &store).await.expect("reload");
        assert_eq!(applied, 2, "only changed and added keys are written");
        assert_eq!(store.get("change").await.expect("get"), json!("new"));
        assert_eq!(store.get("added").await.expect("get"), json!(1));

        // Unchanged key kept its version: exactly two commits happened.
        let snapshot = store.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.version, ConfigVersion(4));
    }

    #[tokio::test]
    async fn reload_of_missing_file_is_a_noop() {
        let tmp = TempDir::new().expect("tmpdir");
        let (store, _join) = ConfigStore::spawn(8, None).expect("spawn");
        let applied = reload_file(&tmp.path().join("absent.json"), &store)
            .await
            .expect("reload");
        assert_eq!(applied, 0);
    }
}
