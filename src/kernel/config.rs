// ── Kernel: Configuration Surface ───────────────────────────────────────────
//
// Loads `KernelConfig` from a JSON file and keeps the rule set hot:
// `RulesHandle` watches the file's mtime and swaps a fresh immutable
// snapshot into the rules engine when it changes.
//
// Failure policy: an invalid config at startup is fatal; a failed
// reload keeps the last valid snapshot and logs. The watcher can be
// disabled with BARTHO_EMBED_RELOAD=0 (tests/CI).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info};
use parking_lot::RwLock;

use crate::atoms::constants::ENV_EMBED_RELOAD;
use crate::atoms::error::{KernelError, KernelResult};
use crate::atoms::types::KernelConfig;
use crate::kernel::rules::RulesEngine;

/// How often the watcher polls the config file's mtime.
const WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Load and validate a kernel config file. Fatal on parse failure.
pub fn load_config(path: &Path) -> KernelResult<KernelConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| KernelError::Config(format!("cannot read {}: {e}", path.display())))?;
    let config: KernelConfig = serde_json::from_str(&raw)
        .map_err(|e| KernelError::Config(format!("invalid config {}: {e}", path.display())))?;
    info!("[config] Loaded {}", path.display());
    Ok(config)
}

/// Keeps the rules engine's snapshot in sync with the config file.
pub struct RulesHandle {
    engine: Arc<RulesEngine>,
    path: PathBuf,
    last_mtime: RwLock<Option<SystemTime>>,
}

impl RulesHandle {
    pub fn new(engine: Arc<RulesEngine>, path: PathBuf) -> Self {
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self {
            engine,
            path,
            last_mtime: RwLock::new(mtime),
        }
    }

    /// Re-read the config when its mtime moved. A reload that fails to
    /// parse keeps the last valid snapshot. Returns whether a new
    /// snapshot was installed.
    pub fn reload_if_changed(&self) -> bool {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return false;
        };
        let Ok(mtime) = meta.modified() else {
            return false;
        };
        if *self.last_mtime.read() == Some(mtime) {
            return false;
        }

        match load_config(&self.path) {
            Ok(config) => {
                self.engine.install(&config.memory_rules);
                *self.last_mtime.write() = Some(mtime);
                info!("[config] Reloaded rules from {}", self.path.display());
                true
            }
            Err(e) => {
                // Stale-but-valid beats fresh-but-broken.
                error!("[config] Reload failed, keeping previous rules: {e}");
                *self.last_mtime.write() = Some(mtime);
                false
            }
        }
    }

    /// Spawn the background watcher unless disabled via
    /// BARTHO_EMBED_RELOAD=0. Returns the task handle when spawned.
    pub fn spawn_watcher(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if std::env::var(ENV_EMBED_RELOAD).as_deref() == Ok("0") {
            debug!("[config] Watcher disabled via {ENV_EMBED_RELOAD}=0");
            return None;
        }

        let handle = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                handle.reload_if_changed();
            }
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{RuleSet, RuleSubject};
    use std::io::Write;

    fn subject(value: &str) -> RuleSubject {
        RuleSubject {
            kind: "chat".to_string(),
            key: "k".to_string(),
            value: value.to_string(),
            tags: vec![],
            speaker: None,
        }
    }

    fn write_file(path: &Path, content: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn test_load_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        write_file(&path, "{}");

        let config = load_config(&path).unwrap();
        assert_eq!(config.embedding.dim, 384);
        assert_eq!(config.retrieval.recency_half_life_hours, 168.0);
        assert!(!config.indexing.disallow_strong_only);
        assert!(!config.brake.engaged);
    }

    #[test]
    fn test_invalid_config_is_fatal_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        write_file(&path, "{not json");
        assert!(matches!(load_config(&path), Err(KernelError::Config(_))));
    }

    #[test]
    fn test_missing_config_is_fatal_at_startup() {
        let path = Path::new("/nonexistent/kernel.json");
        assert!(matches!(load_config(path), Err(KernelError::Config(_))));
    }

    #[test]
    fn test_reload_installs_new_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        write_file(&path, "{}");

        let engine = Arc::new(RulesEngine::new(&RuleSet::default()));
        let handle = RulesHandle::new(engine.clone(), path.clone());
        assert!(engine.evaluate(&subject("password here")).allow_store);

        // Push the mtime forward so the change is observable even on
        // coarse-granularity filesystems.
        std::thread::sleep(Duration::from_millis(20));
        write_file(
            &path,
            r#"{"memory_rules": {"never_store": [
                {"match": {"content": "password"}, "metadata": {}}
            ]}}"#,
        );
        let new_time = SystemTime::now() + Duration::from_secs(2);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(new_time).unwrap();

        assert!(handle.reload_if_changed());
        assert!(!engine.evaluate(&subject("password here")).allow_store);
    }

    #[test]
    fn test_failed_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        write_file(
            &path,
            r#"{"memory_rules": {"never_store": [
                {"match": {"content": "secret"}, "metadata": {}}
            ]}}"#,
        );

        let config = load_config(&path).unwrap();
        let engine = Arc::new(RulesEngine::new(&config.memory_rules));
        let handle = RulesHandle::new(engine.clone(), path.clone());

        write_file(&path, "{broken");
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(2)).unwrap();

        assert!(!handle.reload_if_changed());
        // The last valid rule set still applies.
        assert!(!engine.evaluate(&subject("a secret")).allow_store);
    }

    #[test]
    fn test_unchanged_file_does_not_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.json");
        write_file(&path, "{}");

        let engine = Arc::new(RulesEngine::default());
        let handle = RulesHandle::new(engine, path);
        assert!(!handle.reload_if_changed());
    }
}
