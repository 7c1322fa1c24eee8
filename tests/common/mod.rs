//! Shared fixtures for integration tests.
#![allow(dead_code)]

use pulsewarden::config::PulsewardenConfig;
use pulsewarden::notify::NotificationDispatcher;
use pulsewarden::Services;
use tempfile::TempDir;

/// Config pointing at a fresh database inside `dir`.
pub fn config_in(dir: &TempDir) -> PulsewardenConfig {
    let mut config = PulsewardenConfig::default();
    config.storage.database_path = dir
        .path()
        .join("pulsewarden.db")
        .to_string_lossy()
        .into_owned();
    config
}

pub fn services() -> (TempDir, Services) {
    services_with(NotificationDispatcher::disabled())
}

pub fn services_with(notifier: NotificationDispatcher) -> (TempDir, Services) {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    let services = Services::open(&config, notifier).unwrap();
    (dir, services)
}
