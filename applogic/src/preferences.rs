// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Preferences persisted on the device.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use ggvcommon::time::{Duration, TimeStamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::visibility::DisplayMode;

/// After dismissing the install prompt, it is not offered again for this long.
pub const INSTALL_PROMPT_COOLDOWN_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallPrompt {
    pub dismissed_at: Option<TimeStamp>,
    pub installed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub theme: Theme,
    pub install_prompt: InstallPrompt,
}

impl Preferences {
    /// Whether to offer installing the app.
    pub fn should_offer_install(&self, display_mode: DisplayMode, now: TimeStamp) -> bool {
        let prompt = &self.install_prompt;
        if prompt.installed || display_mode == DisplayMode::Standalone {
            return false;
        }
        match prompt.dismissed_at {
            Some(dismissed_at) => {
                now - dismissed_at >= Duration::days(INSTALL_PROMPT_COOLDOWN_DAYS)
            }
            None => true,
        }
    }
}

/// [`Preferences`] backed by a JSON file.
#[derive(Debug)]
pub struct PreferencesStore {
    path: PathBuf,
    preferences: Mutex<Preferences>,
}

impl PreferencesStore {
    /// Load the preferences at `path`. A missing or unreadable file yields
    /// the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let preferences = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
                warn!(path = %path.display(), %error, "corrupt preferences, using defaults");
                Preferences::default()
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Preferences::default(),
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to read preferences, using defaults");
                Preferences::default()
            }
        };
        Self {
            path,
            preferences: Mutex::new(preferences),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Preferences {
        self.preferences.lock().clone()
    }

    pub fn theme(&self) -> Theme {
        self.preferences.lock().theme
    }

    pub fn set_theme(&self, theme: Theme) -> anyhow::Result<()> {
        self.update(|preferences| preferences.theme = theme)
    }

    pub fn dismiss_install_prompt(&self, now: TimeStamp) -> anyhow::Result<()> {
        self.update(|preferences| preferences.install_prompt.dismissed_at = Some(now))
    }

    pub fn mark_installed(&self) -> anyhow::Result<()> {
        info!("app installed");
        self.update(|preferences| preferences.install_prompt.installed = true)
    }

    pub fn should_offer_install(&self, display_mode: DisplayMode, now: TimeStamp) -> bool {
        self.preferences
            .lock()
            .should_offer_install(display_mode, now)
    }

    fn update(&self, f: impl FnOnce(&mut Preferences)) -> anyhow::Result<()> {
        let mut preferences = self.preferences.lock();
        f(&mut preferences);
        save(&self.path, &preferences)
    }
}

/// Write atomically by replacing the file.
fn save(path: &Path, preferences: &Preferences) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    // Same directory as the target, so that persisting is a rename
    let mut file = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create a temporary file in {}", parent.display()))?;
    serde_json::to_writer_pretty(&mut file, preferences)?;
    file.flush()?;
    file.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("preferences.json");

        let store = PreferencesStore::load(&path);
        assert_eq!(store.get(), Preferences::default());
        store.set_theme(Theme::Dark).unwrap();
        let now = TimeStamp::now();
        store.dismiss_install_prompt(now).unwrap();

        let store = PreferencesStore::load(&path);
        assert_eq!(store.theme(), Theme::Dark);
        assert_eq!(store.get().install_prompt.dismissed_at, Some(now));
    }

    #[test]
    fn saving_leaves_only_the_preferences_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");
        fs::write(&path, b"{}").unwrap();

        let store = PreferencesStore::load(&path);
        store.set_theme(Theme::Light).unwrap();
        store.mark_installed().unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, ["preferences.json"]);
        let saved: Preferences = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved, store.get());
    }

    #[test]
    fn corrupt_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.json");
        fs::write(&path, b"{ \"theme\": ").unwrap();

        let store = PreferencesStore::load(&path);
        assert_eq!(store.get(), Preferences::default());

        // Unknown fields and partial documents are fine
        fs::write(&path, br#"{ "theme": "light", "font": "large" }"#).unwrap();
        let store = PreferencesStore::load(&path);
        assert_eq!(store.theme(), Theme::Light);
        assert!(!store.get().install_prompt.installed);
    }

    #[test]
    fn install_prompt_rules() {
        let now = TimeStamp::now();
        let mut preferences = Preferences::default();
        assert!(preferences.should_offer_install(DisplayMode::Browser, now));
        assert!(!preferences.should_offer_install(DisplayMode::Standalone, now));

        preferences.install_prompt.dismissed_at = Some(now - Duration::days(6));
        assert!(!preferences.should_offer_install(DisplayMode::Browser, now));
        preferences.install_prompt.dismissed_at = Some(now - Duration::days(7));
        assert!(preferences.should_offer_install(DisplayMode::Browser, now));

        preferences.install_prompt.installed = true;
        assert!(!preferences.should_offer_install(DisplayMode::Browser, now));
    }

    #[test]
    fn mark_installed_stops_offering() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load(dir.path().join("preferences.json"));
        store.mark_installed().unwrap();
        assert!(!store.should_offer_install(DisplayMode::Browser, TimeStamp::now()));
    }
}
