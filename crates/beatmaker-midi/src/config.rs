use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Directory below the platform config dir holding all settings files.
pub const CONFIG_DIR_NAME: &str = "Beatmaker";

pub const MIDI_OUTPUT_ASYNC_MODE: bool = false;
pub const MIDI_OUTPUT_MAX_QUEUE_SIZE: usize = 512;
pub const MIDI_INPUT_QUEUE_SIZE: usize = crate::queue::DEFAULT_CAPACITY;
/// Device I/O timeout in milliseconds.
pub const MIDI_DEVICE_IO_TIMEOUT: u64 = 250;

/// Scheduling priorities for the worker threads, see
/// [`crate::thread::apply_priority`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPriorities {
    pub sequencer: i32,
    pub midi_input: i32,
    pub midi_dispatch: i32,
    pub midi_output: i32,
    pub background: i32,
}

/// Persisted MIDI settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    /// Alias of the interface to connect automatically. Empty connects to
    /// the first interface found.
    pub preferred_interface: String,
    /// Send output from a dedicated thread instead of the caller.
    pub output_async: bool,
    pub output_queue_capacity: usize,
    pub input_queue_capacity: usize,
    pub io_timeout_ms: u64,
    pub dispatch_wait_ms: u64,
    pub rescan_interval_ms: u64,
    pub join_timeout_ms: u64,
    pub priorities: ThreadPriorities,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            preferred_interface: String::new(),
            output_async: MIDI_OUTPUT_ASYNC_MODE,
            output_queue_capacity: MIDI_OUTPUT_MAX_QUEUE_SIZE,
            input_queue_capacity: MIDI_INPUT_QUEUE_SIZE,
            io_timeout_ms: MIDI_DEVICE_IO_TIMEOUT,
            dispatch_wait_ms: 100,
            rescan_interval_ms: 1_000,
            join_timeout_ms: 500,
            priorities: ThreadPriorities::default(),
        }
    }
}

impl MidiSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn dispatch_wait(&self) -> Duration {
        Duration::from_millis(self.dispatch_wait_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Reads settings from `path`, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load_from(path: &Path) -> Self {
        load_json(path)
    }

    pub fn save_to(&self, path: &Path) {
        save_json(self, path);
    }
}

/// Reads a JSON settings file. A missing file yields the defaults, a
/// malformed one is logged and also yields the defaults.
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
            tracing::warn!(?err, path = %path.display(), "ignoring malformed settings file");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

/// Writes `value` as pretty JSON, creating parent directories. Failures are
/// logged.
pub fn save_json<T: Serialize>(value: &T, path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            if let Err(err) = fs::write(path, json) {
                tracing::warn!(?err, path = %path.display(), "failed to write settings file");
            }
        }
        Err(err) => tracing::warn!(?err, "failed to encode settings"),
    }
}

/// Location of a settings file inside the platform config directory.
pub fn settings_file(file_name: &str) -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push(CONFIG_DIR_NAME);
    base.push(file_name);
    Some(base)
}

pub fn settings_path() -> Option<PathBuf> {
    settings_file("midi.json")
}

/// Load settings from the platform config directory. Returns defaults if
/// loading fails.
pub fn load() -> MidiSettings {
    settings_path()
        .map(|path| MidiSettings::load_from(&path))
        .unwrap_or_default()
}

pub fn save(settings: &MidiSettings) {
    if let Some(path) = settings_path() {
        settings.save_to(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MidiSettings::load_from(&dir.path().join("midi.json"));
        assert_eq!(settings, MidiSettings::default());
        assert_eq!(settings.output_queue_capacity, 512);
        assert_eq!(settings.io_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("midi.json");
        let settings = MidiSettings {
            preferred_interface: "Yamaha MODX".into(),
            output_async: true,
            ..MidiSettings::default()
        };
        settings.save_to(&path);
        assert_eq!(MidiSettings::load_from(&path), settings);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("midi.json");
        fs::write(&path, r#"{ "preferred_interface": "Keys" }"#).unwrap();
        let settings = MidiSettings::load_from(&path);
        assert_eq!(settings.preferred_interface, "Keys");
        assert_eq!(settings.input_queue_capacity, 4096);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("midi.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(MidiSettings::load_from(&path), MidiSettings::default());
    }
}
