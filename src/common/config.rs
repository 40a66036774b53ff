//! Allows configuration stuff to be read from settings.json
//!
//! The relay only has two knobs: the TCP port the signaling/status listener
//! binds (default 5000) and an optional substring hint used to pick the MIDI
//! output device.  Keeping them in a settings file means a unit in the field
//! can be repointed without rebuilding.
use json::JsonValue;
use std::{
    fs::File,
    io::{ErrorKind, Write},
};

pub struct Config {
    filename: String,
    settings: JsonValue,
}

impl Config {
    pub fn build() -> Config {
        Self::with_file("settings.json")
    }
    /// build against a specific settings file.  Used by tests so they don't
    /// stomp on a real settings.json in the working directory.
    pub fn with_file(filename: &str) -> Config {
        Config {
            filename: String::from(filename),
            settings: json::object! {},
        }
    }
    pub fn get_filename(&self) -> &str {
        &self.filename
    }
    pub fn load_from_file(&mut self) -> std::io::Result<bool> {
        match std::fs::read_to_string(&self.filename) {
            Ok(raw_data) => match json::parse(&raw_data) {
                Ok(parsed) => {
                    self.settings.clone_from(&parsed);
                    Ok(true)
                }
                Err(_) => {
                    // garbage in the file, run on defaults
                    Ok(false)
                }
            },
            Err(_) => {
                // call save settings to create a new file
                self.save_settings()
            }
        }
    }

    pub fn get_value<'a>(&'a self, key: &str, def_value: &'a str) -> &'a str {
        match self.settings[key].as_str() {
            None => def_value,
            Some(v) => v,
        }
    }

    pub fn get_u32_value(&self, key: &str, def_value: u32) -> u32 {
        match self.settings[key].as_u32() {
            None => def_value,
            Some(v) => v,
        }
    }

    pub fn set_value(&mut self, key: &str, val: &str) -> () {
        self.settings[key] = val.into();
    }

    pub fn save_settings(&self) -> std::io::Result<bool> {
        let file_open_result = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.filename.as_str());
        match file_open_result {
            Ok(mut f) => self.flush_to_file(&mut f),
            Err(error) => {
                // File open failed.  See if we need to create it
                match error.kind() {
                    ErrorKind::NotFound => {
                        let mut f = std::fs::File::create(self.filename.as_str())?;
                        self.flush_to_file(&mut f)
                    }
                    _ => Err(error),
                }
            }
        }
    }
    fn flush_to_file(&self, f: &mut File) -> std::io::Result<bool> {
        f.write_all(self.settings.pretty(2).as_bytes())?;
        f.sync_all()?;
        Ok(true)
    }
}

#[cfg(test)]
mod test_config {
    use super::*;

    #[test]
    fn config_build() {
        // You should be able to build a Config object
        let config = Config::build();
        assert_eq!(config.get_filename(), "settings.json");
    }

    #[test]
    fn get_value_default() {
        // Missing keys come back as the passed in default
        let config = Config::with_file("test_config_defaults.json");
        assert_eq!(config.get_value("midi_device", ""), "");
        assert_eq!(config.get_u32_value("port", 5000), 5000);
    }

    #[test]
    fn set_value() {
        // You should be able to set a value on a key
        let mut config = Config::with_file("test_config_set.json");
        config.set_value("midi_device", "loopMIDI");
        assert_eq!(config.get_value("midi_device", ""), "loopMIDI");
    }

    #[test]
    fn save_and_load() {
        // Settings should round trip through the file
        let fname = "test_config_roundtrip.json";
        let mut config = Config::with_file(fname);
        config.set_value("midi_device", "IAC");
        assert_eq!(config.save_settings().unwrap(), true);
        let mut loaded = Config::with_file(fname);
        assert_eq!(loaded.load_from_file().unwrap(), true);
        assert_eq!(loaded.get_value("midi_device", ""), "IAC");
        let _ = std::fs::remove_file(fname);
    }
}
