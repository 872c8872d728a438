use crate::capture::DEFAULT_FRAME_SIZE;
use crate::codec::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    #[serde(default = "default_live_endpoint")]
    pub live_endpoint: String,
    /// Input device name; empty means the host default.
    #[serde(default)]
    pub mic_device: String,
    /// Output device name; empty means the host default.
    #[serde(default)]
    pub output_device: String,
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,
    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_visualizer_fps")]
    pub visualizer_fps: u32,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_edit_model")]
    pub edit_model: String,
    #[serde(default = "default_video_model")]
    pub video_model: String,
    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,
    #[serde(default = "default_video_poll_secs")]
    pub video_poll_secs: u64,
    /// Seconds to wait for the live session to acknowledge setup.
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
            live_endpoint: default_live_endpoint(),
            mic_device: String::new(),
            output_device: String::new(),
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            frame_size: default_frame_size(),
            visualizer_fps: default_visualizer_fps(),
            image_model: default_image_model(),
            edit_model: default_edit_model(),
            video_model: default_video_model(),
            analysis_model: default_analysis_model(),
            video_poll_secs: default_video_poll_secs(),
            setup_timeout_secs: default_setup_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn mic_device(&self) -> Option<&str> {
        non_empty(&self.mic_device)
    }

    pub fn output_device(&self) -> Option<&str> {
        non_empty(&self.output_device)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn default_model() -> String {
    "gemini-2.5-flash-native-audio-preview-09-2025".into()
}
fn default_voice() -> String {
    "Zephyr".into()
}
fn default_system_instruction() -> String {
    "You are a friendly and witty creative assistant named Aura. You help users with creative ideas."
        .into()
}
fn default_live_endpoint() -> String {
    crate::gemini::protocol::LIVE_ENDPOINT.into()
}
fn default_input_sample_rate() -> u32 {
    INPUT_SAMPLE_RATE
}
fn default_output_sample_rate() -> u32 {
    OUTPUT_SAMPLE_RATE
}
fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}
fn default_visualizer_fps() -> u32 {
    30
}
fn default_image_model() -> String {
    "gemini-3-pro-image-preview".into()
}
fn default_edit_model() -> String {
    "gemini-2.5-flash-image".into()
}
fn default_video_model() -> String {
    "veo-3.1-fast-generate-preview".into()
}
fn default_analysis_model() -> String {
    "gemini-3-pro-preview".into()
}
fn default_video_poll_secs() -> u64 {
    5
}
fn default_setup_timeout_secs() -> u64 {
    15
}

pub fn data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("AuraLive"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".auralive"));
    }
    Err("Failed to resolve data directory".into())
}

pub fn settings_path() -> Result<PathBuf, String> {
    Ok(data_dir()?.join("settings.json"))
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(_) => Settings::default(),
    }
}

pub fn load_from(path: &Path) -> Settings {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("[settings] ignoring unreadable {}: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("aura-settings-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = scratch("partial");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{ "voice": "Puck", "frame_size": 2048 }"#).unwrap();

        let settings = load_from(&path);
        assert_eq!(settings.voice, "Puck");
        assert_eq!(settings.frame_size, 2048);
        assert_eq!(settings.model, default_model());
        assert_eq!(settings.video_poll_secs, 5);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn garbage_and_missing_files_give_defaults() {
        let path = scratch("garbage");
        assert_eq!(load_from(&path), Settings::default());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_from(&path), Settings::default());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn save_then_load() {
        let path = scratch("roundtrip");
        let mut settings = Settings::default();
        settings.mic_device = "USB Mic".into();
        save_to(&path, &settings).unwrap();
        let loaded = load_from(&path);
        assert_eq!(loaded.mic_device(), Some("USB Mic"));
        assert_eq!(loaded.output_device(), None);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
