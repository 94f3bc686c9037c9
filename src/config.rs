use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

/// Flat parameter set read by the simulation core every frame. Only the
/// host adapter (window/keyboard handlers, settings file) mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sim_resolution: u32,
    pub dye_resolution: u32,
    pub capture_resolution: u32,
    pub density_dissipation: f32,
    pub velocity_dissipation: f32,
    pub pressure: f32,
    pub pressure_iterations: u32,
    pub curl: f32,
    pub splat_radius: f32,
    pub splat_force: f32,
    pub shading: bool,
    pub colorful: bool,
    pub color_update_speed: f32,
    pub paused: bool,
    pub back_color: [f32; 3],
    pub transparent: bool,
    pub bloom: bool,
    pub bloom_iterations: u32,
    pub bloom_resolution: u32,
    pub bloom_intensity: f32,
    pub bloom_threshold: f32,
    pub bloom_soft_knee: f32,
    pub sunrays: bool,
    pub sunrays_resolution: u32,
    pub sunrays_weight: f32,
    pub auto_splat: bool,
    pub bpm: f32,
    pub splat_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 1024,
            capture_resolution: 512,
            density_dissipation: 1.0,
            velocity_dissipation: 0.2,
            pressure: 0.8,
            pressure_iterations: 20,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            shading: true,
            colorful: true,
            color_update_speed: 10.0,
            paused: false,
            back_color: [0.0, 0.0, 0.0],
            transparent: false,
            bloom: true,
            bloom_iterations: 8,
            bloom_resolution: 256,
            bloom_intensity: 0.8,
            bloom_threshold: 0.6,
            bloom_soft_knee: 0.7,
            sunrays: true,
            sunrays_resolution: 196,
            sunrays_weight: 1.0,
            auto_splat: false,
            bpm: 120.0,
            splat_count: 10,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads the settings file when present, falling back to defaults.
    /// Always sanitized before use.
    pub fn load_or_default(path: &Path) -> Self {
        let mut config = if path.exists() {
            match Self::load_from_disk(path) {
                Ok(config) => {
                    log::info!("loaded settings from {}", path.display());
                    config
                }
                Err(err) => {
                    log::warn!("failed to load {}: {err}; using defaults", path.display());
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.sanitize();
        config
    }

    // Ranges mirror the control panel's slider bounds.
    pub fn sanitize(&mut self) {
        self.sim_resolution = self.sim_resolution.clamp(32, 1024);
        self.dye_resolution = self.dye_resolution.clamp(128, 2048);
        self.capture_resolution = self.capture_resolution.clamp(128, 2048);
        self.density_dissipation = self.density_dissipation.clamp(0.01, 5.0);
        self.velocity_dissipation = self.velocity_dissipation.clamp(0.0, 5.0);
        self.pressure = self.pressure.clamp(0.0, 0.99);
        self.pressure_iterations = self.pressure_iterations.clamp(0, 100);
        self.curl = self.curl.clamp(0.0, 50.0);
        self.splat_radius = self.splat_radius.clamp(0.01, 1.0);
        self.splat_force = self.splat_force.clamp(0.0, 20000.0);
        self.color_update_speed = self.color_update_speed.clamp(0.0, 100.0);
        for channel in &mut self.back_color {
            *channel = channel.clamp(0.0, 1.0);
        }
        self.bloom_iterations = self.bloom_iterations.clamp(1, 16);
        self.bloom_resolution = self.bloom_resolution.clamp(32, 1024);
        self.bloom_intensity = self.bloom_intensity.clamp(0.1, 2.0);
        self.bloom_threshold = self.bloom_threshold.clamp(0.0, 1.0);
        self.bloom_soft_knee = self.bloom_soft_knee.clamp(0.0, 1.0);
        self.sunrays_resolution = self.sunrays_resolution.clamp(32, 1024);
        self.sunrays_weight = self.sunrays_weight.clamp(0.3, 1.0);
        self.bpm = self.bpm.clamp(0.0, 240.0);
        self.splat_count = self.splat_count.clamp(0, 128);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_json_round_trip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let partial: Config = serde_json::from_str(r#"{"curl": 12.0}"#).unwrap();
        assert_eq!(partial.curl, 12.0);
        assert_eq!(partial.pressure_iterations, Config::default().pressure_iterations);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = Config {
            pressure: 7.0,
            curl: -3.0,
            sunrays_weight: 0.0,
            ..Config::default()
        };
        config.sanitize();
        assert_eq!(config.pressure, 0.99);
        assert_eq!(config.curl, 0.0);
        assert_eq!(config.sunrays_weight, 0.3);
    }
}
