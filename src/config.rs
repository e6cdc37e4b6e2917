//! Command-line configuration.

use std::path::PathBuf;

use clap::Parser;
use log::warn;

use crate::camera::CameraSettings;

/// Conventional heightmap extension.
const MAP_EXTENSION: &str = "fdf";

/// Interactive wireframe viewer for `.fdf` heightmaps.
#[derive(Clone, Debug, Parser)]
#[command(version, about)]
pub struct Config {
    /// Heightmap to display.
    #[arg(value_name = "MAP")]
    pub map: PathBuf,

    /// Window width in pixels.
    #[arg(long, default_value_t = 640, value_parser = clap::value_parser!(u32).range(1..))]
    pub width: u32,

    /// Window height in pixels.
    #[arg(long, default_value_t = 480, value_parser = clap::value_parser!(u32).range(1..))]
    pub height: u32,

    /// Multiplier applied to elevations. Negative values point peaks toward the camera.
    #[arg(long, default_value_t = -0.2, allow_negative_numbers = true)]
    pub z_scale: f32,

    /// Degrees rotated per arrow key press.
    #[arg(long, default_value_t = 5.0)]
    pub rotate_step: f32,

    /// Scale applied per scroll notch.
    #[arg(long, default_value_t = 1.1)]
    pub zoom_factor: f32,

    /// Directory holding the compiled SPIR-V shaders.
    #[arg(long, default_value = "assets/shaders")]
    pub shader_dir: PathBuf,

    /// Disable Vulkan validation layers in debug builds.
    #[arg(long)]
    pub no_validation: bool,
}

impl Config {
    /// Parses the command line, warning about unconventional map names.
    pub fn from_args() -> Self {
        let config = Self::parse();
        if config.map.extension().and_then(|e| e.to_str()) != Some(MAP_EXTENSION) {
            warn!(
                "{} does not have the .{} extension.",
                config.map.display(),
                MAP_EXTENSION
            );
        }
        config
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            aspect: self.width as f32 / self.height as f32,
            rotate_step: self.rotate_step,
            zoom_factor: self.zoom_factor,
        }
    }

    pub fn validation(&self) -> bool {
        cfg!(debug_assertions) && !self.no_validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["heightmap-viewer", "maps/42.fdf"]).unwrap();
        assert_eq!(config.map, PathBuf::from("maps/42.fdf"));
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.z_scale, -0.2);
        assert_eq!(config.shader_dir, PathBuf::from("assets/shaders"));
        assert!(!config.no_validation);

        let settings = config.camera_settings();
        assert_eq!(settings.aspect, 640.0 / 480.0);
        assert_eq!(settings.rotate_step, 5.0);
        assert_eq!(settings.zoom_factor, 1.1);
    }

    #[test]
    fn overrides() {
        let config = Config::try_parse_from([
            "heightmap-viewer",
            "--width",
            "800",
            "--height",
            "800",
            "--zoom-factor",
            "1.5",
            "--no-validation",
            "mars.fdf",
        ])
        .unwrap();
        assert_eq!(config.camera_settings().aspect, 1.0);
        assert_eq!(config.zoom_factor, 1.5);
        assert!(!config.validation());
    }

    #[rstest]
    #[case("-0.5", -0.5)]
    #[case("0.3", 0.3)]
    #[case("-1", -1.0)]
    fn z_scale_accepts_either_sign(#[case] value: &str, #[case] expected: f32) {
        let config =
            Config::try_parse_from(["heightmap-viewer", "--z-scale", value, "a.fdf"]).unwrap();
        assert_eq!(config.z_scale, expected);
        assert_eq!(config.map, PathBuf::from("a.fdf"));
    }

    #[test]
    fn map_is_required() {
        assert!(Config::try_parse_from(["heightmap-viewer"]).is_err());
    }

    #[test]
    fn zero_sized_window_is_rejected() {
        assert!(Config::try_parse_from(["heightmap-viewer", "--width", "0", "a.fdf"]).is_err());
    }
}
