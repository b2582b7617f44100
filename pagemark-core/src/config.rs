use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::geometry::ZoomLimits;
use crate::pool::{FormFactor, Topology};
use crate::style::{BrushSettings, Color};

pub const CONFIG_FILE: &str = "config.toml";

/// User preferences read from `config.toml`. Every key is optional.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub topology: Topology,
    pub form_factor: FormFactor,
    pub brush_color: String,
    pub brush_thickness: f64,
    pub zoom_min: f64,
    pub zoom_max: f64,
    pub zoom_step: f64,
    pub device_pixel_ratio: f64,
    /// Vertical gap between pages in continuous view, in cells.
    pub page_gap: f64,
    pub server_url: Option<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "http_timeout_ms")]
    pub http_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        let brush = BrushSettings::default();
        let zoom = ZoomLimits::default();
        Self {
            topology: Topology::default(),
            form_factor: FormFactor::default(),
            brush_color: brush.color,
            brush_thickness: brush.thickness,
            zoom_min: zoom.min,
            zoom_max: zoom.max,
            zoom_step: zoom.step,
            device_pixel_ratio: 1.0,
            page_gap: 1.0,
            server_url: None,
            http_timeout: Duration::from_millis(10_000),
        }
    }
}

impl ReaderConfig {
    pub fn path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join(CONFIG_FILE)
    }

    /// Reads `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::parse(&raw).with_context(|| format!("invalid config file {:?}", path))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.brush_color.parse::<Color>()?;
        Ok(config)
    }

    pub fn brush(&self) -> BrushSettings {
        let defaults = BrushSettings::default();
        BrushSettings {
            color: self.brush_color.clone(),
            thickness: if self.brush_thickness > 0.0 {
                self.brush_thickness
            } else {
                defaults.thickness
            },
        }
    }

    /// Zoom limits with nonsense values replaced by defaults.
    pub fn zoom_limits(&self) -> ZoomLimits {
        let defaults = ZoomLimits::default();
        let sane = self.zoom_min > 0.0 && self.zoom_min <= self.zoom_max;
        ZoomLimits {
            min: if sane { self.zoom_min } else { defaults.min },
            max: if sane { self.zoom_max } else { defaults.max },
            step: if self.zoom_step > 0.0 {
                self.zoom_step
            } else {
                defaults.step
            },
        }
    }

    pub fn effective_topology(&self) -> Topology {
        self.topology.effective(self.form_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ReaderConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, ReaderConfig::default());
        assert_eq!(config.brush().color, "#000000");
    }

    #[test]
    fn partial_file_overrides_keys() {
        let config = ReaderConfig::parse(
            r##"
topology = "single"
brush_color = "#FF0000"
zoom_max = 4.0
http_timeout_ms = 2500
"##,
        )
        .unwrap();
        assert_eq!(config.topology, Topology::Single);
        assert_eq!(config.brush().color, "#FF0000");
        assert_eq!(config.zoom_limits().max, 4.0);
        assert_eq!(config.zoom_limits().min, 0.5);
        assert_eq!(config.http_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn phone_form_factor_forces_single_page() {
        let config = ReaderConfig::parse("form_factor = \"phone\"").unwrap();
        assert_eq!(config.effective_topology(), Topology::Single);
    }

    #[test]
    fn invalid_values_are_rejected_or_sanitized() {
        assert!(ReaderConfig::parse("brush_color = \"mauve-ish\"").is_err());
        let config = ReaderConfig::parse("zoom_min = 5.0\nzoom_max = 1.0\nzoom_step = 0.0").unwrap();
        assert_eq!(config.zoom_limits(), ZoomLimits::default());
    }

    #[test]
    fn written_file_is_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "page_gap = 2.0\nserver_url = \"http://localhost:8000\"\n").unwrap();
        let config = ReaderConfig::load(&path).unwrap();
        assert_eq!(config.page_gap, 2.0);
        assert_eq!(config.server_url.as_deref(), Some("http://localhost:8000"));
    }
}
