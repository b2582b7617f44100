//! Colors, palettes and brush settings shared by the mode controller and the
//! surfaces.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::AnnotationError;

pub const PASTEL_HEX: [&str; 5] = ["#FFB3BA", "#FFDFBA", "#FFFFBA", "#BAE1FF", "#BFFCC6"];

pub const DRAW_HEX: [&str; 9] = [
    "#FF0000", "#FFA500", "#FFFF00", "#008000", "#0000FF", "#4B0082", "#EE82EE", "#000000",
    "#FFFFFF",
];

pub const DEFAULT_HIGHLIGHT: &str = "rgba(255,255,0,0.3)";
pub const HIGHLIGHT_ALPHA: f32 = 0.3;

pub static PASTEL_PALETTE: Lazy<Vec<Color>> =
    Lazy::new(|| PASTEL_HEX.iter().filter_map(|hex| hex.parse().ok()).collect());

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 1.0 }
    }

    pub fn with_alpha(self, a: f32) -> Self {
        Self {
            a: a.clamp(0.0, 1.0),
            ..self
        }
    }

    pub fn is_opaque(&self) -> bool {
        self.a >= 1.0
    }

    fn same_rgb(&self, other: &Color) -> bool {
        self.r == other.r && self.g == other.g && self.b == other.b
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_opaque() {
            write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
        } else {
            write!(f, "rgba({},{},{},{})", self.r, self.g, self.b, self.a)
        }
    }
}

impl FromStr for Color {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let invalid = || AnnotationError::InvalidColor(raw.to_string());
        let lower = raw.to_ascii_lowercase();

        if let Some(hex) = lower.strip_prefix('#') {
            if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            let expanded: String = match hex.len() {
                3 => hex.chars().flat_map(|c| [c, c]).collect(),
                6 => hex.to_string(),
                _ => return Err(invalid()),
            };
            let channel = |i: usize| u8::from_str_radix(&expanded[i..i + 2], 16);
            return match (channel(0), channel(2), channel(4)) {
                (Ok(r), Ok(g), Ok(b)) => Ok(Color::rgb(r, g, b)),
                _ => Err(invalid()),
            };
        }

        let functional = lower
            .strip_prefix("rgba(")
            .or_else(|| lower.strip_prefix("rgb("))
            .and_then(|rest| rest.strip_suffix(')'));
        if let Some(body) = functional {
            let parts: Vec<&str> = body.split(',').map(str::trim).collect();
            if parts.len() != 3 && parts.len() != 4 {
                return Err(invalid());
            }
            let channel = |p: &str| p.parse::<u8>().map_err(|_| invalid());
            let r = channel(parts[0])?;
            let g = channel(parts[1])?;
            let b = channel(parts[2])?;
            let a = match parts.get(3) {
                Some(alpha) => alpha.parse::<f32>().map_err(|_| invalid())?,
                None => 1.0,
            };
            return Ok(Color::rgb(r, g, b).with_alpha(a));
        }

        match lower.as_str() {
            "black" => Ok(Color::rgb(0, 0, 0)),
            "white" => Ok(Color::rgb(255, 255, 255)),
            "red" => Ok(Color::rgb(255, 0, 0)),
            "yellow" => Ok(Color::rgb(255, 255, 0)),
            "transparent" => Ok(Color::rgb(0, 0, 0).with_alpha(0.0)),
            _ => Err(invalid()),
        }
    }
}

/// Brush color and thickness as chosen by the user. Survives mode changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrushSettings {
    pub color: String,
    pub thickness: f64,
}

impl Default for BrushSettings {
    fn default() -> Self {
        Self {
            color: DRAW_HEX[7].to_string(),
            thickness: 10.0,
        }
    }
}

/// Effective stroke style of the freehand brush.
#[derive(Debug, Clone, PartialEq)]
pub struct BrushStyle {
    pub color: String,
    pub width: f64,
}

/// Maps a chosen color to the translucent color used by the highlighter.
///
/// Pastel palette entries get a 30% alpha, values that are already `rgba(...)`
/// are kept, anything else falls back to translucent yellow.
pub fn highlight_color(chosen: &str) -> String {
    let trimmed = chosen.trim();
    if let Ok(color) = trimmed.parse::<Color>() {
        if color.is_opaque() && PASTEL_PALETTE.iter().any(|p| p.same_rgb(&color)) {
            return color.with_alpha(HIGHLIGHT_ALPHA).to_string();
        }
    }
    if trimmed.to_ascii_lowercase().starts_with("rgba") {
        return trimmed.to_string();
    }
    DEFAULT_HIGHLIGHT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_rgba() {
        assert_eq!("#ff0000".parse::<Color>().unwrap(), Color::rgb(255, 0, 0));
        assert_eq!("#0f0".parse::<Color>().unwrap(), Color::rgb(0, 255, 0));
        let c: Color = "rgba(255, 255, 0, 0.3)".parse().unwrap();
        assert_eq!((c.r, c.g, c.b), (255, 255, 0));
        assert!((c.a - 0.3).abs() < f32::EPSILON);
        assert_eq!("black".parse::<Color>().unwrap(), Color::BLACK);
        assert!("#12345".parse::<Color>().is_err());
        assert!("rgba(1,2)".parse::<Color>().is_err());
    }

    #[test]
    fn formats_back_to_canvas_strings() {
        assert_eq!(Color::rgb(255, 179, 186).to_string(), "#FFB3BA");
        assert_eq!(
            Color::rgb(255, 179, 186).with_alpha(0.3).to_string(),
            "rgba(255,179,186,0.3)"
        );
    }

    #[test]
    fn highlight_uses_translucent_pastel() {
        assert_eq!(highlight_color("#FFB3BA"), "rgba(255,179,186,0.3)");
        assert_eq!(highlight_color("#bae1ff"), "rgba(186,225,255,0.3)");
    }

    #[test]
    fn highlight_keeps_rgba_and_falls_back_to_yellow() {
        assert_eq!(highlight_color("rgba(10,20,30,0.5)"), "rgba(10,20,30,0.5)");
        assert_eq!(highlight_color("#FF0000"), DEFAULT_HIGHLIGHT);
        assert_eq!(highlight_color("not a color"), DEFAULT_HIGHLIGHT);
    }

    #[test]
    fn palettes_parse() {
        assert_eq!(PASTEL_PALETTE.len(), PASTEL_HEX.len());
        assert!(DRAW_HEX.iter().all(|hex| hex.parse::<Color>().is_ok()));
    }
}
