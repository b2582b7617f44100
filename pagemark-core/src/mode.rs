//! Interaction modes and the input-routing policy derived from them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AnnotationError;
use crate::style::{highlight_color, BrushSettings, BrushStyle, Color};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationMode {
    /// Select and move objects.
    #[default]
    #[serde(alias = "none")]
    Select,
    Draw,
    Highlight,
    Text,
    Delete,
}

impl AnnotationMode {
    pub fn is_drawing(self) -> bool {
        matches!(self, AnnotationMode::Draw | AnnotationMode::Highlight)
    }

    pub fn label(self) -> &'static str {
        match self {
            AnnotationMode::Select => "select",
            AnnotationMode::Draw => "draw",
            AnnotationMode::Highlight => "highlight",
            AnnotationMode::Text => "text",
            AnnotationMode::Delete => "delete",
        }
    }
}

impl fmt::Display for AnnotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AnnotationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "select" | "none" | "move" => Ok(AnnotationMode::Select),
            "draw" => Ok(AnnotationMode::Draw),
            "highlight" => Ok(AnnotationMode::Highlight),
            "text" => Ok(AnnotationMode::Text),
            "delete" | "erase" => Ok(AnnotationMode::Delete),
            other => Err(format!("unknown annotation mode {other:?}")),
        }
    }
}

/// Annotation mode plus the overriding raw-text-selection flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeState {
    pub mode: AnnotationMode,
    pub raw_text_select: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerHandler {
    /// The surface ignores pointer input; the text layer gets it.
    PassThrough,
    DragSelect,
    Brush,
    PlaceText,
    RemoveOnClick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Default,
    Move,
    Crosshair,
    Text,
    Pointer,
}

impl Cursor {
    /// CSS cursor name, as terminals with pointer-shape support expect.
    pub fn css_name(self) -> &'static str {
        match self {
            Cursor::Default => "default",
            Cursor::Move => "move",
            Cursor::Crosshair => "crosshair",
            Cursor::Text => "text",
            Cursor::Pointer => "pointer",
        }
    }
}

/// Which of the annotation surface and the page's text layer sits on top and
/// receives pointer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerStack {
    pub canvas_pointer_events: bool,
    pub canvas_z: i32,
    pub text_layer_pointer_events: bool,
    pub text_layer_z: i32,
}

impl LayerStack {
    pub const ANNOTATING: LayerStack = LayerStack {
        canvas_pointer_events: true,
        canvas_z: 2,
        text_layer_pointer_events: false,
        text_layer_z: 1,
    };

    pub const TEXT_SELECTION: LayerStack = LayerStack {
        canvas_pointer_events: false,
        canvas_z: 2,
        text_layer_pointer_events: true,
        text_layer_z: 3,
    };

    pub fn canvas_on_top(&self) -> bool {
        self.canvas_pointer_events && self.canvas_z > self.text_layer_z
    }
}

/// Everything a surface needs to know to route input for the active mode.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionPolicy {
    pub drawing: bool,
    pub objects_selectable: bool,
    pub objects_evented: bool,
    pub handler: PointerHandler,
    pub default_cursor: Cursor,
    pub hover_cursor: Cursor,
    pub brush: Option<BrushStyle>,
    pub layers: LayerStack,
}

impl InteractionPolicy {
    pub fn resolve(state: ModeState, brush: &BrushSettings) -> Self {
        if state.raw_text_select {
            return Self {
                drawing: false,
                objects_selectable: false,
                objects_evented: false,
                handler: PointerHandler::PassThrough,
                default_cursor: Cursor::Default,
                hover_cursor: Cursor::Default,
                brush: None,
                layers: LayerStack::TEXT_SELECTION,
            };
        }

        let base = Self {
            drawing: false,
            objects_selectable: false,
            objects_evented: false,
            handler: PointerHandler::DragSelect,
            default_cursor: Cursor::Default,
            hover_cursor: Cursor::Default,
            brush: None,
            layers: LayerStack::ANNOTATING,
        };

        match state.mode {
            AnnotationMode::Select => Self {
                objects_selectable: true,
                objects_evented: true,
                hover_cursor: Cursor::Move,
                ..base
            },
            AnnotationMode::Draw => Self {
                drawing: true,
                handler: PointerHandler::Brush,
                default_cursor: Cursor::Crosshair,
                hover_cursor: Cursor::Crosshair,
                brush: Some(BrushStyle {
                    color: brush.color.clone(),
                    width: brush.thickness,
                }),
                ..base
            },
            AnnotationMode::Highlight => Self {
                drawing: true,
                handler: PointerHandler::Brush,
                default_cursor: Cursor::Crosshair,
                hover_cursor: Cursor::Crosshair,
                brush: Some(BrushStyle {
                    color: highlight_color(&brush.color),
                    width: brush.thickness,
                }),
                ..base
            },
            AnnotationMode::Text => Self {
                handler: PointerHandler::PlaceText,
                default_cursor: Cursor::Text,
                ..base
            },
            AnnotationMode::Delete => Self {
                objects_evented: true,
                handler: PointerHandler::RemoveOnClick,
                default_cursor: Cursor::Pointer,
                hover_cursor: Cursor::Pointer,
                ..base
            },
        }
    }
}

/// Owns the current [`ModeState`] and the user's brush settings.
#[derive(Debug, Clone, Default)]
pub struct ModeController {
    state: ModeState,
    brush: BrushSettings,
}

impl ModeController {
    pub fn new(brush: BrushSettings) -> Self {
        Self {
            state: ModeState::default(),
            brush,
        }
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    pub fn brush(&self) -> &BrushSettings {
        &self.brush
    }

    pub fn policy(&self) -> InteractionPolicy {
        InteractionPolicy::resolve(self.state, &self.brush)
    }

    /// Switches the annotation mode. Leaves raw text selection if it was on.
    /// Returns whether the effective state changed.
    pub fn set_mode(&mut self, mode: AnnotationMode) -> bool {
        let next = ModeState {
            mode,
            raw_text_select: false,
        };
        self.transition(next)
    }

    pub fn set_raw_text_select(&mut self, enabled: bool) -> bool {
        let next = ModeState {
            raw_text_select: enabled,
            ..self.state
        };
        self.transition(next)
    }

    pub fn toggle_raw_text_select(&mut self) -> bool {
        self.set_raw_text_select(!self.state.raw_text_select)
    }

    pub fn set_brush_color(&mut self, color: &str) -> Result<(), AnnotationError> {
        color.parse::<Color>()?;
        self.brush.color = color.trim().to_string();
        Ok(())
    }

    pub fn set_brush_thickness(&mut self, thickness: f64) {
        if thickness.is_finite() && thickness > 0.0 {
            self.brush.thickness = thickness;
        }
    }

    fn transition(&mut self, next: ModeState) -> bool {
        if next == self.state {
            return false;
        }
        debug!(from = ?self.state, to = ?next, "interaction mode transition");
        self.state = next;
        true
    }
}
