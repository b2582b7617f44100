//! Annotation objects and the snapshot formats they are persisted in.
//!
//! Field names follow the canvas JSON the annotations were historically
//! stored as (`type`, `left`, `strokeWidth`, `i-text`, ...). Anything this
//! crate does not model is kept in `extra` so objects survive a
//! load/capture cycle unchanged.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AnnotationError;
use crate::geometry::{distance_to_segment, Point, Rect};
use crate::style::BrushStyle;
use crate::PageNumber;

pub type ObjectId = Uuid;

const TEXT_WIDTH_FACTOR: f64 = 0.6;
const TEXT_LINE_HEIGHT: f64 = 1.16;

/// The object's `type` tag. Types this crate does not draw are kept verbatim
/// so they are written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObjectKind {
    /// Freehand stroke; highlights are strokes with a translucent color.
    Path,
    IText,
    Rect,
    Other(String),
}

impl ObjectKind {
    pub fn as_str(&self) -> &str {
        match self {
            ObjectKind::Path => "path",
            ObjectKind::IText => "i-text",
            ObjectKind::Rect => "rect",
            ObjectKind::Other(name) => name,
        }
    }
}

impl From<String> for ObjectKind {
    fn from(name: String) -> Self {
        match name.as_str() {
            "path" => ObjectKind::Path,
            "i-text" => ObjectKind::IText,
            "rect" => ObjectKind::Rect,
            _ => ObjectKind::Other(name),
        }
    }
}

impl From<ObjectKind> for String {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationObject {
    #[serde(default = "Uuid::new_v4")]
    pub id: ObjectId,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
    #[serde(default = "default_true")]
    pub selectable: bool,
    #[serde(default = "default_true")]
    pub evented: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AnnotationObject {
    fn blank(kind: ObjectKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            left: 0.0,
            top: 0.0,
            points: Vec::new(),
            width: None,
            height: None,
            stroke: None,
            stroke_width: None,
            fill: None,
            text: None,
            font_size: None,
            selectable: true,
            evented: true,
            extra: Map::new(),
        }
    }

    /// Freehand stroke through `points` (scene coordinates).
    pub fn stroke(points: Vec<Point>, style: &BrushStyle) -> Self {
        let mut object = Self::blank(ObjectKind::Path);
        object.stroke = Some(style.color.clone());
        object.stroke_width = Some(style.width);
        object.points = points;
        object.sync_origin();
        object
    }

    pub fn text(at: Point, content: impl Into<String>, font_size: f64, fill: &str) -> Self {
        let mut object = Self::blank(ObjectKind::IText);
        object.left = at.x;
        object.top = at.y;
        object.text = Some(content.into());
        object.font_size = Some(font_size);
        object.fill = Some(fill.to_string());
        object
    }

    pub fn rect(bounds: Rect, stroke: &str, stroke_width: f64) -> Self {
        let mut object = Self::blank(ObjectKind::Rect);
        object.left = bounds.left;
        object.top = bounds.top;
        object.width = Some(bounds.width);
        object.height = Some(bounds.height);
        object.stroke = Some(stroke.to_string());
        object.stroke_width = Some(stroke_width);
        object
    }

    /// Vertices of a stroke in scene coordinates.
    ///
    /// Canvas paths saved without `points` carry a `path` command array
    /// instead. Each command contributes its end point, shifted by how far the
    /// object moved from its `pathOffset`.
    pub fn vertices(&self) -> Cow<'_, [Point]> {
        if !self.points.is_empty() || self.kind != ObjectKind::Path {
            return Cow::Borrowed(&self.points);
        }
        let Some(Value::Array(commands)) = self.extra.get("path") else {
            return Cow::Borrowed(&self.points);
        };
        let (dx, dy) = self.path_shift();
        let vertices = commands
            .iter()
            .filter_map(|command| {
                let args: Vec<f64> = command
                    .as_array()?
                    .iter()
                    .skip(1)
                    .filter_map(Value::as_f64)
                    .collect();
                match args.as_slice() {
                    [.., x, y] => Some(Point::new(x + dx, y + dy)),
                    _ => None,
                }
            })
            .collect();
        Cow::Owned(vertices)
    }

    /// The canvas centers a path on `pathOffset`; its box includes the stroke.
    fn path_shift(&self) -> (f64, f64) {
        let offset = self.extra.get("pathOffset");
        let coord = |axis: &str| offset.and_then(|o| o.get(axis)).and_then(Value::as_f64);
        match (coord("x"), coord("y"), self.width, self.height) {
            (Some(ox), Some(oy), Some(width), Some(height)) => {
                let stroke = self.stroke_width.unwrap_or(1.0);
                (
                    self.left + (width + stroke) / 2.0 - ox,
                    self.top + (height + stroke) / 2.0 - oy,
                )
            }
            _ => (0.0, 0.0),
        }
    }

    fn sync_origin(&mut self) {
        if let Some(bounds) = Rect::from_points(&self.points) {
            self.left = bounds.left;
            self.top = bounds.top;
            self.width = Some(bounds.width);
            self.height = Some(bounds.height);
        }
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        self.left += dx;
        self.top += dy;
        for point in &mut self.points {
            *point = point.offset(dx, dy);
        }
    }

    pub fn bounds(&self) -> Rect {
        match self.kind {
            ObjectKind::Path => Rect::from_points(&self.vertices())
                .map(|r| r.inflate(self.stroke_width.unwrap_or(1.0) / 2.0))
                .unwrap_or(Rect {
                    left: self.left,
                    top: self.top,
                    width: self.width.unwrap_or(0.0),
                    height: self.height.unwrap_or(0.0),
                }),
            ObjectKind::IText => {
                let size = self.font_size.unwrap_or(16.0);
                let text = self.text.as_deref().unwrap_or("");
                let longest = text.lines().map(|l| l.chars().count()).max().unwrap_or(0);
                let lines = text.lines().count().max(1);
                Rect {
                    left: self.left,
                    top: self.top,
                    width: self
                        .width
                        .unwrap_or(longest.max(1) as f64 * size * TEXT_WIDTH_FACTOR),
                    height: self
                        .height
                        .unwrap_or(lines as f64 * size * TEXT_LINE_HEIGHT),
                }
            }
            ObjectKind::Rect | ObjectKind::Other(_) => Rect {
                left: self.left,
                top: self.top,
                width: self.width.unwrap_or(0.0),
                height: self.height.unwrap_or(0.0),
            },
        }
    }

    /// Whether a scene point lands on this object, with `tolerance` extra
    /// scene units of slack.
    pub fn hit_test(&self, point: Point, tolerance: f64) -> bool {
        match self.kind {
            ObjectKind::Path => {
                let reach = self.stroke_width.unwrap_or(1.0) / 2.0 + tolerance;
                match &*self.vertices() {
                    [] => false,
                    [only] => only.distance(point) <= reach,
                    vertices => vertices
                        .windows(2)
                        .any(|seg| distance_to_segment(point, seg[0], seg[1]) <= reach),
                }
            }
            _ => self.bounds().inflate(tolerance).contains(point),
        }
    }

    /// Copy with a fresh identity, shifted by `(dx, dy)`.
    pub fn duplicate(&self, dx: f64, dy: f64) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        copy.translate(dx, dy);
        copy
    }
}

fn default_zoom() -> f64 {
    1.0
}

/// One page's objects in zoom-independent coordinates, plus the zoom that was
/// live when it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    #[serde(default)]
    pub objects: Vec<AnnotationObject>,
    #[serde(default = "default_zoom", alias = "__viewport")]
    pub captured_zoom: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PageSnapshot {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            captured_zoom: 1.0,
            extra: Map::new(),
        }
    }
}

impl PageSnapshot {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Every page's snapshot for one document, keyed by 1-based page number.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentAnnotations {
    #[serde(default)]
    pub pages: BTreeMap<PageNumber, PageSnapshot>,
}

impl DocumentAnnotations {
    pub fn page(&self, page: PageNumber) -> Option<&PageSnapshot> {
        self.pages.get(&page)
    }

    pub fn set_page(&mut self, page: PageNumber, snapshot: PageSnapshot) {
        self.pages.insert(page, snapshot);
    }

    pub fn object_count(&self) -> usize {
        self.pages.values().map(|p| p.objects.len()).sum()
    }

    /// Parses a user-supplied import file.
    ///
    /// A top-level object without a `pages` map is taken to be the pages map
    /// itself. Nothing is applied unless the whole file parses.
    pub fn from_import(text: &str) -> Result<Self, AnnotationError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| AnnotationError::malformed(format!("invalid JSON: {err}")))?;
        let Value::Object(mut root) = value else {
            return Err(AnnotationError::malformed("expected a JSON object"));
        };

        let pages = match root.remove("pages") {
            Some(pages @ Value::Object(_)) => pages,
            Some(other) => {
                root.insert("pages".to_string(), other);
                Value::Object(root)
            }
            None => Value::Object(root),
        };

        let pages: BTreeMap<PageNumber, PageSnapshot> = serde_json::from_value(pages)
            .map_err(|err| AnnotationError::malformed(err.to_string()))?;
        Ok(Self { pages })
    }
}
