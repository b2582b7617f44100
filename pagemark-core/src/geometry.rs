//! Viewport geometry: keeps an annotation surface aligned with the rendered
//! page underneath it.
//!
//! Object coordinates are stored at scale 1. The live zoom only ever lives in
//! the surface [`Transform`], which is re-derived from the renderer's measured
//! pixel box whenever the page mounts, the zoom changes, or the window resizes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn distance(self, other: Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Shortest distance from `p` to the segment `a`-`b`.
pub fn distance_to_segment(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    if len_sq <= f64::EPSILON {
        return p.distance(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance(Point::new(a.x + t * dx, a.y + t * dy))
}

/// Axis-aligned box in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(Self {
            left: min_x,
            top: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        })
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    pub fn inflate(self, by: f64) -> Self {
        Self {
            left: self.left - by,
            top: self.top - by,
            width: self.width + by * 2.0,
            height: self.height + by * 2.0,
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.left
            && point.x <= self.right()
            && point.y >= self.top
            && point.y <= self.bottom()
    }
}

/// 2D affine transform in canvas order `[a, b, c, d, e, f]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform([f64; 6]);

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Transform = Transform([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);

    /// Uniform zoom `[s, 0, 0, s, 0, 0]`.
    pub fn scale(s: f64) -> Self {
        Transform([s, 0.0, 0.0, s, 0.0, 0.0])
    }

    pub fn as_array(&self) -> [f64; 6] {
        self.0
    }

    /// Horizontal scale component, which is the zoom for the uniform transforms
    /// used by surfaces.
    pub fn zoom(&self) -> f64 {
        self.0[0]
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn apply(&self, p: Point) -> Point {
        let [a, b, c, d, e, f] = self.0;
        Point::new(a * p.x + c * p.y + e, b * p.x + d * p.y + f)
    }

    pub fn invert(&self) -> Option<Transform> {
        let [a, b, c, d, e, f] = self.0;
        let det = a * d - b * c;
        if det.abs() < f64::EPSILON || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        Some(Transform([
            d * inv,
            -b * inv,
            -c * inv,
            a * inv,
            (c * f - d * e) * inv,
            (b * e - a * f) * inv,
        ]))
    }
}

/// Pixel size of a rendered page surface, as reported by the renderer once a
/// page finished rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageDimensions {
    pub width: u32,
    pub height: u32,
}

impl PageDimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Resolved size and transform of one annotation surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceGeometry {
    /// Internal pixel size, equal to the renderer's unscaled pixel size.
    pub backing_width: u32,
    pub backing_height: u32,
    /// Presented (CSS) size.
    pub presented_width: f64,
    pub presented_height: f64,
    pub transform: Transform,
}

impl SurfaceGeometry {
    /// Returns `None` while the renderer has not produced the page yet; the
    /// caller re-runs the fit from the render-complete callback.
    pub fn fit(
        rendered: Option<PageDimensions>,
        scale: f64,
        device_pixel_ratio: f64,
    ) -> Option<Self> {
        let rendered = rendered?;
        if rendered.width == 0 || rendered.height == 0 {
            return None;
        }
        let ratio = if device_pixel_ratio.is_finite() && device_pixel_ratio > 0.0 {
            device_pixel_ratio
        } else {
            1.0
        };
        Some(Self {
            backing_width: rendered.width,
            backing_height: rendered.height,
            presented_width: f64::from(rendered.width) / ratio,
            presented_height: f64::from(rendered.height) / ratio,
            transform: Transform::scale(scale),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomLimits {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for ZoomLimits {
    fn default() -> Self {
        Self {
            min: 0.5,
            max: 3.0,
            step: 0.1,
        }
    }
}

/// Zoom shared by every page of the open document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    scale: f64,
    limits: ZoomLimits,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self::new(ZoomLimits::default())
    }
}

impl ViewportState {
    pub fn new(limits: ZoomLimits) -> Self {
        Self {
            scale: 1.0_f64.clamp(limits.min, limits.max),
            limits,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn limits(&self) -> ZoomLimits {
        self.limits
    }

    pub fn zoom_in(&mut self) -> bool {
        self.set_scale(self.scale + self.limits.step)
    }

    pub fn zoom_out(&mut self) -> bool {
        self.set_scale(self.scale - self.limits.step)
    }

    /// Returns whether the scale actually changed.
    pub fn set_scale(&mut self, scale: f64) -> bool {
        if !scale.is_finite() {
            return false;
        }
        let next = quantize_scale(scale.clamp(self.limits.min, self.limits.max));
        if (next - self.scale).abs() > f64::EPSILON {
            self.scale = next;
            true
        } else {
            false
        }
    }
}

fn quantize_scale(scale: f64) -> f64 {
    (scale * 1000.0).round() / 1000.0
}
