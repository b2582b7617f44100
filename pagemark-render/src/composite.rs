//! Paints annotation objects over a rendered page bitmap.
//!
//! Each object is flattened into a mark: a set of shapes in device pixels
//! sharing one color. Rows are painted in parallel and every mark is blended
//! at most once per pixel, so overlapping segments of a translucent stroke do
//! not stack. Text has no glyph rasterizer here and is drawn as its bounding
//! box.

use pagemark_core::geometry::{distance_to_segment, Rect};
use pagemark_core::style::BrushStyle;
use pagemark_core::{AnnotationObject, Color, ObjectKind, Point, RenderImage, Transform};
use rayon::prelude::*;
use tracing::trace;

const TEXT_OUTLINE_WIDTH: f64 = 1.0;
const ACTIVE_OUTLINE: Color = Color::rgb(0x1E, 0x90, 0xFF);

/// Everything drawn on top of one page.
#[derive(Debug, Clone, Copy)]
pub struct Overlay<'a> {
    pub objects: &'a [AnnotationObject],
    pub transform: Transform,
    /// Stroke still under the pointer, in scene coordinates.
    pub preview: Option<(&'a [Point], &'a BrushStyle)>,
    /// Object to outline as selected.
    pub active: Option<&'a AnnotationObject>,
}

#[derive(Debug, Clone, Copy)]
enum Shape {
    Segment { a: Point, b: Point, half_width: f64 },
    Outline { rect: Rect, width: f64 },
}

impl Shape {
    fn rows(&self) -> (f64, f64) {
        match *self {
            Shape::Segment { a, b, half_width } => {
                (a.y.min(b.y) - half_width, a.y.max(b.y) + half_width)
            }
            Shape::Outline { rect, width } => (rect.top - width, rect.bottom() + width),
        }
    }

    /// Coverage of the pixel centered on `p`, in `0.0..=1.0`.
    fn coverage(&self, p: Point) -> f64 {
        match *self {
            Shape::Segment { a, b, half_width } => {
                let d = distance_to_segment(p, a, b);
                (half_width + 0.5 - d).clamp(0.0, 1.0)
            }
            Shape::Outline { rect, width } => {
                let inside_outer = p.x >= rect.left - width / 2.0
                    && p.x <= rect.right() + width / 2.0
                    && p.y >= rect.top - width / 2.0
                    && p.y <= rect.bottom() + width / 2.0;
                let inside_inner = p.x > rect.left + width / 2.0
                    && p.x < rect.right() - width / 2.0
                    && p.y > rect.top + width / 2.0
                    && p.y < rect.bottom() - width / 2.0;
                if inside_outer && !inside_inner {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    fn on_row(&self, cy: f64) -> bool {
        let (top, bottom) = self.rows();
        cy >= top - 1.0 && cy <= bottom + 1.0
    }
}

/// One object's shapes, blended together.
#[derive(Debug, Clone)]
struct Mark {
    shapes: Vec<Shape>,
    color: Color,
}

impl Mark {
    fn new(shapes: Vec<Shape>, color: Color) -> Option<Self> {
        (!shapes.is_empty()).then_some(Self { shapes, color })
    }
}

pub fn composite(image: &mut RenderImage, objects: &[AnnotationObject], transform: Transform) {
    composite_with_preview(
        image,
        Overlay {
            objects,
            transform,
            preview: None,
            active: None,
        },
    );
}

pub fn composite_with_preview(image: &mut RenderImage, overlay: Overlay<'_>) {
    let zoom = overlay.transform.zoom();
    let mut marks: Vec<Mark> = overlay
        .objects
        .iter()
        .filter_map(|object| flatten(object, &overlay.transform, zoom))
        .collect();
    if let Some((points, style)) = overlay.preview {
        let color = style.color.parse().unwrap_or(Color::BLACK);
        marks.extend(Mark::new(
            polyline(points, style.width, &overlay.transform, zoom),
            color,
        ));
    }
    if let Some(active) = overlay.active {
        marks.extend(Mark::new(
            vec![Shape::Outline {
                rect: to_device(active.bounds(), &overlay.transform),
                width: 1.0,
            }],
            ACTIVE_OUTLINE,
        ));
    }
    if marks.is_empty() {
        return;
    }
    trace!(count = marks.len(), "compositing annotations");
    paint(image, &marks);
}

fn flatten(object: &AnnotationObject, transform: &Transform, zoom: f64) -> Option<Mark> {
    match object.kind {
        ObjectKind::Path => {
            let color = parse_color(object.stroke.as_deref())?;
            let width = object.stroke_width.unwrap_or(1.0);
            Mark::new(polyline(&object.vertices(), width, transform, zoom), color)
        }
        ObjectKind::Rect => {
            let color = parse_color(object.stroke.as_deref())?;
            let outline = Shape::Outline {
                rect: to_device(object.bounds(), transform),
                width: (object.stroke_width.unwrap_or(1.0) * zoom).max(1.0),
            };
            Mark::new(vec![outline], color)
        }
        ObjectKind::IText => {
            let color = parse_color(object.fill.as_deref()).unwrap_or(Color::BLACK);
            let outline = Shape::Outline {
                rect: to_device(object.bounds(), transform),
                width: TEXT_OUTLINE_WIDTH,
            };
            Mark::new(vec![outline], color)
        }
        ObjectKind::Other(ref kind) => {
            trace!(%kind, "no painter for object type");
            None
        }
    }
}

fn polyline(points: &[Point], width: f64, transform: &Transform, zoom: f64) -> Vec<Shape> {
    let half_width = (width * zoom / 2.0).max(0.5);
    match points {
        [] => Vec::new(),
        [only] => {
            let p = transform.apply(*only);
            vec![Shape::Segment {
                a: p,
                b: p,
                half_width,
            }]
        }
        _ => points
            .windows(2)
            .map(|seg| Shape::Segment {
                a: transform.apply(seg[0]),
                b: transform.apply(seg[1]),
                half_width,
            })
            .collect(),
    }
}

fn parse_color(raw: Option<&str>) -> Option<Color> {
    raw.and_then(|c| c.parse::<Color>().ok())
        .filter(|c| c.a > 0.0)
}

fn to_device(rect: Rect, transform: &Transform) -> Rect {
    let top_left = transform.apply(Point::new(rect.left, rect.top));
    let bottom_right = transform.apply(Point::new(rect.right(), rect.bottom()));
    Rect {
        left: top_left.x,
        top: top_left.y,
        width: bottom_right.x - top_left.x,
        height: bottom_right.y - top_left.y,
    }
}

fn paint(image: &mut RenderImage, marks: &[Mark]) {
    let width = image.width as usize;
    if width == 0 || image.pixels.len() < width * 4 {
        return;
    }
    image
        .pixels
        .par_chunks_mut(width * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let cy = y as f64 + 0.5;
            let on_row: Vec<(Color, Vec<&Shape>)> = marks
                .iter()
                .filter_map(|mark| {
                    let shapes: Vec<&Shape> =
                        mark.shapes.iter().filter(|s| s.on_row(cy)).collect();
                    (!shapes.is_empty()).then_some((mark.color, shapes))
                })
                .collect();
            if on_row.is_empty() {
                return;
            }
            for (x, pixel) in row.chunks_exact_mut(4).enumerate() {
                let center = Point::new(x as f64 + 0.5, cy);
                for (color, shapes) in &on_row {
                    let coverage = shapes
                        .iter()
                        .map(|shape| shape.coverage(center))
                        .fold(0.0, f64::max);
                    if coverage > 0.0 {
                        blend(pixel, *color, coverage);
                    }
                }
            }
        });
}

fn blend(pixel: &mut [u8], color: Color, coverage: f64) {
    let alpha = f64::from(color.a) * coverage;
    for (channel, src) in [color.r, color.g, color.b].into_iter().enumerate() {
        let dst = f64::from(pixel[channel]);
        let src = f64::from(src);
        pixel[channel] = (src * alpha + dst * (1.0 - alpha)).round().clamp(0.0, 255.0) as u8;
    }
    pixel[3] = 255;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white(width: u32, height: u32) -> RenderImage {
        RenderImage {
            width,
            height,
            pixels: vec![255; (width * height * 4) as usize],
        }
    }

    fn pixel(image: &RenderImage, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * image.width + x) * 4) as usize;
        [
            image.pixels[i],
            image.pixels[i + 1],
            image.pixels[i + 2],
            image.pixels[i + 3],
        ]
    }

    fn red_stroke(width: f64) -> AnnotationObject {
        AnnotationObject::stroke(
            vec![Point::new(2.0, 10.0), Point::new(18.0, 10.0)],
            &BrushStyle {
                color: "#FF0000".into(),
                width,
            },
        )
    }

    #[test]
    fn stroke_paints_along_its_path() {
        let mut image = white(20, 20);
        composite(&mut image, &[red_stroke(2.0)], Transform::IDENTITY);
        assert_eq!(pixel(&image, 10, 9), [255, 0, 0, 255]);
        assert_eq!(pixel(&image, 10, 2), [255, 255, 255, 255]);
    }

    #[test]
    fn zoom_moves_strokes_with_the_page() {
        let mut image = white(40, 40);
        composite(&mut image, &[red_stroke(2.0)], Transform::scale(2.0));
        assert_eq!(pixel(&image, 20, 20), [255, 0, 0, 255]);
        assert_eq!(pixel(&image, 20, 10), [255, 255, 255, 255]);
    }

    #[test]
    fn translucent_highlight_blends() {
        let mut image = white(20, 20);
        let highlight = AnnotationObject::stroke(
            vec![Point::new(0.0, 10.0), Point::new(20.0, 10.0)],
            &BrushStyle {
                color: "rgba(255,255,0,0.3)".into(),
                width: 6.0,
            },
        );
        composite(&mut image, &[highlight], Transform::IDENTITY);
        let [r, g, b, _] = pixel(&image, 10, 10);
        assert_eq!((r, g), (255, 255));
        assert!(b > 150 && b < 200, "blue channel {b}");
    }

    #[test]
    fn dense_highlight_blends_once_per_pixel() {
        let mut image = white(100, 20);
        let points: Vec<Point> = (0..100).map(|x| Point::new(f64::from(x), 10.0)).collect();
        let highlight = AnnotationObject::stroke(
            points,
            &BrushStyle {
                color: "rgba(186,225,255,0.3)".into(),
                width: 10.0,
            },
        );
        composite(&mut image, &[highlight], Transform::IDENTITY);
        assert_eq!(pixel(&image, 50, 10), [234, 246, 255, 255]);
        assert_eq!(pixel(&image, 50, 13), [234, 246, 255, 255]);
    }

    #[test]
    fn canvas_paths_and_unknown_types() {
        let mut image = white(40, 40);
        let path: AnnotationObject = serde_json::from_value(serde_json::json!({
            "type": "path",
            "stroke": "#000000",
            "strokeWidth": 2.0,
            "path": [["M", 5.0, 20.0], ["L", 35.0, 20.0]]
        }))
        .unwrap();
        let circle: AnnotationObject = serde_json::from_value(serde_json::json!({
            "type": "circle",
            "left": 0.0,
            "top": 0.0,
            "radius": 5.0,
            "stroke": "#FF0000"
        }))
        .unwrap();
        composite(&mut image, &[path, circle], Transform::IDENTITY);
        assert_eq!(pixel(&image, 20, 19), [0, 0, 0, 255]);
        assert_eq!(pixel(&image, 2, 2), [255, 255, 255, 255]);
    }

    #[test]
    fn rect_draws_only_its_outline() {
        let mut image = white(30, 30);
        let rect = AnnotationObject::rect(
            Rect {
                left: 5.0,
                top: 5.0,
                width: 20.0,
                height: 20.0,
            },
            "#0000FF",
            2.0,
        );
        composite(&mut image, &[rect], Transform::IDENTITY);
        assert_eq!(pixel(&image, 5, 15), [0, 0, 255, 255]);
        assert_eq!(pixel(&image, 15, 15), [255, 255, 255, 255]);
    }

    #[test]
    fn preview_and_selection_are_drawn() {
        let mut image = white(20, 20);
        let points = [Point::new(10.0, 0.0), Point::new(10.0, 20.0)];
        let style = BrushStyle {
            color: "#000000".into(),
            width: 2.0,
        };
        composite_with_preview(
            &mut image,
            Overlay {
                objects: &[],
                transform: Transform::IDENTITY,
                preview: Some((&points, &style)),
                active: None,
            },
        );
        assert_eq!(pixel(&image, 10, 5), [0, 0, 0, 255]);
    }

    #[test]
    fn malformed_colors_are_skipped() {
        let mut image = white(20, 20);
        let mut stroke = red_stroke(4.0);
        stroke.stroke = Some("not-a-color".into());
        let before = image.pixels.clone();
        composite(&mut image, &[stroke], Transform::IDENTITY);
        assert_eq!(image.pixels, before);
    }
}
