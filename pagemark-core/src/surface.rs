//! The annotation surface: one page's live scene of vector objects.
//!
//! A surface stores objects in scene coordinates (scale 1) and keeps the live
//! zoom in its transform. Pointer input arrives in surface (screen) pixels and
//! is mapped back through the inverse transform. Every change that must be
//! persisted queues a [`SaveReason`]; the owning pool drains them.

use std::ops::Range;

use tracing::{debug, trace};

use crate::geometry::{PageDimensions, Point, SurfaceGeometry, Transform};
use crate::mode::{Cursor, InteractionPolicy, LayerStack, PointerHandler};
use crate::object::{AnnotationObject, ObjectId, PageSnapshot};
use crate::PageNumber;

pub const TEXT_PLACEHOLDER: &str = "Text";
pub const TEXT_FONT_SIZE: f64 = 16.0;
pub const TEXT_FILL: &str = "black";
pub const PASTE_OFFSET: f64 = 10.0;
const HIT_SLOP_PX: f64 = 4.0;

/// Shared state every surface is configured from. Rebuilt by the reader and
/// pushed to all live surfaces whenever zoom or mode changes.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceContext {
    pub scale: f64,
    pub device_pixel_ratio: f64,
    pub policy: InteractionPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveReason {
    ObjectAdded,
    ObjectModified,
    ObjectRemoved,
    TextEdited,
    StrokeFinished,
    Cleared,
}

/// What happened to a pointer event after the surface saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Continue,
    /// Consumed; the host must not let it bubble (keeps surface focus).
    Stop,
    /// The surface is not interactive; deliver the event to the text layer.
    PassThrough,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextEdit {
    pub object: ObjectId,
    /// Selected character range inside the text.
    pub selection: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Gesture {
    Idle,
    Stroke(Vec<Point>),
    Drag {
        object: ObjectId,
        last: Point,
        moved: bool,
    },
}

#[derive(Debug)]
pub struct AnnotationSurface {
    page: PageNumber,
    objects: Vec<AnnotationObject>,
    transform: Transform,
    device_pixel_ratio: f64,
    rendered: Option<PageDimensions>,
    geometry: Option<SurfaceGeometry>,
    policy: InteractionPolicy,
    active: Option<ObjectId>,
    editing: Option<TextEdit>,
    gesture: Gesture,
    pending_saves: Vec<SaveReason>,
}

impl AnnotationSurface {
    pub fn new(page: PageNumber, ctx: &SurfaceContext) -> Self {
        Self {
            page,
            objects: Vec::new(),
            transform: Transform::scale(ctx.scale),
            device_pixel_ratio: ctx.device_pixel_ratio,
            rendered: None,
            geometry: None,
            policy: ctx.policy.clone(),
            active: None,
            editing: None,
            gesture: Gesture::Idle,
            pending_saves: Vec::new(),
        }
    }

    pub fn page(&self) -> PageNumber {
        self.page
    }

    pub fn objects(&self) -> &[AnnotationObject] {
        &self.objects
    }

    pub fn object(&self, id: ObjectId) -> Option<&AnnotationObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn geometry(&self) -> Option<SurfaceGeometry> {
        self.geometry
    }

    pub fn rendered(&self) -> Option<PageDimensions> {
        self.rendered
    }

    pub fn policy(&self) -> &InteractionPolicy {
        &self.policy
    }

    pub fn layers(&self) -> LayerStack {
        self.policy.layers
    }

    pub fn active(&self) -> Option<ObjectId> {
        self.active
    }

    pub fn editing(&self) -> Option<&TextEdit> {
        self.editing.as_ref()
    }

    /// Points of the stroke currently being drawn, in scene coordinates.
    pub fn stroke_in_progress(&self) -> Option<&[Point]> {
        match &self.gesture {
            Gesture::Stroke(points) => Some(points),
            _ => None,
        }
    }

    pub fn to_screen(&self, scene: Point) -> Point {
        self.transform.apply(scene)
    }

    pub fn to_scene(&self, screen: Point) -> Point {
        self.transform
            .invert()
            .map(|inv| inv.apply(screen))
            .unwrap_or(screen)
    }

    // --- geometry ------------------------------------------------------

    /// Sets the uniform zoom transform only.
    pub fn apply_zoom(&mut self, scale: f64) {
        self.transform = Transform::scale(scale);
    }

    /// Records the renderer's measured pixel box for this page.
    pub fn attach_render(&mut self, dimensions: PageDimensions) {
        self.rendered = Some(dimensions);
    }

    /// Re-derives size and transform from the rendered page and `scale`.
    /// Returns `false` (and only applies the zoom) when the page has not
    /// rendered yet.
    pub fn fit(&mut self, scale: f64) -> bool {
        self.apply_zoom(scale);
        match SurfaceGeometry::fit(self.rendered, scale, self.device_pixel_ratio) {
            Some(geometry) => {
                self.transform = geometry.transform;
                self.geometry = Some(geometry);
                true
            }
            None => {
                trace!(page = self.page, "surface geometry unavailable; waiting for render");
                false
            }
        }
    }

    // --- persistence ---------------------------------------------------

    /// Replaces the scene with `snapshot`. Objects come in at scale 1; the
    /// caller reapplies the live zoom afterwards.
    pub fn load(&mut self, snapshot: &PageSnapshot) {
        self.objects.clear();
        self.active = None;
        self.editing = None;
        self.gesture = Gesture::Idle;
        self.transform = Transform::IDENTITY;
        self.objects.extend(snapshot.objects.iter().cloned());
        self.apply_object_flags();
        debug!(page = self.page, objects = self.objects.len(), "surface loaded");
    }

    /// Serializes the scene with the zoom neutralized.
    ///
    /// Order matters: neutralize, serialize, restore. Serializing under the
    /// live transform would store zoomed coordinates.
    pub fn capture_snapshot(&mut self) -> PageSnapshot {
        let live = self.transform;
        self.transform = Transform::IDENTITY;
        let objects = self.serialize_objects();
        self.transform = live;
        PageSnapshot {
            objects,
            captured_zoom: live.zoom(),
            ..PageSnapshot::default()
        }
    }

    fn serialize_objects(&self) -> Vec<AnnotationObject> {
        debug_assert!(self.transform.is_identity());
        self.objects.clone()
    }

    pub fn take_save_requests(&mut self) -> Vec<SaveReason> {
        std::mem::take(&mut self.pending_saves)
    }

    pub fn has_pending_save(&self) -> bool {
        !self.pending_saves.is_empty()
    }

    fn request_save(&mut self, reason: SaveReason) {
        trace!(page = self.page, ?reason, "save requested");
        self.pending_saves.push(reason);
    }

    // --- mode ----------------------------------------------------------

    /// Applies an interaction policy: drawing flag, per-object
    /// `selectable`/`evented`, and the layer stack.
    pub fn configure(&mut self, policy: &InteractionPolicy) {
        if self.editing.is_some() && policy.handler != PointerHandler::PlaceText {
            self.finish_text_edit();
        }
        if policy.handler != self.policy.handler {
            self.gesture = Gesture::Idle;
        }
        self.policy = policy.clone();
        if !self.policy.objects_selectable {
            self.active = None;
        }
        self.apply_object_flags();
    }

    fn apply_object_flags(&mut self) {
        let (selectable, evented) = (self.policy.objects_selectable, self.policy.objects_evented);
        for object in &mut self.objects {
            object.selectable = selectable;
            object.evented = evented;
        }
    }

    // --- pointer input -------------------------------------------------

    pub fn pointer_down(&mut self, screen: Point) -> Propagation {
        let scene = self.to_scene(screen);
        match self.policy.handler {
            PointerHandler::PassThrough => Propagation::PassThrough,
            PointerHandler::Brush => {
                self.gesture = Gesture::Stroke(vec![scene]);
                Propagation::Continue
            }
            PointerHandler::DragSelect => {
                match self.hit(scene).filter(|_| self.policy.objects_selectable) {
                    Some(object) => {
                        self.active = Some(object);
                        self.gesture = Gesture::Drag {
                            object,
                            last: scene,
                            moved: false,
                        };
                    }
                    None => self.active = None,
                }
                Propagation::Continue
            }
            PointerHandler::PlaceText => {
                if self.hit(scene).is_some() {
                    return Propagation::Continue;
                }
                self.finish_text_edit();
                self.place_text(scene);
                Propagation::Continue
            }
            PointerHandler::RemoveOnClick => match self.hit(scene) {
                Some(object) => {
                    self.remove(object);
                    Propagation::Stop
                }
                None => Propagation::Continue,
            },
        }
    }

    pub fn pointer_move(&mut self, screen: Point) -> Propagation {
        if self.policy.handler == PointerHandler::PassThrough {
            return Propagation::PassThrough;
        }
        let scene = self.to_scene(screen);
        match &mut self.gesture {
            Gesture::Stroke(points) => points.push(scene),
            Gesture::Drag {
                object,
                last,
                moved,
            } => {
                let (dx, dy) = (scene.x - last.x, scene.y - last.y);
                if dx != 0.0 || dy != 0.0 {
                    let id = *object;
                    *last = scene;
                    *moved = true;
                    if let Some(target) = self.objects.iter_mut().find(|o| o.id == id) {
                        target.translate(dx, dy);
                    }
                }
            }
            Gesture::Idle => {}
        }
        Propagation::Continue
    }

    pub fn pointer_up(&mut self, screen: Point) -> Propagation {
        if self.policy.handler == PointerHandler::PassThrough {
            return Propagation::PassThrough;
        }
        let scene = self.to_scene(screen);
        match std::mem::replace(&mut self.gesture, Gesture::Idle) {
            Gesture::Stroke(mut points) => {
                if points.last() != Some(&scene) {
                    points.push(scene);
                }
                if let Some(style) = self.policy.brush.clone() {
                    let mut object = AnnotationObject::stroke(points, &style);
                    object.selectable = self.policy.objects_selectable;
                    object.evented = self.policy.objects_evented;
                    self.objects.push(object);
                    self.request_save(SaveReason::ObjectAdded);
                }
            }
            Gesture::Drag { moved: true, .. } => self.request_save(SaveReason::ObjectModified),
            Gesture::Drag { .. } | Gesture::Idle => {}
        }
        if self.policy.drawing {
            self.request_save(SaveReason::StrokeFinished);
        }
        Propagation::Continue
    }

    /// Pointer shape for a hover at `screen`: the mode's hover cursor over an
    /// object it can act on, its default cursor elsewhere.
    pub fn cursor_at(&self, screen: Point) -> Cursor {
        if self.policy.handler == PointerHandler::PassThrough {
            return self.policy.default_cursor;
        }
        match self.hit(self.to_scene(screen)) {
            Some(_) => self.policy.hover_cursor,
            None => self.policy.default_cursor,
        }
    }

    /// Topmost evented object under a scene point.
    fn hit(&self, scene: Point) -> Option<ObjectId> {
        let zoom = self.transform.zoom();
        let slop = if zoom > 0.0 { HIT_SLOP_PX / zoom } else { HIT_SLOP_PX };
        self.objects
            .iter()
            .rev()
            .find(|o| o.evented && o.hit_test(scene, slop))
            .map(|o| o.id)
    }

    // --- text ----------------------------------------------------------

    fn place_text(&mut self, scene: Point) {
        let zoom = self.transform.zoom();
        let font_size = if zoom > 0.0 { TEXT_FONT_SIZE / zoom } else { TEXT_FONT_SIZE };
        let object = AnnotationObject::text(scene, TEXT_PLACEHOLDER, font_size, TEXT_FILL);
        let id = object.id;
        self.objects.push(object);
        self.active = Some(id);
        self.editing = Some(TextEdit {
            object: id,
            selection: 0..TEXT_PLACEHOLDER.chars().count(),
        });
        self.request_save(SaveReason::ObjectAdded);
    }

    /// Replaces the current text selection with `input`.
    pub fn type_text(&mut self, input: &str) -> bool {
        let Some(edit) = self.editing.as_mut() else {
            return false;
        };
        let Some(object) = self.objects.iter_mut().find(|o| o.id == edit.object) else {
            self.editing = None;
            return false;
        };
        let text = object.text.get_or_insert_with(String::new);
        let mut chars: Vec<char> = text.chars().collect();
        let start = edit.selection.start.min(chars.len());
        let end = edit.selection.end.clamp(start, chars.len());
        chars.splice(start..end, input.chars());
        *text = chars.into_iter().collect();
        let caret = start + input.chars().count();
        edit.selection = caret..caret;
        true
    }

    /// Deletes the selection, or the character before the caret.
    pub fn backspace_text(&mut self) -> bool {
        let Some(edit) = self.editing.as_mut() else {
            return false;
        };
        let Some(object) = self.objects.iter_mut().find(|o| o.id == edit.object) else {
            self.editing = None;
            return false;
        };
        let text = object.text.get_or_insert_with(String::new);
        let mut chars: Vec<char> = text.chars().collect();
        let start = edit.selection.start.min(chars.len());
        let end = edit.selection.end.clamp(start, chars.len());
        let (from, to) = if start == end {
            (start.saturating_sub(1), end)
        } else {
            (start, end)
        };
        chars.drain(from..to);
        *text = chars.into_iter().collect();
        edit.selection = from..from;
        true
    }

    /// Leaves text edit mode; emits a save if an edit was active.
    pub fn finish_text_edit(&mut self) -> bool {
        if self.editing.take().is_some() {
            self.request_save(SaveReason::TextEdited);
            true
        } else {
            false
        }
    }

    // --- keyboard and page operations ----------------------------------

    fn remove(&mut self, id: ObjectId) -> bool {
        let before = self.objects.len();
        self.objects.retain(|o| o.id != id);
        if self.objects.len() == before {
            return false;
        }
        if self.active == Some(id) {
            self.active = None;
        }
        if self.editing.as_ref().map(|e| e.object) == Some(id) {
            self.editing = None;
        }
        self.request_save(SaveReason::ObjectRemoved);
        true
    }

    /// Removes the active object (Delete/Backspace outside text editing).
    pub fn remove_active(&mut self) -> bool {
        if self.editing.is_some() {
            return false;
        }
        match self.active {
            Some(id) => self.remove(id),
            None => false,
        }
    }

    pub fn select(&mut self, id: ObjectId) -> bool {
        if self.policy.objects_selectable && self.object(id).is_some() {
            self.active = Some(id);
            true
        } else {
            false
        }
    }

    pub fn copy_active(&self) -> Vec<AnnotationObject> {
        self.active
            .and_then(|id| self.object(id))
            .cloned()
            .into_iter()
            .collect()
    }

    /// Pastes copies of `clipboard` offset by [`PASTE_OFFSET`].
    pub fn paste(&mut self, clipboard: &[AnnotationObject]) -> usize {
        if clipboard.is_empty() {
            return 0;
        }
        for source in clipboard {
            let mut copy = source.duplicate(PASTE_OFFSET, PASTE_OFFSET);
            copy.selectable = self.policy.objects_selectable;
            copy.evented = self.policy.objects_evented;
            self.objects.push(copy);
        }
        self.request_save(SaveReason::ObjectAdded);
        clipboard.len()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
        self.active = None;
        self.editing = None;
        self.gesture = Gesture::Idle;
        self.request_save(SaveReason::Cleared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{AnnotationMode, ModeState};
    use crate::object::ObjectKind;
    use crate::style::BrushSettings;

    fn ctx(mode: AnnotationMode, scale: f64) -> SurfaceContext {
        let state = ModeState {
            mode,
            raw_text_select: false,
        };
        SurfaceContext {
            scale,
            device_pixel_ratio: 1.0,
            policy: InteractionPolicy::resolve(state, &BrushSettings::default()),
        }
    }

    fn draw_line(surface: &mut AnnotationSurface, from: Point, to: Point) {
        surface.pointer_down(from);
        surface.pointer_move(Point::new((from.x + to.x) / 2.0, (from.y + to.y) / 2.0));
        surface.pointer_up(to);
    }

    #[test]
    fn stroke_is_stored_in_scene_coordinates() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 2.0));
        draw_line(&mut surface, Point::new(100.0, 100.0), Point::new(200.0, 100.0));
        assert_eq!(surface.len(), 1);
        let object = &surface.objects()[0];
        assert_eq!(object.points.first(), Some(&Point::new(50.0, 50.0)));
        assert_eq!(object.points.last(), Some(&Point::new(100.0, 50.0)));
        assert_eq!(
            surface.take_save_requests(),
            vec![SaveReason::ObjectAdded, SaveReason::StrokeFinished]
        );
    }

    #[test]
    fn capture_then_load_is_zoom_invariant() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 2.0));
        draw_line(&mut surface, Point::new(40.0, 40.0), Point::new(80.0, 120.0));
        draw_line(&mut surface, Point::new(10.0, 10.0), Point::new(20.0, 30.0));
        let snapshot = surface.capture_snapshot();
        assert_eq!(snapshot.captured_zoom, 2.0);
        assert_eq!(surface.transform(), Transform::scale(2.0));

        let mut reloaded = AnnotationSurface::new(1, &ctx(AnnotationMode::Select, 0.5));
        reloaded.load(&snapshot);
        reloaded.apply_zoom(0.5);
        assert_eq!(reloaded.len(), 2);
        for (a, b) in surface.objects().iter().zip(reloaded.objects()) {
            assert_eq!(a.points, b.points);
        }
        let first = reloaded.objects()[0].points[0];
        assert_eq!(reloaded.to_screen(first), Point::new(10.0, 10.0));
    }

    #[test]
    fn load_applies_active_mode_flags() {
        let mut drawing = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 1.0));
        draw_line(&mut drawing, Point::new(1.0, 1.0), Point::new(9.0, 9.0));
        let snapshot = drawing.capture_snapshot();
        assert!(!snapshot.objects[0].selectable);

        let mut selecting = AnnotationSurface::new(1, &ctx(AnnotationMode::Select, 1.0));
        selecting.load(&snapshot);
        assert!(selecting.objects().iter().all(|o| o.selectable && o.evented));
    }

    #[test]
    fn configure_twice_is_idempotent() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 1.0));
        draw_line(&mut surface, Point::new(1.0, 1.0), Point::new(9.0, 9.0));
        let delete = ctx(AnnotationMode::Delete, 1.0).policy;
        surface.configure(&delete);
        let first: Vec<_> = surface.objects().iter().map(|o| (o.selectable, o.evented)).collect();
        surface.configure(&delete);
        let second: Vec<_> = surface.objects().iter().map(|o| (o.selectable, o.evented)).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![(false, true)]);
    }

    #[test]
    fn delete_mode_removes_clicked_object_and_stops_propagation() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 1.0));
        draw_line(&mut surface, Point::new(10.0, 10.0), Point::new(50.0, 10.0));
        surface.take_save_requests();
        surface.configure(&ctx(AnnotationMode::Delete, 1.0).policy);

        assert_eq!(surface.pointer_down(Point::new(200.0, 200.0)), Propagation::Continue);
        assert_eq!(surface.len(), 1);
        assert_eq!(surface.pointer_down(Point::new(30.0, 11.0)), Propagation::Stop);
        assert!(surface.is_empty());
        assert_eq!(surface.take_save_requests(), vec![SaveReason::ObjectRemoved]);
    }

    #[test]
    fn text_mode_places_editable_text_scaled_for_zoom() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Text, 2.0));
        surface.pointer_down(Point::new(100.0, 60.0));
        assert_eq!(surface.len(), 1);
        let object = &surface.objects()[0];
        assert_eq!(object.kind, ObjectKind::IText);
        assert_eq!((object.left, object.top), (50.0, 30.0));
        assert_eq!(object.font_size, Some(8.0));
        assert_eq!(surface.editing().unwrap().selection, 0..4);

        surface.type_text("Note");
        surface.type_text("s!");
        surface.backspace_text();
        assert!(surface.finish_text_edit());
        assert_eq!(surface.objects()[0].text.as_deref(), Some("Notes"));
        assert_eq!(
            surface.take_save_requests(),
            vec![SaveReason::ObjectAdded, SaveReason::TextEdited]
        );
    }

    #[test]
    fn select_mode_drags_objects() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 1.0));
        draw_line(&mut surface, Point::new(10.0, 10.0), Point::new(50.0, 10.0));
        surface.configure(&ctx(AnnotationMode::Select, 1.0).policy);
        surface.take_save_requests();

        surface.pointer_down(Point::new(30.0, 10.0));
        surface.pointer_move(Point::new(35.0, 20.0));
        surface.pointer_up(Point::new(35.0, 20.0));
        let object = &surface.objects()[0];
        assert_eq!(object.points[0], Point::new(15.0, 20.0));
        assert_eq!(surface.take_save_requests(), vec![SaveReason::ObjectModified]);
    }

    #[test]
    fn hover_cursor_only_over_objects() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 1.0));
        draw_line(&mut surface, Point::new(10.0, 10.0), Point::new(50.0, 10.0));
        surface.configure(&ctx(AnnotationMode::Select, 1.0).policy);
        assert_eq!(surface.cursor_at(Point::new(30.0, 10.0)), Cursor::Move);
        assert_eq!(surface.cursor_at(Point::new(30.0, 80.0)), Cursor::Default);

        surface.configure(&ctx(AnnotationMode::Delete, 1.0).policy);
        assert_eq!(surface.cursor_at(Point::new(30.0, 10.0)), Cursor::Pointer);
    }

    #[test]
    fn raw_text_select_passes_pointer_through() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Draw, 1.0));
        let state = ModeState {
            mode: AnnotationMode::Draw,
            raw_text_select: true,
        };
        surface.configure(&InteractionPolicy::resolve(state, &BrushSettings::default()));
        assert_eq!(surface.pointer_down(Point::new(1.0, 1.0)), Propagation::PassThrough);
        assert_eq!(surface.pointer_up(Point::new(5.0, 5.0)), Propagation::PassThrough);
        assert!(surface.is_empty());
        assert!(!surface.layers().canvas_pointer_events);
    }

    #[test]
    fn copy_and_paste_offsets_duplicates() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Text, 1.0));
        surface.pointer_down(Point::new(20.0, 20.0));
        surface.finish_text_edit();
        surface.configure(&ctx(AnnotationMode::Select, 1.0).policy);
        let id = surface.objects()[0].id;
        assert!(surface.select(id));
        let clipboard = surface.copy_active();
        assert_eq!(surface.paste(&clipboard), 1);
        assert_eq!(surface.len(), 2);
        let copy = &surface.objects()[1];
        assert_ne!(copy.id, id);
        assert_eq!((copy.left, copy.top), (30.0, 30.0));
    }

    #[test]
    fn fit_waits_for_render() {
        let mut surface = AnnotationSurface::new(1, &ctx(AnnotationMode::Select, 1.5));
        assert!(!surface.fit(1.5));
        assert!(surface.geometry().is_none());
        surface.attach_render(PageDimensions::new(900, 1200));
        assert!(surface.fit(1.5));
        assert_eq!(surface.geometry().unwrap().backing_width, 900);
        assert_eq!(surface.transform(), Transform::scale(1.5));
    }
}
