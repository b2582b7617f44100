//! Page surface pool: which annotation surfaces exist and for which pages.
//!
//! Both topologies sit behind [`PageTopology`]. Single-Active keeps exactly one
//! surface for the current page; Continuous keeps one per page, keyed by
//! [`SurfaceKey`] so bumping the refresh counter rebuilds everything from the
//! authoritative annotations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::AnnotationError;
use crate::geometry::PageDimensions;
use crate::object::{DocumentAnnotations, PageSnapshot};
use crate::surface::{AnnotationSurface, SurfaceContext};
use crate::PageNumber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    #[default]
    Continuous,
    #[serde(alias = "single-active")]
    Single,
}

impl Topology {
    pub fn label(self) -> &'static str {
        match self {
            Topology::Continuous => "continuous",
            Topology::Single => "single-page",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            Topology::Continuous => Topology::Single,
            Topology::Single => Topology::Continuous,
        }
    }

    /// Phones always get Single-Active.
    pub fn effective(self, form_factor: FormFactor) -> Self {
        match form_factor {
            FormFactor::Phone => Topology::Single,
            FormFactor::Desktop => self,
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Topology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" | "scroll" => Ok(Topology::Continuous),
            "single" | "single-active" | "single-page" => Ok(Topology::Single),
            other => Err(format!("unknown topology {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    #[default]
    Desktop,
    Phone,
}

/// Identity of a Continuous surface. A new `refresh` value means a new surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SurfaceKey {
    pub page: PageNumber,
    pub refresh: u64,
}

/// Handed to the renderer; a completion is only honored if its generation
/// is still the latest requested for that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTicket {
    pub page: PageNumber,
    pub generation: u64,
}

/// Vertical placement of one page inside the scroll container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageLayout {
    pub page: PageNumber,
    pub top: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollViewport {
    pub top: f64,
    pub height: f64,
}

impl PageLayout {
    pub fn visible_in(&self, viewport: &ScrollViewport) -> f64 {
        let top = self.top.max(viewport.top);
        let bottom = (self.top + self.height).min(viewport.top + viewport.height);
        (bottom - top).max(0.0)
    }
}

/// Coalesces scroll events into one visibility check per animation frame.
#[derive(Debug, Clone, Default)]
pub struct VisibilityTracker {
    pending: bool,
    last_reported: Option<PageNumber>,
}

impl VisibilityTracker {
    pub fn new(current: PageNumber) -> Self {
        Self {
            pending: false,
            last_reported: Some(current),
        }
    }

    pub fn on_scroll(&mut self) {
        self.pending = true;
    }

    /// Returns the most visible page if a scroll happened since the last frame
    /// and that page differs from the one reported last.
    pub fn on_animation_frame(
        &mut self,
        viewport: &ScrollViewport,
        layouts: &[PageLayout],
    ) -> Option<PageNumber> {
        if !std::mem::take(&mut self.pending) {
            return None;
        }
        let mut best: Option<(PageNumber, f64)> = None;
        for layout in layouts {
            let visible = layout.visible_in(viewport);
            if visible <= 0.0 {
                continue;
            }
            if best.map_or(true, |(_, area)| visible > area) {
                best = Some((layout.page, visible));
            }
        }
        let (page, _) = best?;
        if self.last_reported == Some(page) {
            return None;
        }
        self.last_reported = Some(page);
        Some(page)
    }

    pub fn reset(&mut self, page: PageNumber) {
        self.pending = false;
        self.last_reported = Some(page);
    }
}

/// One mounting strategy for page surfaces.
pub trait PageTopology: Send + fmt::Debug {
    fn kind(&self) -> Topology;

    fn current_page(&self) -> PageNumber;

    fn mounted_pages(&self) -> Vec<PageNumber>;

    fn surface(&self, page: PageNumber) -> Option<&AnnotationSurface>;

    fn surface_mut(&mut self, page: PageNumber) -> Option<&mut AnnotationSurface>;

    fn surfaces_mut(&mut self) -> Box<dyn Iterator<Item = &mut AnnotationSurface> + '_>;

    /// Moves to `page`. Returns snapshots of surfaces that were disposed.
    fn go_to(
        &mut self,
        page: PageNumber,
        annotations: &DocumentAnnotations,
        ctx: &SurfaceContext,
    ) -> Vec<(PageNumber, PageSnapshot)>;

    /// Re-creates every surface from `annotations`.
    fn rebuild(&mut self, annotations: &DocumentAnnotations, ctx: &SurfaceContext);
}

fn mount(
    page: PageNumber,
    annotations: &DocumentAnnotations,
    ctx: &SurfaceContext,
    rendered: Option<PageDimensions>,
) -> AnnotationSurface {
    let mut surface = AnnotationSurface::new(page, ctx);
    let empty = PageSnapshot::default();
    surface.load(annotations.page(page).unwrap_or(&empty));
    if let Some(dimensions) = rendered {
        surface.attach_render(dimensions);
    }
    surface.fit(ctx.scale);
    surface
}

#[derive(Debug)]
pub struct SingleActive {
    page: PageNumber,
    surface: Option<AnnotationSurface>,
}

impl SingleActive {
    pub fn new(page: PageNumber, annotations: &DocumentAnnotations, ctx: &SurfaceContext) -> Self {
        Self {
            page,
            surface: Some(mount(page, annotations, ctx, None)),
        }
    }
}

impl PageTopology for SingleActive {
    fn kind(&self) -> Topology {
        Topology::Single
    }

    fn current_page(&self) -> PageNumber {
        self.page
    }

    fn mounted_pages(&self) -> Vec<PageNumber> {
        self.surface.iter().map(|s| s.page()).collect()
    }

    fn surface(&self, page: PageNumber) -> Option<&AnnotationSurface> {
        self.surface.as_ref().filter(|s| s.page() == page)
    }

    fn surface_mut(&mut self, page: PageNumber) -> Option<&mut AnnotationSurface> {
        self.surface.as_mut().filter(|s| s.page() == page)
    }

    fn surfaces_mut(&mut self) -> Box<dyn Iterator<Item = &mut AnnotationSurface> + '_> {
        Box::new(self.surface.iter_mut())
    }

    fn go_to(
        &mut self,
        page: PageNumber,
        annotations: &DocumentAnnotations,
        ctx: &SurfaceContext,
    ) -> Vec<(PageNumber, PageSnapshot)> {
        if page == self.page && self.surface.is_some() {
            return Vec::new();
        }
        let mut disposed = Vec::new();
        if let Some(mut outgoing) = self.surface.take() {
            outgoing.finish_text_edit();
            outgoing.take_save_requests();
            disposed.push((outgoing.page(), outgoing.capture_snapshot()));
        }
        self.page = page;
        self.surface = Some(mount(page, annotations, ctx, None));
        disposed
    }

    fn rebuild(&mut self, annotations: &DocumentAnnotations, ctx: &SurfaceContext) {
        let rendered = self.surface.as_ref().and_then(|s| s.rendered());
        self.surface = Some(mount(self.page, annotations, ctx, rendered));
    }
}

#[derive(Debug)]
pub struct Continuous {
    page_count: u32,
    current: PageNumber,
    refresh: u64,
    surfaces: BTreeMap<SurfaceKey, AnnotationSurface>,
}

impl Continuous {
    pub fn new(
        page_count: u32,
        current: PageNumber,
        annotations: &DocumentAnnotations,
        ctx: &SurfaceContext,
    ) -> Self {
        let mut topology = Self {
            page_count,
            current,
            refresh: 0,
            surfaces: BTreeMap::new(),
        };
        topology.mount_all(annotations, ctx, &BTreeMap::new());
        topology
    }

    fn key(&self, page: PageNumber) -> SurfaceKey {
        SurfaceKey {
            page,
            refresh: self.refresh,
        }
    }

    fn mount_all(
        &mut self,
        annotations: &DocumentAnnotations,
        ctx: &SurfaceContext,
        rendered: &BTreeMap<PageNumber, PageDimensions>,
    ) {
        for page in 1..=self.page_count {
            let surface = mount(page, annotations, ctx, rendered.get(&page).copied());
            self.surfaces.insert(self.key(page), surface);
        }
    }
}

impl PageTopology for Continuous {
    fn kind(&self) -> Topology {
        Topology::Continuous
    }

    fn current_page(&self) -> PageNumber {
        self.current
    }

    fn mounted_pages(&self) -> Vec<PageNumber> {
        self.surfaces.keys().map(|k| k.page).collect()
    }

    fn surface(&self, page: PageNumber) -> Option<&AnnotationSurface> {
        self.surfaces.get(&self.key(page))
    }

    fn surface_mut(&mut self, page: PageNumber) -> Option<&mut AnnotationSurface> {
        let key = self.key(page);
        self.surfaces.get_mut(&key)
    }

    fn surfaces_mut(&mut self) -> Box<dyn Iterator<Item = &mut AnnotationSurface> + '_> {
        Box::new(self.surfaces.values_mut())
    }

    fn go_to(
        &mut self,
        page: PageNumber,
        _annotations: &DocumentAnnotations,
        _ctx: &SurfaceContext,
    ) -> Vec<(PageNumber, PageSnapshot)> {
        self.current = page;
        Vec::new()
    }

    fn rebuild(&mut self, annotations: &DocumentAnnotations, ctx: &SurfaceContext) {
        let rendered: BTreeMap<_, _> = self
            .surfaces
            .values()
            .filter_map(|s| s.rendered().map(|d| (s.page(), d)))
            .collect();
        self.surfaces.clear();
        self.refresh += 1;
        debug!(refresh = self.refresh, "recreating continuous surfaces");
        self.mount_all(annotations, ctx, &rendered);
    }
}

/// Owns the surfaces of the open document and the render bookkeeping for them.
pub struct PagePool {
    topology: Box<dyn PageTopology>,
    page_count: u32,
    context: SurfaceContext,
    generation: u64,
    expected: BTreeMap<PageNumber, u64>,
    pending: Vec<RenderTicket>,
    tracker: VisibilityTracker,
}

impl PagePool {
    pub fn new(
        topology: Topology,
        page_count: u32,
        start_page: PageNumber,
        annotations: &DocumentAnnotations,
        context: SurfaceContext,
    ) -> Self {
        let start_page = start_page.clamp(1, page_count.max(1));
        let mut pool = Self {
            topology: Self::build(topology, page_count, start_page, annotations, &context),
            page_count,
            context,
            generation: 0,
            expected: BTreeMap::new(),
            pending: Vec::new(),
            tracker: VisibilityTracker::new(start_page),
        };
        pool.invalidate_all();
        pool
    }

    fn build(
        topology: Topology,
        page_count: u32,
        page: PageNumber,
        annotations: &DocumentAnnotations,
        ctx: &SurfaceContext,
    ) -> Box<dyn PageTopology> {
        match topology {
            Topology::Single => Box::new(SingleActive::new(page, annotations, ctx)),
            Topology::Continuous => Box::new(Continuous::new(page_count, page, annotations, ctx)),
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology.kind()
    }

    pub fn current_page(&self) -> PageNumber {
        self.topology.current_page()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn context(&self) -> &SurfaceContext {
        &self.context
    }

    pub fn mounted_pages(&self) -> Vec<PageNumber> {
        self.topology.mounted_pages()
    }

    pub fn surface(&self, page: PageNumber) -> Option<&AnnotationSurface> {
        self.topology.surface(page)
    }

    pub fn surface_mut(&mut self, page: PageNumber) -> Option<&mut AnnotationSurface> {
        self.topology.surface_mut(page)
    }

    pub fn current_surface_mut(&mut self) -> Option<&mut AnnotationSurface> {
        let page = self.current_page();
        self.topology.surface_mut(page)
    }

    pub fn check_page(&self, page: PageNumber) -> Result<(), AnnotationError> {
        if page == 0 || page > self.page_count {
            return Err(AnnotationError::PageOutOfRange {
                page,
                page_count: self.page_count,
            });
        }
        Ok(())
    }

    /// Navigates to `page`; returns snapshots of any disposed surfaces that
    /// must be recorded before anything else reads the store.
    pub fn go_to(
        &mut self,
        page: PageNumber,
        annotations: &DocumentAnnotations,
    ) -> Result<Vec<(PageNumber, PageSnapshot)>, AnnotationError> {
        self.check_page(page)?;
        let before = self.mounted_pages();
        let disposed = self.topology.go_to(page, annotations, &self.context);
        for mounted in self.mounted_pages() {
            if !before.contains(&mounted) {
                self.invalidate(mounted);
            }
        }
        let mounted = self.mounted_pages();
        self.expected.retain(|p, _| mounted.contains(p));
        self.pending.retain(|t| mounted.contains(&t.page));
        self.tracker.reset(page);
        Ok(disposed)
    }

    /// Replaces the topology. The caller must have flushed and reloaded the
    /// annotations before calling this.
    pub fn switch_topology(&mut self, topology: Topology, annotations: &DocumentAnnotations) {
        let page = self.current_page();
        self.topology = Self::build(topology, self.page_count, page, annotations, &self.context);
        self.tracker.reset(page);
        self.invalidate_all();
    }

    /// Bumps the refresh counter (Continuous) or remounts the single surface.
    pub fn rebuild(&mut self, annotations: &DocumentAnnotations) {
        self.topology.rebuild(annotations, &self.context);
    }

    /// Captures every mounted surface, e.g. before a topology switch or close.
    pub fn capture_all(&mut self) -> Vec<(PageNumber, PageSnapshot)> {
        self.topology
            .surfaces_mut()
            .map(|surface| {
                surface.finish_text_edit();
                surface.take_save_requests();
                (surface.page(), surface.capture_snapshot())
            })
            .collect()
    }

    /// Captures the surfaces that raised save requests since the last drain.
    pub fn drain_saves(&mut self) -> Vec<(PageNumber, PageSnapshot)> {
        self.topology
            .surfaces_mut()
            .filter_map(|surface| {
                if surface.take_save_requests().is_empty() {
                    None
                } else {
                    Some((surface.page(), surface.capture_snapshot()))
                }
            })
            .collect()
    }

    /// Pushes a new zoom and/or policy to every surface.
    pub fn set_context(&mut self, context: SurfaceContext) {
        let rezoom = (context.scale - self.context.scale).abs() > f64::EPSILON
            || (context.device_pixel_ratio - self.context.device_pixel_ratio).abs() > f64::EPSILON;
        let repolicy = context.policy != self.context.policy;
        self.context = context;
        for surface in self.topology.surfaces_mut() {
            if repolicy {
                surface.configure(&self.context.policy);
            }
            if rezoom {
                surface.fit(self.context.scale);
            }
        }
        if rezoom {
            self.invalidate_all();
        }
    }

    /// Single-Active re-fits on window resize; Continuous waits for
    /// per-page measurements.
    pub fn window_resized(&mut self) -> bool {
        if self.topology() != Topology::Single {
            return false;
        }
        let scale = self.context.scale;
        self.topology
            .surfaces_mut()
            .fold(false, |fitted, surface| surface.fit(scale) || fitted)
    }

    pub fn page_resized(&mut self, page: PageNumber, dimensions: PageDimensions) -> bool {
        let scale = self.context.scale;
        match self.topology.surface_mut(page) {
            Some(surface) => {
                surface.attach_render(dimensions);
                surface.fit(scale)
            }
            None => false,
        }
    }

    fn invalidate(&mut self, page: PageNumber) {
        self.generation += 1;
        self.expected.insert(page, self.generation);
        self.pending.retain(|t| t.page != page);
        self.pending.push(RenderTicket {
            page,
            generation: self.generation,
        });
    }

    fn invalidate_all(&mut self) {
        self.expected.clear();
        self.pending.clear();
        for page in self.mounted_pages() {
            self.invalidate(page);
        }
    }

    /// Render work the host still has to do.
    pub fn pending_renders(&mut self) -> Vec<RenderTicket> {
        std::mem::take(&mut self.pending)
    }

    /// Render-complete callback. Stale tickets are ignored.
    pub fn page_rendered(&mut self, ticket: RenderTicket, dimensions: PageDimensions) -> bool {
        if self.expected.get(&ticket.page) != Some(&ticket.generation) {
            trace!(?ticket, "discarding stale render");
            return false;
        }
        self.expected.remove(&ticket.page);
        self.page_resized(ticket.page, dimensions)
    }

    pub fn scrolled(&mut self) -> bool {
        if self.topology() != Topology::Continuous {
            return false;
        }
        self.tracker.on_scroll();
        true
    }

    /// Checks visibility once per frame; moves the advisory current page.
    pub fn animation_frame(
        &mut self,
        viewport: &ScrollViewport,
        layouts: &[PageLayout],
    ) -> Option<PageNumber> {
        if self.topology() != Topology::Continuous {
            return None;
        }
        let page = self.tracker.on_animation_frame(viewport, layouts)?;
        self.topology.go_to(page, &DocumentAnnotations::default(), &self.context);
        Some(page)
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("topology", &self.topology.kind())
            .field("current_page", &self.current_page())
            .field("page_count", &self.page_count)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::mode::{AnnotationMode, InteractionPolicy, ModeState};
    use crate::style::BrushSettings;

    fn ctx(mode: AnnotationMode) -> SurfaceContext {
        SurfaceContext {
            scale: 1.0,
            device_pixel_ratio: 1.0,
            policy: InteractionPolicy::resolve(
                ModeState {
                    mode,
                    raw_text_select: false,
                },
                &BrushSettings::default(),
            ),
        }
    }

    fn scribble(pool: &mut PagePool, page: PageNumber) {
        let surface = pool.surface_mut(page).unwrap();
        surface.pointer_down(Point::new(1.0, 1.0));
        surface.pointer_up(Point::new(10.0, 10.0));
    }

    #[test]
    fn phone_forces_single_active() {
        assert_eq!(Topology::Continuous.effective(FormFactor::Phone), Topology::Single);
        assert_eq!(
            Topology::Continuous.effective(FormFactor::Desktop),
            Topology::Continuous
        );
        assert_eq!("single".parse::<Topology>().unwrap(), Topology::Single);
    }

    #[test]
    fn single_active_switch_captures_outgoing_page() {
        let annotations = DocumentAnnotations::default();
        let mut pool = PagePool::new(Topology::Single, 5, 1, &annotations, ctx(AnnotationMode::Draw));
        scribble(&mut pool, 1);
        let disposed = pool.go_to(2, &annotations).unwrap();
        assert_eq!(disposed.len(), 1);
        assert_eq!(disposed[0].0, 1);
        assert_eq!(disposed[0].1.objects.len(), 1);
        assert_eq!(pool.mounted_pages(), vec![2]);
        assert!(pool.surface(1).is_none());
        assert!(matches!(
            pool.go_to(6, &annotations),
            Err(AnnotationError::PageOutOfRange { page: 6, .. })
        ));
    }

    #[test]
    fn continuous_mounts_every_page_and_rebuilds_with_new_keys() {
        let mut annotations = DocumentAnnotations::default();
        let mut pool =
            PagePool::new(Topology::Continuous, 3, 1, &annotations, ctx(AnnotationMode::Draw));
        assert_eq!(pool.mounted_pages(), vec![1, 2, 3]);
        scribble(&mut pool, 3);
        for (page, snapshot) in pool.drain_saves() {
            annotations.set_page(page, snapshot);
        }
        assert!(pool.drain_saves().is_empty());

        pool.rebuild(&annotations);
        assert_eq!(pool.surface(3).unwrap().len(), 1);
        assert_eq!(pool.surface(1).unwrap().len(), 0);
    }

    #[test]
    fn stale_render_completions_are_discarded() {
        let annotations = DocumentAnnotations::default();
        let mut pool = PagePool::new(Topology::Single, 2, 1, &annotations, ctx(AnnotationMode::Select));
        let first = pool.pending_renders();
        assert_eq!(first.len(), 1);

        let mut zoomed = ctx(AnnotationMode::Select);
        zoomed.scale = 2.0;
        pool.set_context(zoomed);
        let second = pool.pending_renders();
        assert_eq!(second.len(), 1);
        assert!(second[0].generation > first[0].generation);

        assert!(!pool.page_rendered(first[0], PageDimensions::new(100, 100)));
        assert!(pool.surface(1).unwrap().geometry().is_none());
        assert!(pool.page_rendered(second[0], PageDimensions::new(200, 200)));
        assert_eq!(pool.surface(1).unwrap().geometry().unwrap().backing_width, 200);
        assert!(!pool.page_rendered(second[0], PageDimensions::new(200, 200)));
    }

    #[test]
    fn scroll_burst_reports_one_page_change() {
        let layouts: Vec<_> = (1..=4)
            .map(|page| PageLayout {
                page,
                top: f64::from(page - 1) * 1000.0,
                height: 990.0,
            })
            .collect();
        let annotations = DocumentAnnotations::default();
        let mut pool =
            PagePool::new(Topology::Continuous, 4, 1, &annotations, ctx(AnnotationMode::Select));
        for _ in 0..3 {
            assert!(pool.scrolled());
        }
        let viewport = ScrollViewport {
            top: 1900.0,
            height: 800.0,
        };
        assert_eq!(pool.animation_frame(&viewport, &layouts), Some(3));
        assert_eq!(pool.current_page(), 3);
        assert_eq!(pool.animation_frame(&viewport, &layouts), None);
        pool.scrolled();
        assert_eq!(pool.animation_frame(&viewport, &layouts), None);
    }

    #[test]
    fn mode_change_reconfigures_all_surfaces() {
        let annotations = DocumentAnnotations::default();
        let mut pool =
            PagePool::new(Topology::Continuous, 2, 1, &annotations, ctx(AnnotationMode::Draw));
        scribble(&mut pool, 2);
        pool.set_context(ctx(AnnotationMode::Select));
        let surface = pool.surface(2).unwrap();
        assert!(surface.objects().iter().all(|o| o.selectable && o.evented));
        assert_eq!(pool.pending_renders().len(), 2);
    }

    #[test]
    fn window_resize_refits_only_single_active() {
        let annotations = DocumentAnnotations::default();
        let mut single = PagePool::new(Topology::Single, 2, 1, &annotations, ctx(AnnotationMode::Select));
        assert!(!single.window_resized());
        let ticket = single.pending_renders()[0];
        single.page_rendered(ticket, PageDimensions::new(50, 70));
        assert!(single.window_resized());

        let mut continuous =
            PagePool::new(Topology::Continuous, 2, 1, &annotations, ctx(AnnotationMode::Select));
        assert!(!continuous.window_resized());
        assert!(continuous.page_resized(2, PageDimensions::new(50, 70)));
    }
}
