//! The reader session: one open document with its annotation layer.
//!
//! `Reader` wires the pool, the store and the mode controller together and
//! turns host input into [`ReaderEvent`]s. All methods run on the host's event
//! loop; only backend I/O is awaited.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::ReaderConfig;
use crate::error::AnnotationError;
use crate::geometry::{PageDimensions, Point, ViewportState, ZoomLimits};
use crate::mode::{AnnotationMode, Cursor, ModeController, ModeState};
use crate::object::{AnnotationObject, DocumentAnnotations, PageSnapshot};
use crate::pool::{FormFactor, PageLayout, PagePool, RenderTicket, ScrollViewport, Topology};
use crate::store::{AnnotationBackend, AnnotationExport, AnnotationStore};
use crate::style::BrushSettings;
use crate::surface::{AnnotationSurface, Propagation, SurfaceContext};
use crate::{DocumentInfo, DocumentInstance, DocumentProvider, PageNumber};

#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub topology: Topology,
    pub form_factor: FormFactor,
    pub brush: BrushSettings,
    pub zoom: ZoomLimits,
    pub device_pixel_ratio: f64,
    pub start_page: PageNumber,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            form_factor: FormFactor::default(),
            brush: BrushSettings::default(),
            zoom: ZoomLimits::default(),
            device_pixel_ratio: 1.0,
            start_page: 1,
        }
    }
}

impl ReaderOptions {
    pub fn from_config(config: &ReaderConfig) -> Self {
        Self {
            topology: config.topology,
            form_factor: config.form_factor,
            brush: config.brush(),
            zoom: config.zoom_limits(),
            device_pixel_ratio: config.device_pixel_ratio,
            start_page: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NextPage { count: u32 },
    PrevPage { count: u32 },
    GotoPage { page: PageNumber },
    ZoomIn,
    ZoomOut,
    SetScale { scale: f64 },
    SetMode(AnnotationMode),
    ToggleRawTextSelect,
    SetBrushColor(String),
    SetBrushThickness(f64),
    ToggleTopology,
    ClearPage,
    DeleteSelection,
    Copy,
    Paste,
    FinishTextEdit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    PageChanged(PageNumber),
    /// Continuous view should bring this page into view.
    ScrollTo(PageNumber),
    RedrawNeeded,
    ModeChanged(ModeState),
    TopologyChanged(Topology),
    Notice(String),
}

pub struct Reader {
    document: DocumentInstance,
    viewport: ViewportState,
    modes: ModeController,
    device_pixel_ratio: f64,
    form_factor: FormFactor,
    pool: PagePool,
    store: AnnotationStore,
    clipboard: Vec<AnnotationObject>,
    focused: Option<PageNumber>,
    last_scroll: Option<(ScrollViewport, Vec<PageLayout>)>,
    events: Mutex<Vec<ReaderEvent>>,
}

impl Reader {
    /// Opens `path`, loads its annotations and mounts the first surfaces.
    /// Must run inside a tokio runtime.
    #[instrument(skip(provider, backend, options))]
    pub async fn open_with<P: DocumentProvider + ?Sized>(
        provider: &P,
        path: PathBuf,
        backend: Arc<dyn AnnotationBackend>,
        options: ReaderOptions,
    ) -> Result<Self> {
        let document = DocumentInstance::new(provider.open(&path).await?);
        let mut store = AnnotationStore::new(document.info.id.clone(), backend);
        store.load().await;

        let viewport = ViewportState::new(options.zoom);
        let modes = ModeController::new(options.brush);
        let topology = options.topology.effective(options.form_factor);
        let context = SurfaceContext {
            scale: viewport.scale(),
            device_pixel_ratio: options.device_pixel_ratio,
            policy: modes.policy(),
        };
        let pool = PagePool::new(
            topology,
            document.page_count(),
            options.start_page,
            store.annotations(),
            context,
        );
        info!(
            document = %document.info.id,
            pages = document.page_count(),
            %topology,
            "document opened"
        );

        let reader = Self {
            document,
            viewport,
            modes,
            device_pixel_ratio: options.device_pixel_ratio,
            form_factor: options.form_factor,
            pool,
            store,
            clipboard: Vec::new(),
            focused: None,
            last_scroll: None,
            events: Mutex::new(Vec::new()),
        };
        reader.push(ReaderEvent::TopologyChanged(topology));
        reader.push(ReaderEvent::PageChanged(reader.current_page()));
        if reader.store.is_read_only() {
            reader.push(ReaderEvent::Notice(
                "stored annotations could not be read; changes will not be saved".to_string(),
            ));
        }
        Ok(reader)
    }

    /// Captures every live surface and waits for the store to write.
    #[instrument(skip(self), fields(document = %self.document.info.id))]
    pub async fn close(mut self) {
        let captured = self.pool.capture_all();
        self.record(captured);
        self.store.flush().await;
        debug!("reader closed");
    }

    pub fn take_events(&self) -> Vec<ReaderEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: ReaderEvent) {
        self.events.lock().push(event);
    }

    pub fn document(&self) -> &DocumentInstance {
        &self.document
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.document.info
    }

    pub fn annotations(&self) -> &DocumentAnnotations {
        self.store.annotations()
    }

    pub fn store(&self) -> &AnnotationStore {
        &self.store
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn surface(&self, page: PageNumber) -> Option<&AnnotationSurface> {
        self.pool.surface(page)
    }

    pub fn scale(&self) -> f64 {
        self.viewport.scale()
    }

    pub fn mode_state(&self) -> ModeState {
        self.modes.state()
    }

    pub fn brush(&self) -> &BrushSettings {
        self.modes.brush()
    }

    pub fn topology(&self) -> Topology {
        self.pool.topology()
    }

    pub fn current_page(&self) -> PageNumber {
        self.pool.current_page()
    }

    pub fn page_count(&self) -> u32 {
        self.pool.page_count()
    }

    pub fn clipboard(&self) -> &[AnnotationObject] {
        &self.clipboard
    }

    fn context(&self) -> SurfaceContext {
        SurfaceContext {
            scale: self.viewport.scale(),
            device_pixel_ratio: self.device_pixel_ratio,
            policy: self.modes.policy(),
        }
    }

    fn sync_context(&mut self) {
        let context = self.context();
        self.pool.set_context(context);
    }

    /// The page keyboard commands act on: the last one pointed at, else the
    /// current page.
    fn focused_page(&self) -> PageNumber {
        self.focused
            .filter(|page| self.pool.surface(*page).is_some())
            .unwrap_or_else(|| self.current_page())
    }

    fn focused_surface_mut(&mut self) -> Option<&mut AnnotationSurface> {
        let page = self.focused_page();
        self.pool.surface_mut(page)
    }

    /// Records captured pages and queues a save. Pages that were never
    /// annotated and are still empty are not written.
    fn record(&mut self, snapshots: Vec<(PageNumber, PageSnapshot)>) -> bool {
        let mut recorded = 0usize;
        for (page, snapshot) in snapshots {
            if snapshot.is_empty() && self.store.page(page).is_none() {
                continue;
            }
            self.store.record_page(page, snapshot);
            recorded += 1;
        }
        if recorded > 0 {
            self.store.save();
        }
        recorded > 0
    }

    /// Moves surface save requests into the store.
    fn persist_changes(&mut self) {
        let changed = self.pool.drain_saves();
        if self.record(changed) {
            self.push(ReaderEvent::RedrawNeeded);
        }
    }

    pub async fn apply(&mut self, command: Command) -> Result<(), AnnotationError> {
        let result = match command {
            Command::NextPage { count } => {
                let next = self
                    .current_page()
                    .saturating_add(count)
                    .min(self.page_count().max(1));
                self.go_to(next)
            }
            Command::PrevPage { count } => {
                let prev = self.current_page().saturating_sub(count).max(1);
                self.go_to(prev)
            }
            Command::GotoPage { page } => self.go_to(page),
            Command::ZoomIn => {
                let changed = self.viewport.zoom_in();
                self.zoom_changed(changed);
                Ok(())
            }
            Command::ZoomOut => {
                let changed = self.viewport.zoom_out();
                self.zoom_changed(changed);
                Ok(())
            }
            Command::SetScale { scale } => {
                let changed = self.viewport.set_scale(scale);
                self.zoom_changed(changed);
                Ok(())
            }
            Command::SetMode(mode) => {
                let changed = self.modes.set_mode(mode);
                self.mode_changed(changed);
                Ok(())
            }
            Command::ToggleRawTextSelect => {
                let changed = self.modes.toggle_raw_text_select();
                self.mode_changed(changed);
                Ok(())
            }
            Command::SetBrushColor(color) => self.modes.set_brush_color(&color).map(|()| {
                self.sync_context();
            }),
            Command::SetBrushThickness(thickness) => {
                self.modes.set_brush_thickness(thickness);
                self.sync_context();
                Ok(())
            }
            Command::ToggleTopology => {
                let target = self.topology().toggled();
                self.switch_topology(target).await;
                Ok(())
            }
            Command::ClearPage => self.clear_page(),
            Command::DeleteSelection => {
                if let Some(surface) = self.focused_surface_mut() {
                    surface.remove_active();
                }
                Ok(())
            }
            Command::Copy => {
                let copied = self
                    .pool
                    .surface(self.focused_page())
                    .map(|s| s.copy_active())
                    .unwrap_or_default();
                if !copied.is_empty() {
                    self.clipboard = copied;
                }
                Ok(())
            }
            Command::Paste => {
                let clipboard = self.clipboard.clone();
                if let Some(surface) = self.focused_surface_mut() {
                    surface.paste(&clipboard);
                }
                Ok(())
            }
            Command::FinishTextEdit => {
                if let Some(surface) = self.focused_surface_mut() {
                    surface.finish_text_edit();
                }
                Ok(())
            }
        };
        self.persist_changes();
        result
    }

    fn go_to(&mut self, page: PageNumber) -> Result<(), AnnotationError> {
        self.pool.check_page(page)?;
        if page == self.current_page() {
            return Ok(());
        }
        self.persist_changes();
        let disposed = self.pool.go_to(page, self.store.annotations())?;
        self.record(disposed);
        if self.topology() == Topology::Continuous {
            self.push(ReaderEvent::ScrollTo(page));
        }
        self.push(ReaderEvent::PageChanged(page));
        self.push(ReaderEvent::RedrawNeeded);
        Ok(())
    }

    fn zoom_changed(&mut self, changed: bool) {
        if !changed {
            return;
        }
        debug!(scale = self.viewport.scale(), "zoom changed");
        self.sync_context();
        self.push(ReaderEvent::RedrawNeeded);
    }

    fn mode_changed(&mut self, changed: bool) {
        if !changed {
            return;
        }
        self.sync_context();
        self.push(ReaderEvent::ModeChanged(self.modes.state()));
    }

    /// Capture and flush everything, reload from the backend, then build the
    /// new topology.
    #[instrument(skip(self))]
    async fn switch_topology(&mut self, requested: Topology) {
        let target = requested.effective(self.form_factor);
        if target == self.topology() {
            self.push(ReaderEvent::Notice(format!(
                "{} view is the only view on this device",
                target
            )));
            return;
        }
        let captured = self.pool.capture_all();
        self.record(captured);
        self.store.reconcile().await;
        self.pool.switch_topology(target, self.store.annotations());
        self.focused = None;
        info!(%target, "topology switched");

        let page = self.current_page();
        self.push(ReaderEvent::TopologyChanged(target));
        if target == Topology::Continuous {
            self.push(ReaderEvent::ScrollTo(page));
        }
        self.push(ReaderEvent::RedrawNeeded);
    }

    fn clear_page(&mut self) -> Result<(), AnnotationError> {
        if self.topology() == Topology::Continuous {
            let err = AnnotationError::UnsupportedInTopology {
                operation: "clear page",
                topology: Topology::Continuous.label(),
            };
            warn!(error = %err, "refused");
            self.push(ReaderEvent::Notice(err.to_string()));
            return Err(err);
        }
        if let Some(surface) = self.pool.current_surface_mut() {
            surface.clear();
        }
        Ok(())
    }

    // --- pointer and keyboard input ------------------------------------

    pub fn pointer_down(&mut self, page: PageNumber, point: Point) -> Propagation {
        self.focused = Some(page);
        let outcome = match self.pool.surface_mut(page) {
            Some(surface) => surface.pointer_down(point),
            None => Propagation::PassThrough,
        };
        self.persist_changes();
        outcome
    }

    pub fn pointer_move(&mut self, page: PageNumber, point: Point) -> Propagation {
        match self.pool.surface_mut(page) {
            Some(surface) => surface.pointer_move(point),
            None => Propagation::PassThrough,
        }
    }

    pub fn pointer_up(&mut self, page: PageNumber, point: Point) -> Propagation {
        let outcome = match self.pool.surface_mut(page) {
            Some(surface) => surface.pointer_up(point),
            None => Propagation::PassThrough,
        };
        self.persist_changes();
        outcome
    }

    /// Pointer shape to show while hovering `point` on `page`.
    pub fn cursor_at(&self, page: PageNumber, point: Point) -> Cursor {
        self.pool
            .surface(page)
            .map(|surface| surface.cursor_at(point))
            .unwrap_or(Cursor::Default)
    }

    /// Feeds typed text to the text object being edited, if any.
    pub fn type_text(&mut self, input: &str) -> bool {
        let typed = self
            .focused_surface_mut()
            .map(|s| s.type_text(input))
            .unwrap_or(false);
        if typed {
            self.push(ReaderEvent::RedrawNeeded);
        }
        typed
    }

    pub fn backspace_text(&mut self) -> bool {
        let erased = self
            .focused_surface_mut()
            .map(|s| s.backspace_text())
            .unwrap_or(false);
        if erased {
            self.push(ReaderEvent::RedrawNeeded);
        }
        erased
    }

    pub fn is_editing_text(&self) -> bool {
        self.pool
            .surface(self.focused_page())
            .and_then(|s| s.editing())
            .is_some()
    }

    // --- renderer contract ---------------------------------------------

    pub fn pending_renders(&mut self) -> Vec<RenderTicket> {
        self.pool.pending_renders()
    }

    pub fn page_rendered(&mut self, ticket: RenderTicket, dimensions: PageDimensions) -> bool {
        self.pool.page_rendered(ticket, dimensions)
    }

    pub fn window_resized(&mut self) -> bool {
        self.pool.window_resized()
    }

    pub fn page_resized(&mut self, page: PageNumber, dimensions: PageDimensions) -> bool {
        self.pool.page_resized(page, dimensions)
    }

    pub fn scrolled(&mut self, viewport: ScrollViewport, layouts: Vec<PageLayout>) {
        if self.pool.scrolled() {
            self.last_scroll = Some((viewport, layouts));
        }
    }

    /// Runs the once-per-frame visibility check.
    pub fn animation_frame(&mut self) -> Option<PageNumber> {
        let (viewport, layouts) = self.last_scroll.as_ref()?;
        let page = self.pool.animation_frame(viewport, layouts)?;
        self.push(ReaderEvent::PageChanged(page));
        Some(page)
    }

    // --- import / export -----------------------------------------------

    pub fn export_annotations(&mut self) -> Result<AnnotationExport> {
        self.persist_changes();
        self.store.export_json()
    }

    pub async fn import_annotations(&mut self, text: &str) -> Result<usize, AnnotationError> {
        let pages = match self.store.import_json(text).await {
            Ok(pages) => pages,
            Err(err) => {
                self.push(ReaderEvent::Notice(err.to_string()));
                return Err(err);
            }
        };
        self.pool.rebuild(self.store.annotations());
        self.push(ReaderEvent::Notice(format!(
            "imported annotations for {pages} page(s)"
        )));
        self.push(ReaderEvent::RedrawNeeded);
        Ok(pages)
    }
}
