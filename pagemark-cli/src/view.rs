//! The interactive viewer: draws mounted pages with their annotations through
//! the kitty graphics protocol and feeds terminal input to the reader.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::cursor;
use crossterm::event::{self, DisableMouseCapture, EnableMouseCapture, Event};
use crossterm::terminal;
use pagemark_core::{
    AnnotationBackend, Command, Cursor, PageLayout, PageNumber, Point, Reader, ReaderConfig, ReaderEvent,
    ReaderOptions, RenderImage, RenderTicket, ScrollViewport, Topology, Transform,
};
use pagemark_core::store::AnnotationExport;
use pagemark_render::{composite_with_preview, Overlay, PdfRenderFactory};
use pagemark_tty::{
    write_status_line, EventMapper, InputMode, KittyRenderer, Placement, PointerPhase, UiEvent,
};
use tracing::{info, warn};

/// One visibility check per frame.
const FRAME: Duration = Duration::from_millis(16);
const FALLBACK_CELL: (f64, f64) = (8.0, 16.0);

struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        crossterm::execute!(io::stdout(), EnableMouseCapture, cursor::Hide)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(
            stdout,
            DisableMouseCapture,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0),
            cursor::Show
        );
        let _ = terminal::disable_raw_mode();
    }
}

pub async fn run(
    file: PathBuf,
    page: Option<u32>,
    config: &ReaderConfig,
    backend: Arc<dyn AnnotationBackend>,
) -> Result<()> {
    let provider = PdfRenderFactory::new()?;
    let mut options = ReaderOptions::from_config(config);
    if let Some(page) = page {
        options.start_page = page;
    }
    let mut reader = Reader::open_with(&provider, file.clone(), backend, options)
        .await
        .with_context(|| format!("failed to open {:?}", file))?;

    let result = {
        let _guard = TerminalGuard::new()?;
        let mut renderer = KittyRenderer::new(io::stdout());
        let mut view = View::new(config);
        let result = view.event_loop(&mut reader, &mut renderer).await;
        if let Err(err) = renderer.set_pointer_shape(Cursor::Default.css_name()) {
            warn!(?err, "failed to reset pointer shape");
        }
        result
    };

    reader.close().await;
    info!("viewer closed");
    result
}

#[derive(Debug, PartialEq, Eq)]
enum LoopAction {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy)]
struct Screen {
    columns: u16,
    rows: u16,
    cell: (f64, f64),
}

impl Screen {
    fn measure() -> Result<Self> {
        let window = terminal::window_size()?;
        let columns = window.columns.max(1);
        let rows = window.rows.max(1);
        let cell = if window.width > 0 && window.height > 0 {
            (
                f64::from(window.width) / f64::from(columns),
                f64::from(window.height) / f64::from(rows),
            )
        } else {
            FALLBACK_CELL
        };
        Ok(Self {
            columns,
            rows,
            cell,
        })
    }

    /// Rows above the status line.
    fn page_rows(&self) -> u16 {
        self.rows.saturating_sub(1).max(1)
    }
}

struct View {
    mapper: EventMapper,
    device_pixel_ratio: f64,
    page_gap: u32,
    scroll_top: u32,
    layouts: Vec<PageLayout>,
    placements: Vec<Placement>,
    deferred: BTreeMap<PageNumber, RenderTicket>,
    pointer: Option<(PageNumber, Point)>,
    /// Pointer shape wanted for the last hover, and the one last sent.
    cursor: Cursor,
    shown_cursor: Cursor,
    notice: Option<String>,
    dirty: bool,
}

impl View {
    fn new(config: &ReaderConfig) -> Self {
        let device_pixel_ratio = if config.device_pixel_ratio > 0.0 {
            config.device_pixel_ratio
        } else {
            1.0
        };
        Self {
            mapper: EventMapper::new(),
            device_pixel_ratio,
            page_gap: config.page_gap.max(0.0).round() as u32,
            scroll_top: 0,
            layouts: Vec::new(),
            placements: Vec::new(),
            deferred: BTreeMap::new(),
            pointer: None,
            cursor: Cursor::Default,
            shown_cursor: Cursor::Default,
            notice: None,
            dirty: true,
        }
    }

    async fn event_loop(
        &mut self,
        reader: &mut Reader,
        renderer: &mut KittyRenderer<io::Stdout>,
    ) -> Result<()> {
        loop {
            for ticket in reader.pending_renders() {
                self.deferred.insert(ticket.page, ticket);
            }
            self.drain_reader_events(reader);
            if self.dirty {
                self.redraw(reader, renderer)?;
                self.dirty = false;
            }

            if event::poll(FRAME)? {
                let ev = event::read()?;
                if let Event::Resize(..) = ev {
                    reader.window_resized();
                    self.dirty = true;
                    continue;
                }
                let ui_event = self.mapper.map_event(ev);
                if self.handle(ui_event, reader).await? == LoopAction::Quit {
                    return Ok(());
                }
                self.sync_text_mode(reader);
                if self.cursor != self.shown_cursor {
                    renderer.set_pointer_shape(self.cursor.css_name())?;
                    self.shown_cursor = self.cursor;
                }
            }

            if reader.animation_frame().is_some() {
                self.dirty = true;
            }
        }
    }

    fn drain_reader_events(&mut self, reader: &Reader) {
        for event in reader.take_events() {
            match event {
                ReaderEvent::PageChanged(_)
                | ReaderEvent::RedrawNeeded
                | ReaderEvent::ModeChanged(_) => self.dirty = true,
                ReaderEvent::ScrollTo(page) => {
                    if let Some(layout) = self.layouts.iter().find(|l| l.page == page) {
                        self.scroll_top = layout.top.max(0.0) as u32;
                    }
                    self.dirty = true;
                }
                ReaderEvent::TopologyChanged(topology) => {
                    info!(%topology, "layout changed");
                    self.scroll_top = 0;
                    self.layouts.clear();
                    self.dirty = true;
                }
                ReaderEvent::Notice(message) => {
                    self.notice = Some(message);
                    self.dirty = true;
                }
            }
        }
    }

    async fn handle(&mut self, event: UiEvent, reader: &mut Reader) -> Result<LoopAction> {
        match event {
            UiEvent::Command(command) => self.apply(reader, command).await,
            UiEvent::GotoLastPage => {
                let page = reader.page_count();
                self.apply(reader, Command::GotoPage { page }).await;
            }
            UiEvent::Pointer { phase, column, row } => {
                self.pointer_event(reader, phase, column, row);
                if phase != PointerPhase::Hover {
                    self.dirty = true;
                }
            }
            UiEvent::TypeText(text) => {
                reader.type_text(&text);
            }
            UiEvent::EraseText => {
                reader.backspace_text();
            }
            UiEvent::ScrollBy { rows } => self.scroll_by(reader, rows)?,
            UiEvent::Export => {
                let written = reader
                    .export_annotations()
                    .and_then(|export| write_export(Path::new("."), &export));
                self.notice = Some(export_notice(written));
                self.dirty = true;
            }
            UiEvent::BeginColorInput
            | UiEvent::ColorInputChanged { .. }
            | UiEvent::ColorInputCancel => self.dirty = true,
            UiEvent::Quit => return Ok(LoopAction::Quit),
            UiEvent::None => {
                if self.mapper.pending_input().is_some() {
                    self.dirty = true;
                }
            }
        }
        Ok(LoopAction::Continue)
    }

    async fn apply(&mut self, reader: &mut Reader, command: Command) {
        self.notice = None;
        if let Err(err) = reader.apply(command).await {
            warn!(error = %err, "command failed");
            self.notice = Some(err.to_string());
        }
        self.dirty = true;
    }

    fn pointer_event(&mut self, reader: &mut Reader, phase: PointerPhase, column: u16, row: u16) {
        let ratio = self.device_pixel_ratio;
        let hit = self.placements.iter().find_map(|placement| {
            placement
                .cell_to_pixel(column, row)
                .map(|px| (placement.page, Point::new(px.x / ratio, px.y / ratio)))
        });
        match phase {
            PointerPhase::Down => {
                if let Some((page, point)) = hit {
                    reader.pointer_down(page, point);
                    self.pointer = Some((page, point));
                }
            }
            PointerPhase::Move => {
                if let (Some((page, _)), Some((hit_page, point))) = (self.pointer, hit) {
                    if hit_page == page {
                        reader.pointer_move(page, point);
                        self.pointer = Some((page, point));
                    }
                }
            }
            PointerPhase::Hover => {
                self.cursor = hit
                    .map(|(page, point)| reader.cursor_at(page, point))
                    .unwrap_or(Cursor::Default);
            }
            PointerPhase::Up => {
                if let Some((page, last)) = self.pointer.take() {
                    let point = hit
                        .filter(|(hit_page, _)| *hit_page == page)
                        .map(|(_, point)| point)
                        .unwrap_or(last);
                    reader.pointer_up(page, point);
                }
            }
        }
    }

    fn scroll_by(&mut self, reader: &mut Reader, rows: i32) -> Result<()> {
        if reader.topology() != Topology::Continuous || self.layouts.is_empty() {
            return Ok(());
        }
        let screen = Screen::measure()?;
        let visible = u32::from(screen.page_rows());
        let total = self
            .layouts
            .last()
            .map(|l| (l.top + l.height) as u32)
            .unwrap_or(0);
        let max_top = total.saturating_sub(visible);
        let next = (i64::from(self.scroll_top) + i64::from(rows)).clamp(0, i64::from(max_top));
        self.scroll_top = next as u32;
        reader.scrolled(
            ScrollViewport {
                top: f64::from(self.scroll_top),
                height: f64::from(visible),
            },
            self.layouts.clone(),
        );
        self.dirty = true;
        Ok(())
    }

    fn sync_text_mode(&mut self, reader: &Reader) {
        match (reader.is_editing_text(), self.mapper.mode()) {
            (true, InputMode::Normal) => self.mapper.set_mode(InputMode::Text),
            (false, InputMode::Text) => self.mapper.set_mode(InputMode::Normal),
            _ => {}
        }
    }

    fn redraw(&mut self, reader: &mut Reader, renderer: &mut KittyRenderer<io::Stdout>) -> Result<()> {
        let screen = Screen::measure()?;
        renderer.begin_sync_update()?;
        renderer.delete_all()?;
        renderer.clear_all()?;
        self.placements.clear();

        match reader.topology() {
            Topology::Single => self.draw_single(reader, renderer, &screen)?,
            Topology::Continuous => self.draw_continuous(reader, renderer, &screen)?,
        }

        let status = self.status(reader);
        write_status_line(renderer.writer(), screen.rows.saturating_sub(1), &status)?;
        renderer.end_sync_update()?;
        Ok(())
    }

    fn draw_single(
        &mut self,
        reader: &mut Reader,
        renderer: &mut KittyRenderer<io::Stdout>,
        screen: &Screen,
    ) -> Result<()> {
        let page = reader.current_page();
        let image = self.page_image(reader, page)?;
        let (columns, rows) = fit_cells(&image, screen.cell, screen.columns, screen.page_rows());
        let placement = Placement {
            page,
            column: screen.columns.saturating_sub(columns) / 2,
            row: screen.page_rows().saturating_sub(rows) / 2,
            columns,
            rows,
            pixel_width: image.width,
            pixel_height: image.height,
            crop_top: 0,
        };
        renderer.draw(&image, &placement)?;
        self.placements.push(placement);

        let scale = reader.scale() * self.device_pixel_ratio;
        if let Err(err) = reader.document().prefetch_neighbors(page, 1, scale) {
            warn!(?err, page, "failed to prefetch neighboring pages");
        }
        Ok(())
    }

    fn draw_continuous(
        &mut self,
        reader: &mut Reader,
        renderer: &mut KittyRenderer<io::Stdout>,
        screen: &Screen,
    ) -> Result<()> {
        let current = reader.current_page();
        let reference = self.page_image(reader, current)?;
        let (columns, page_rows) = fit_cells(&reference, screen.cell, screen.columns, u16::MAX);
        let first_layout = self.layouts.is_empty();
        self.layouts = page_layouts(reader.page_count(), u32::from(page_rows), self.page_gap);
        if first_layout {
            if let Some(layout) = self.layouts.iter().find(|l| l.page == current) {
                self.scroll_top = layout.top as u32;
            }
        }

        let visible_rows = u32::from(screen.page_rows());
        let window_top = self.scroll_top;
        let window_bottom = window_top + visible_rows;
        let column = screen.columns.saturating_sub(columns) / 2;
        let visible: Vec<PageLayout> = self
            .layouts
            .iter()
            .filter(|l| (l.top as u32) < window_bottom && ((l.top + l.height) as u32) > window_top)
            .copied()
            .collect();

        for layout in visible {
            let image = self.page_image(reader, layout.page)?;
            let top = layout.top as u32;
            let shown_top = top.max(window_top);
            let shown_bottom = (top + layout.height as u32).min(window_bottom);
            let rows = shown_bottom.saturating_sub(shown_top);
            if rows == 0 || layout.height <= 0.0 {
                continue;
            }
            let px_per_row = f64::from(image.height) / layout.height;
            let crop_top = (f64::from(shown_top - top) * px_per_row).round() as u32;
            let crop_height = (f64::from(rows) * px_per_row).round() as u32;
            let cropped = crop_rows(&image, crop_top, crop_height);
            let placement = Placement {
                page: layout.page,
                column,
                row: (shown_top - window_top) as u16,
                columns,
                rows: rows as u16,
                pixel_width: cropped.width,
                pixel_height: cropped.height,
                crop_top,
            };
            renderer.draw(&cropped, &placement)?;
            self.placements.push(placement);
        }
        Ok(())
    }

    /// Renders `page`, completes its outstanding render ticket and paints its
    /// annotations on top.
    fn page_image(&mut self, reader: &mut Reader, page: PageNumber) -> Result<RenderImage> {
        let scale = reader.scale() * self.device_pixel_ratio;
        let mut image = reader.document().render(page, scale)?;
        if let Some(ticket) = self.deferred.remove(&page) {
            reader.page_rendered(ticket, image.dimensions());
        }
        if let Some(surface) = reader.surface(page) {
            let preview = surface
                .stroke_in_progress()
                .zip(surface.policy().brush.as_ref());
            let active = surface.active().and_then(|id| surface.object(id));
            composite_with_preview(
                &mut image,
                Overlay {
                    objects: surface.objects(),
                    transform: Transform::scale(surface.transform().zoom() * self.device_pixel_ratio),
                    preview,
                    active,
                },
            );
        }
        Ok(image)
    }

    fn status(&self, reader: &Reader) -> String {
        let state = reader.mode_state();
        let mut status = format!(
            "{} | page {}/{} | {:.0}% | {}{} | {}",
            reader.info().id,
            reader.current_page(),
            reader.page_count(),
            reader.scale() * 100.0,
            state.mode,
            if state.raw_text_select { " (text select)" } else { "" },
            reader.topology()
        );
        if let Some(pending) = self.mapper.pending_input() {
            status.push_str(" | ");
            status.push_str(&pending);
        } else if let Some(notice) = &self.notice {
            status.push_str(" | ");
            status.push_str(notice);
        }
        status
    }
}

fn write_export(dir: &Path, export: &AnnotationExport) -> Result<PathBuf> {
    let path = dir.join(&export.file_name);
    fs::write(&path, &export.contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Export failures are reported on the status line; the viewer keeps running.
fn export_notice(written: Result<PathBuf>) -> String {
    match written {
        Ok(path) => format!("exported to {}", path.display()),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "export failed");
            format!("export failed: {err:#}")
        }
    }
}

/// Vertical placement of every page, in terminal rows.
fn page_layouts(page_count: u32, page_rows: u32, gap: u32) -> Vec<PageLayout> {
    (1..=page_count)
        .map(|page| PageLayout {
            page,
            top: f64::from((page - 1) * (page_rows + gap)),
            height: f64::from(page_rows),
        })
        .collect()
}

/// Cells an image occupies at its natural size, shrunk to fit the limits.
fn fit_cells(image: &RenderImage, cell: (f64, f64), max_columns: u16, max_rows: u16) -> (u16, u16) {
    if image.width == 0 || image.height == 0 || cell.0 <= 0.0 || cell.1 <= 0.0 {
        return (max_columns.max(1), max_rows.max(1));
    }
    let columns = f64::from(image.width) / cell.0;
    let rows = f64::from(image.height) / cell.1;
    let shrink = (f64::from(max_columns) / columns)
        .min(f64::from(max_rows) / rows)
        .min(1.0);
    let fit = |value: f64, max: u16| (value * shrink).round().clamp(1.0, f64::from(max.max(1))) as u16;
    (fit(columns, max_columns), fit(rows, max_rows))
}

fn crop_rows(image: &RenderImage, top: u32, height: u32) -> RenderImage {
    if image.width == 0 || image.height == 0 {
        return image.clone();
    }
    let height = height.clamp(1, image.height);
    let top = top.min(image.height - height);
    let stride = image.width as usize * 4;
    let start = top as usize * stride;
    let end = start + height as usize * stride;
    RenderImage {
        width: image.width,
        height,
        pixels: image.pixels[start..end].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(width: u32, height: u32) -> RenderImage {
        RenderImage {
            width,
            height,
            pixels: (0..width * height * 4).map(|i| (i / (width * 4)) as u8).collect(),
        }
    }

    #[test]
    fn fit_keeps_natural_size_when_it_fits() {
        assert_eq!(fit_cells(&image(80, 160), (8.0, 16.0), 100, 50), (10, 10));
    }

    #[test]
    fn fit_shrinks_preserving_aspect() {
        assert_eq!(fit_cells(&image(800, 1600), (8.0, 16.0), 200, 50), (50, 50));
        assert_eq!(fit_cells(&image(1600, 160), (8.0, 16.0), 100, 50), (100, 5));
    }

    #[test]
    fn layouts_stack_pages_with_gaps() {
        let layouts = page_layouts(3, 40, 1);
        assert_eq!(layouts.len(), 3);
        assert_eq!(layouts[1].top, 41.0);
        assert_eq!(layouts[2].top, 82.0);
        assert_eq!(layouts[2].height, 40.0);
    }

    #[test]
    fn failed_export_becomes_a_notice() {
        let export = AnnotationExport {
            file_name: "paper.pdf_annotations.json".into(),
            contents: "{}".into(),
        };
        let dir = tempfile::tempdir().unwrap();

        let written = write_export(dir.path(), &export);
        assert!(export_notice(written).starts_with("exported to "));
        assert!(dir.path().join("paper.pdf_annotations.json").exists());

        let missing = dir.path().join("missing");
        let notice = export_notice(write_export(&missing, &export));
        assert!(notice.starts_with("export failed: failed to write"), "{notice}");
    }

    #[test]
    fn crop_keeps_requested_rows() {
        let source = image(2, 10);
        let cropped = crop_rows(&source, 3, 4);
        assert_eq!((cropped.width, cropped.height), (2, 4));
        assert_eq!(cropped.pixels[0], 3);
        assert_eq!(*cropped.pixels.last().unwrap(), 6);

        let clamped = crop_rows(&source, 9, 4);
        assert_eq!(clamped.height, 4);
        assert_eq!(clamped.pixels[0], 6);
    }
}
