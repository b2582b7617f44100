//! Terminal front-end helpers: kitty graphics output and the mapping from
//! crossterm input to reader commands and pointer events.

use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind},
    terminal::{Clear, ClearType},
};
use png::{BitDepth, ColorType, Encoder};
use pagemark_core::{AnnotationMode, Command, PageNumber, Point, RenderImage};

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
}

/// Where a page image sits on screen, in cells, and how big it is in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub page: PageNumber,
    pub column: u16,
    pub row: u16,
    pub columns: u16,
    pub rows: u16,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// Page pixel rows cut off above the placed image.
    pub crop_top: u32,
}

impl Placement {
    /// Maps a terminal cell to a pixel on the placed image, sampling the
    /// cell center. `None` outside the image.
    pub fn cell_to_pixel(&self, column: u16, row: u16) -> Option<Point> {
        if self.columns == 0 || self.rows == 0 {
            return None;
        }
        let dx = column.checked_sub(self.column)?;
        let dy = row.checked_sub(self.row)?;
        if dx >= self.columns || dy >= self.rows {
            return None;
        }
        let cell_w = f64::from(self.pixel_width) / f64::from(self.columns);
        let cell_h = f64::from(self.pixel_height) / f64::from(self.rows);
        Some(Point::new(
            (f64::from(dx) + 0.5) * cell_w,
            (f64::from(dy) + 0.5) * cell_h + f64::from(self.crop_top),
        ))
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits and places `image` at `placement`. Each page gets its own
    /// placement id so continuous view can show several at once.
    pub fn draw(&mut self, image: &RenderImage, placement: &Placement) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        crossterm::queue!(
            &mut self.writer,
            cursor::MoveTo(placement.column, placement.row)
        )?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = u8::from(chunks.peek().is_some());
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id + placement.page,
                    placement.page,
                    placement.columns.max(1),
                    placement.rows.max(1),
                    image.width,
                    image.height,
                    more
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", more)?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes every image this renderer placed.
    pub fn delete_all(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=A,q=2\u{1b}\\")?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Sets the mouse pointer shape (OSC 22) to a CSS cursor name.
    pub fn set_pointer_shape(&mut self, name: &str) -> Result<()> {
        write!(self.writer, "\u{1b}]22;{}\u{1b}\\", name)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Down,
    Move,
    Up,
    /// Motion with no button held.
    Hover,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Command(Command),
    /// Left mouse button activity at a terminal cell.
    Pointer {
        phase: PointerPhase,
        column: u16,
        row: u16,
    },
    TypeText(String),
    EraseText,
    GotoLastPage,
    BeginColorInput,
    ColorInputChanged { input: String },
    ColorInputCancel,
    Export,
    ScrollBy { rows: i32 },
    Quit,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Normal,
    /// Keys go to the text object being edited.
    Text,
    Color,
}

#[derive(Debug, Default)]
pub struct EventMapper {
    pending_count: Option<u32>,
    pending_digits: String,
    mode: InputMode,
    color_buffer: String,
}

impl EventMapper {
    pub const SCROLL_ROWS: i32 = 3;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&mut self, mode: InputMode) {
        if self.mode != mode {
            self.reset_count();
            self.color_buffer.clear();
            self.mode = mode;
        }
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        if let Event::Mouse(mouse) = event {
            return self.map_mouse(mouse);
        }
        match self.mode {
            InputMode::Normal => self.map_event_normal(event),
            InputMode::Text => self.map_event_text(event),
            InputMode::Color => self.map_event_color(event),
        }
    }

    fn map_mouse(&mut self, mouse: MouseEvent) -> UiEvent {
        let phase = match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) => PointerPhase::Down,
            MouseEventKind::Drag(MouseButton::Left) => PointerPhase::Move,
            MouseEventKind::Up(MouseButton::Left) => PointerPhase::Up,
            MouseEventKind::Moved => PointerPhase::Hover,
            MouseEventKind::ScrollDown => return UiEvent::ScrollBy { rows: Self::SCROLL_ROWS },
            MouseEventKind::ScrollUp => return UiEvent::ScrollBy { rows: -Self::SCROLL_ROWS },
            _ => return UiEvent::None,
        };
        UiEvent::Pointer {
            phase,
            column: mouse.column,
            row: mouse.row,
        }
    }

    fn map_event_normal(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if let Some(digit) = c.to_digit(10) {
                    self.push_digit(digit);
                }
                UiEvent::None
            }
            (KeyCode::Char('c'), m) if m.contains(KeyModifiers::CONTROL) => {
                self.command(Command::Copy)
            }
            (KeyCode::Char('v'), m) if m.contains(KeyModifiers::CONTROL) => {
                self.command(Command::Paste)
            }
            (KeyCode::Char('j'), KeyModifiers::NONE)
            | (KeyCode::Down, KeyModifiers::NONE)
            | (KeyCode::Char(' '), KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::NextPage { count })
            }
            (KeyCode::Char('k'), KeyModifiers::NONE) | (KeyCode::Up, KeyModifiers::NONE) => {
                let count = self.take_count();
                UiEvent::Command(Command::PrevPage { count })
            }
            (KeyCode::Char('g'), KeyModifiers::NONE) | (KeyCode::Home, _) => {
                let page = self.take_count();
                UiEvent::Command(Command::GotoPage { page })
            }
            (KeyCode::Char('G'), _) | (KeyCode::End, _) => match self.pending_count.take() {
                Some(page) if page > 0 => {
                    self.pending_digits.clear();
                    UiEvent::Command(Command::GotoPage { page })
                }
                _ => {
                    self.reset_count();
                    UiEvent::GotoLastPage
                }
            },
            (KeyCode::Char('+'), _) | (KeyCode::Char('='), _) => self.command(Command::ZoomIn),
            (KeyCode::Char('-'), _) => self.command(Command::ZoomOut),
            (KeyCode::Char('s'), KeyModifiers::NONE) => {
                self.command(Command::SetMode(AnnotationMode::Select))
            }
            (KeyCode::Char('d'), KeyModifiers::NONE) => {
                self.command(Command::SetMode(AnnotationMode::Draw))
            }
            (KeyCode::Char('h'), KeyModifiers::NONE) => {
                self.command(Command::SetMode(AnnotationMode::Highlight))
            }
            (KeyCode::Char('t'), KeyModifiers::NONE) => {
                self.command(Command::SetMode(AnnotationMode::Text))
            }
            (KeyCode::Char('x'), KeyModifiers::NONE) => {
                self.command(Command::SetMode(AnnotationMode::Delete))
            }
            (KeyCode::Char('r'), KeyModifiers::NONE) => self.command(Command::ToggleRawTextSelect),
            (KeyCode::Char('v'), KeyModifiers::NONE) => self.command(Command::ToggleTopology),
            (KeyCode::Char('C'), _) => self.command(Command::ClearPage),
            (KeyCode::Delete, _) | (KeyCode::Backspace, _) => {
                self.command(Command::DeleteSelection)
            }
            (KeyCode::Char('w'), KeyModifiers::NONE) => match self.pending_count.take() {
                Some(width) if width > 0 => {
                    self.pending_digits.clear();
                    UiEvent::Command(Command::SetBrushThickness(f64::from(width)))
                }
                _ => {
                    self.reset_count();
                    UiEvent::None
                }
            },
            (KeyCode::Char('c'), KeyModifiers::NONE) => {
                self.set_mode(InputMode::Color);
                UiEvent::BeginColorInput
            }
            (KeyCode::Char('e'), KeyModifiers::NONE) => {
                self.reset_count();
                UiEvent::Export
            }
            (KeyCode::Esc, _) => self.command(Command::FinishTextEdit),
            (KeyCode::Char('q'), _) => {
                self.reset_count();
                UiEvent::Quit
            }
            _ => {
                self.reset_count();
                UiEvent::None
            }
        }
    }

    fn map_event_text(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::Command(Command::FinishTextEdit)
            }
            (KeyCode::Backspace, _) => UiEvent::EraseText,
            (KeyCode::Enter, _) => UiEvent::TypeText("\n".to_string()),
            (KeyCode::Char(c), m) if m.is_empty() || m == KeyModifiers::SHIFT => {
                UiEvent::TypeText(c.to_string())
            }
            _ => UiEvent::None,
        }
    }

    fn map_event_color(&mut self, event: Event) -> UiEvent {
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event
        else {
            return UiEvent::None;
        };
        match (code, modifiers) {
            (KeyCode::Esc, _) => {
                self.set_mode(InputMode::Normal);
                UiEvent::ColorInputCancel
            }
            (KeyCode::Enter, _) => {
                let color = self.color_buffer.trim().to_string();
                self.set_mode(InputMode::Normal);
                if color.is_empty() {
                    UiEvent::ColorInputCancel
                } else {
                    UiEvent::Command(Command::SetBrushColor(color))
                }
            }
            (KeyCode::Backspace, _) => {
                self.color_buffer.pop();
                UiEvent::ColorInputChanged {
                    input: self.color_buffer.clone(),
                }
            }
            (KeyCode::Char(c), m) if m.is_empty() || m == KeyModifiers::SHIFT => {
                self.color_buffer.push(c);
                UiEvent::ColorInputChanged {
                    input: self.color_buffer.clone(),
                }
            }
            _ => UiEvent::None,
        }
    }

    fn command(&mut self, command: Command) -> UiEvent {
        self.reset_count();
        UiEvent::Command(command)
    }

    fn push_digit(&mut self, digit: u32) {
        let current = self.pending_count.unwrap_or(0);
        self.pending_count = Some(current.saturating_mul(10).saturating_add(digit));
        if let Some(c) = char::from_digit(digit, 10) {
            self.pending_digits.push(c);
        }
    }

    fn take_count(&mut self) -> u32 {
        let count = self
            .pending_count
            .take()
            .filter(|&count| count > 0)
            .unwrap_or(1);
        self.pending_digits.clear();
        count
    }

    fn reset_count(&mut self) {
        self.pending_count = None;
        self.pending_digits.clear();
    }

    /// What the user has typed so far that has not become a command yet.
    pub fn pending_input(&self) -> Option<String> {
        match self.mode {
            InputMode::Color => Some(format!("color: {}", self.color_buffer)),
            InputMode::Text => Some("-- text --".to_string()),
            InputMode::Normal if !self.pending_digits.is_empty() => {
                Some(self.pending_digits.clone())
            }
            InputMode::Normal => None,
        }
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, row: u16, label: &str) -> io::Result<()> {
    crossterm::queue!(
        writer,
        cursor::MoveTo(0, row),
        Clear(ClearType::CurrentLine)
    )?;
    write!(writer, "{}", label)?;
    writer.flush()
}
