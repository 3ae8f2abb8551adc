use alacritty_terminal::{
    event::{Event, EventListener},
    grid::Dimensions,
    index::{Column, Line, Point},
    term::{
        cell::{Cell, Flags as CellFlags},
        Config,
    },
    vte::ansi::{Color, NamedColor, Processor},
    Term,
};

use super::ScreenModel;
use crate::error::ScreenError;

struct TermDimensions {
    columns: usize,
    screen_lines: usize,
}

impl TermDimensions {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            columns: usize::from(cols.max(1)),
            screen_lines: usize::from(rows.max(1)),
        }
    }
}

impl Dimensions for TermDimensions {
    fn total_lines(&self) -> usize {
        self.screen_lines
    }

    fn screen_lines(&self) -> usize {
        self.screen_lines
    }

    fn columns(&self) -> usize {
        self.columns
    }
}

#[derive(Clone, Copy, Default)]
struct EventProxy;

impl EventListener for EventProxy {
    fn send_event(&self, _event: Event) {}
}

/// Screen model backed by `alacritty_terminal`.
pub struct AlacrittyScreen {
    term: Option<Term<EventProxy>>,
    parser: Processor,
    scrollback: usize,
}

impl AlacrittyScreen {
    pub fn new(cols: u16, rows: u16, scrollback: usize) -> Self {
        Self {
            term: Some(build_term(cols, rows, scrollback)),
            parser: Processor::new(),
            scrollback,
        }
    }
}

fn build_term(cols: u16, rows: u16, scrollback: usize) -> Term<EventProxy> {
    let mut config = Config::default();
    config.scrolling_history = scrollback;
    Term::new(config, &TermDimensions::new(cols, rows), EventProxy)
}

impl ScreenModel for AlacrittyScreen {
    fn reset(&mut self, cols: u16, rows: u16) {
        self.term = Some(build_term(cols, rows, self.scrollback));
        self.parser = Processor::new();
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(term) = self.term.as_mut() else {
            return;
        };
        for byte in bytes {
            self.parser.advance(term, *byte);
        }
    }

    fn serialize(&self) -> Result<String, ScreenError> {
        let term = self.term.as_ref().ok_or(ScreenError::Disposed)?;
        Ok(render_text(term))
    }

    fn dispose(&mut self) {
        self.term = None;
    }
}

/// Palette entry as a viewer sees it. Named colours collapse onto the
/// 16-colour indexes; the configured foreground and background are `Default`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tint {
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Tint {
    fn of(color: &Color) -> Self {
        match color {
            Color::Named(named) => match named {
                NamedColor::Black => Tint::Indexed(0),
                NamedColor::Red => Tint::Indexed(1),
                NamedColor::Green => Tint::Indexed(2),
                NamedColor::Yellow => Tint::Indexed(3),
                NamedColor::Blue => Tint::Indexed(4),
                NamedColor::Magenta => Tint::Indexed(5),
                NamedColor::Cyan => Tint::Indexed(6),
                NamedColor::White => Tint::Indexed(7),
                NamedColor::BrightBlack => Tint::Indexed(8),
                NamedColor::BrightRed => Tint::Indexed(9),
                NamedColor::BrightGreen => Tint::Indexed(10),
                NamedColor::BrightYellow => Tint::Indexed(11),
                NamedColor::BrightBlue => Tint::Indexed(12),
                NamedColor::BrightMagenta => Tint::Indexed(13),
                NamedColor::BrightCyan => Tint::Indexed(14),
                NamedColor::BrightWhite => Tint::Indexed(15),
                _ => Tint::Default,
            },
            Color::Spec(rgb) => Tint::Rgb(rgb.r, rgb.g, rgb.b),
            Color::Indexed(index) => Tint::Indexed(*index),
        }
    }

    /// `base` is 30 for foreground and 40 for background.
    fn push_sgr(self, base: u8, out: &mut String) {
        match self {
            Tint::Default => {}
            Tint::Indexed(index) if index < 8 => {
                out.push_str(&format!(";{}", base + index));
            }
            Tint::Indexed(index) if index < 16 => {
                out.push_str(&format!(";{}", base + 60 + index - 8));
            }
            Tint::Indexed(index) => out.push_str(&format!(";{};5;{}", base + 8, index)),
            Tint::Rgb(r, g, b) => out.push_str(&format!(";{};2;{};{};{}", base + 8, r, g, b)),
        }
    }
}

const ATTRIBUTES: [(CellFlags, u8); 11] = [
    (CellFlags::BOLD, 1),
    (CellFlags::DIM, 2),
    (CellFlags::ITALIC, 3),
    (CellFlags::UNDERLINE, 4),
    (CellFlags::DOUBLE_UNDERLINE, 4),
    (CellFlags::UNDERCURL, 4),
    (CellFlags::DOTTED_UNDERLINE, 4),
    (CellFlags::DASHED_UNDERLINE, 4),
    (CellFlags::INVERSE, 7),
    (CellFlags::HIDDEN, 8),
    (CellFlags::STRIKEOUT, 9),
];

/// Graphic rendition of one cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Pen {
    fg: Tint,
    bg: Tint,
    attributes: [bool; ATTRIBUTES.len()],
}

impl Pen {
    const PLAIN: Pen = Pen {
        fg: Tint::Default,
        bg: Tint::Default,
        attributes: [false; ATTRIBUTES.len()],
    };

    fn of(cell: &Cell) -> Self {
        let mut attributes = [false; ATTRIBUTES.len()];
        for (slot, (flag, _)) in attributes.iter_mut().zip(ATTRIBUTES.iter()) {
            *slot = cell.flags.contains(*flag);
        }
        Self {
            fg: Tint::of(&cell.fg),
            bg: Tint::of(&cell.bg),
            attributes,
        }
    }

    /// Always starts from a reset so the sequence does not depend on the
    /// viewer's current rendition.
    fn push_sgr(&self, out: &mut String) {
        out.push_str("\x1b[0");
        let mut last = 0;
        for ((_, code), set) in ATTRIBUTES.iter().zip(self.attributes.iter()) {
            if *set && *code != last {
                out.push_str(&format!(";{code}"));
                last = *code;
            }
        }
        self.fg.push_sgr(30, out);
        self.bg.push_sgr(40, out);
        out.push('m');
    }
}

/// True for glyphs and for blanks that still paint something.
fn is_visible(cell: &Cell) -> bool {
    let marks = CellFlags::INVERSE
        | CellFlags::STRIKEOUT
        | CellFlags::UNDERLINE
        | CellFlags::DOUBLE_UNDERLINE
        | CellFlags::UNDERCURL
        | CellFlags::DOTTED_UNDERLINE
        | CellFlags::DASHED_UNDERLINE;
    cell.c != ' ' || Tint::of(&cell.bg) != Tint::Default || cell.flags.intersects(marks)
}

fn render_line(cells: &[&Cell]) -> String {
    let end = cells.iter().rposition(|cell| is_visible(cell)).map_or(0, |last| last + 1);

    let mut text = String::with_capacity(end);
    let mut pen = Pen::PLAIN;
    for cell in &cells[..end] {
        let next = Pen::of(cell);
        if next != pen {
            next.push_sgr(&mut text);
            pen = next;
        }
        text.push(cell.c);
        if let Some(combining) = cell.zerowidth() {
            text.extend(combining.iter());
        }
    }
    if pen != Pen::PLAIN {
        Pen::PLAIN.push_sgr(&mut text);
    }
    text
}

/// Scrollback lines, then the visible screen, then a cursor-position
/// sequence. Styled runs carry their SGR and every line ends plain. When
/// scrollback is present every screen line is emitted so the last one lands
/// on the viewer's bottom row.
fn render_text(term: &Term<EventProxy>) -> String {
    let grid = term.grid();
    let columns = grid.columns();
    let history = grid.history_size() as i32;

    let mut lines: Vec<String> = Vec::with_capacity(grid.total_lines());
    let mut cells: Vec<&Cell> = Vec::with_capacity(columns);
    for index in grid.topmost_line().0..=grid.bottommost_line().0 {
        let line = Line(index);
        cells.clear();
        for col in 0..columns {
            let cell = &grid[Point::new(line, Column(col))];
            if cell
                .flags
                .intersects(CellFlags::WIDE_CHAR_SPACER | CellFlags::LEADING_WIDE_CHAR_SPACER)
            {
                continue;
            }
            cells.push(cell);
        }
        lines.push(render_line(&cells));
    }

    if history == 0 {
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
    }

    let cursor = grid.cursor.point;
    let at_origin = cursor.line.0 == 0 && cursor.column.0 == 0;
    if lines.is_empty() && at_origin {
        return String::new();
    }

    let mut out = lines.join("\r\n");
    out.push_str(&format!(
        "\x1b[{};{}H",
        cursor.line.0 + 1,
        cursor.column.0 + 1
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn fresh_screen_serializes_empty() {
        let screen = AlacrittyScreen::new(20, 5, 100);
        assert_eq!(screen.serialize().unwrap(), "");
    }

    #[test_timeout::timeout]
    fn written_text_appears_with_cursor_position() {
        let mut screen = AlacrittyScreen::new(20, 5, 100);
        screen.write(b"hello\r\nworld");
        assert_eq!(screen.serialize().unwrap(), "hello\r\nworld\x1b[2;6H");
    }

    #[test_timeout::timeout]
    fn reset_clears_previous_output() {
        let mut screen = AlacrittyScreen::new(20, 5, 100);
        screen.write(b"stale");
        screen.reset(10, 3);
        assert_eq!(screen.serialize().unwrap(), "");
        screen.write(b"AB");
        assert_eq!(screen.serialize().unwrap(), "AB\x1b[1;3H");
    }

    #[test_timeout::timeout]
    fn scrolled_lines_are_kept_in_history() {
        let mut screen = AlacrittyScreen::new(10, 2, 100);
        screen.write(b"one\r\ntwo\r\nthree");
        assert_eq!(screen.serialize().unwrap(), "one\r\ntwo\r\nthree\x1b[2;6H");
    }

    #[test_timeout::timeout]
    fn styled_runs_carry_their_rendition() {
        let mut screen = AlacrittyScreen::new(20, 5, 100);
        screen.write(b"\x1b[1;31mRED\x1b[0m plain");
        assert_eq!(
            screen.serialize().unwrap(),
            "\x1b[0;1;31mRED\x1b[0m plain\x1b[1;10H"
        );
    }

    #[test_timeout::timeout]
    fn coloured_background_keeps_trailing_blanks() {
        let mut screen = AlacrittyScreen::new(20, 5, 100);
        screen.write(b"\x1b[44m  ");
        assert_eq!(screen.serialize().unwrap(), "\x1b[0;44m  \x1b[0m\x1b[1;3H");
    }

    #[test_timeout::timeout]
    fn extended_colours_and_inverse_survive() {
        let mut screen = AlacrittyScreen::new(20, 5, 100);
        screen.write(b"\x1b[38;2;1;2;3mx\x1b[0;7;38;5;200my");
        assert_eq!(
            screen.serialize().unwrap(),
            "\x1b[0;38;2;1;2;3mx\x1b[0;7;38;5;200my\x1b[0m\x1b[1;3H"
        );
    }

    #[test_timeout::timeout]
    fn disposed_screen_refuses_to_serialize() {
        let mut screen = AlacrittyScreen::new(10, 2, 0);
        screen.dispose();
        screen.write(b"ignored");
        assert_eq!(screen.serialize(), Err(ScreenError::Disposed));
    }
}
