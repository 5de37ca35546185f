//! Row rendering: styled cells to text with ANSI SGR escape codes.

use vt100::Color;

/// The style attributes tracked per cell.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Style {
    fg: Color,
    bg: Color,
    bold: bool,
    italic: bool,
    underline: bool,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            fg: Color::Default,
            bg: Color::Default,
            bold: false,
            italic: false,
            underline: false,
        }
    }
}

fn cell_style(cell: &vt100::Cell) -> Style {
    Style {
        fg: cell.fgcolor(),
        bg: cell.bgcolor(),
        bold: cell.bold(),
        italic: cell.italic(),
        underline: cell.underline(),
    }
}

fn is_trivial(cell: &vt100::Cell) -> bool {
    let contents = cell.contents();
    (contents.is_empty() || contents == " ") && cell_style(cell) == Style::default()
}

/// Render a single row as text with SGR styling. Scans left to right up to
/// the last column with non-trivial content; returns an empty string for an
/// entirely empty row.
pub(crate) fn render_row(screen: &vt100::Screen, row: u16, cols: u16) -> String {
    let mut last_col: Option<u16> = None;
    for col in (0..cols).rev() {
        if let Some(cell) = screen.cell(row, col) {
            if !is_trivial(cell) {
                last_col = Some(col);
                break;
            }
        }
    }
    let Some(last_col) = last_col else {
        return String::new();
    };

    let mut out = String::new();
    let mut cur = Style::default();
    let mut styled = false;

    for col in 0..=last_col {
        let Some(cell) = screen.cell(row, col) else {
            continue;
        };
        // Wide characters occupy two columns; the continuation cell is
        // already covered by the character itself.
        if cell.is_wide_continuation() {
            continue;
        }

        let style = cell_style(cell);
        if style != cur {
            emit_sgr(&mut out, &mut cur, style);
            styled = true;
        }

        let contents = cell.contents();
        if contents.is_empty() {
            out.push(' ');
        } else {
            out.push_str(&contents);
        }
    }

    // Reset at end of row if any style is still active.
    if styled && cur != Style::default() {
        out.push_str("\x1b[0m");
    }

    out
}

/// Emit the SGR sequence transitioning from `cur` to `next`, updating `cur`.
/// If any attribute is dropped, a full reset is emitted and the still-active
/// attributes are re-applied.
fn emit_sgr(out: &mut String, cur: &mut Style, next: Style) {
    let mut params: Vec<String> = Vec::new();

    let needs_reset = (cur.bold && !next.bold)
        || (cur.italic && !next.italic)
        || (cur.underline && !next.underline)
        || (next.fg == Color::Default && cur.fg != Color::Default)
        || (next.bg == Color::Default && cur.bg != Color::Default);

    if needs_reset {
        params.push("0".into());
        *cur = Style::default();
    }

    if next.bold && !cur.bold {
        params.push("1".into());
    }
    if next.italic && !cur.italic {
        params.push("3".into());
    }
    if next.underline && !cur.underline {
        params.push("4".into());
    }
    if next.fg != cur.fg {
        params.push(fg_sgr(next.fg));
    }
    if next.bg != cur.bg {
        params.push(bg_sgr(next.bg));
    }

    if !params.is_empty() {
        out.push_str("\x1b[");
        out.push_str(&params.join(";"));
        out.push('m');
    }

    *cur = next;
}

/// SGR parameter(s) for a foreground color: basic 30–37, bright 90–97,
/// 256-color and true-color forms.
fn fg_sgr(color: Color) -> String {
    match color {
        Color::Default => "39".into(),
        Color::Idx(n) if n < 8 => format!("{}", 30 + n as u16),
        Color::Idx(n) if n < 16 => format!("{}", 90 + n as u16 - 8),
        Color::Idx(n) => format!("38;5;{n}"),
        Color::Rgb(r, g, b) => format!("38;2;{r};{g};{b}"),
    }
}

/// SGR parameter(s) for a background color: basic 40–47, bright 100–107,
/// 256-color and true-color forms.
fn bg_sgr(color: Color) -> String {
    match color {
        Color::Default => "49".into(),
        Color::Idx(n) if n < 8 => format!("{}", 40 + n as u16),
        Color::Idx(n) if n < 16 => format!("{}", 100 + n as u16 - 8),
        Color::Idx(n) => format!("48;5;{n}"),
        Color::Rgb(r, g, b) => format!("48;2;{r};{g};{b}"),
    }
}
