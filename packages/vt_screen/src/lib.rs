//! Server-side VT100 terminal emulation with row-level diffing.
//!
//! Wraps the `vt100` parser to process raw terminal bytes and emit styled
//! text rows using only ANSI SGR (color/style) escape codes — clients never
//! see cursor-movement sequences; the cursor position travels as plain
//! fields on the update payloads.

mod render;

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// Changed rows since the last update or snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenUpdate {
    pub rows: HashMap<usize, String>,
    pub cursor_row: u16,
    pub cursor_col: u16,
}

impl ScreenUpdate {
    /// Merge a newer update into this one: newer row content replaces older,
    /// newest cursor position wins.
    pub fn merge(&mut self, newer: ScreenUpdate) {
        self.rows.extend(newer.rows);
        self.cursor_row = newer.cursor_row;
        self.cursor_col = newer.cursor_col;
    }
}

/// Full terminal screen state.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenSnapshot {
    pub rows: HashMap<usize, String>,
    pub cols: u16,
    pub num_rows: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
}

struct Inner {
    parser: vt100::Parser,
    cols: u16,
    rows: u16,
    /// Cached rendered rows — the diff baseline.
    prev_rows: Vec<String>,
}

/// A VT100 screen emulator that renders rows as SGR-styled text and diffs
/// them against the last observed state. All methods serialize on an
/// internal lock; `write` is safe to call from the reader task while
/// another task takes snapshots.
pub struct Screen {
    inner: Mutex<Inner>,
}

impl Screen {
    /// Create a new screen emulator with the given dimensions.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            inner: Mutex::new(Inner {
                parser: vt100::Parser::new(rows, cols, 0),
                cols,
                rows,
                prev_rows: vec![String::new(); rows as usize],
            }),
        }
    }

    /// Feed raw bytes through the emulator and return the rows whose
    /// rendered text changed. Returns `None` when nothing changed.
    pub fn write(&self, data: &[u8]) -> Option<ScreenUpdate> {
        let mut inner = self.inner.lock().expect("screen lock poisoned");
        inner.parser.process(data);

        let screen = inner.parser.screen();
        let (cursor_row, cursor_col) = screen.cursor_position();

        let mut changed = HashMap::new();
        for y in 0..inner.rows {
            let row = render::render_row(screen, y, inner.cols);
            if row != inner.prev_rows[y as usize] {
                changed.insert(y as usize, row);
            }
        }
        for (y, row) in &changed {
            inner.prev_rows[*y] = row.clone();
        }

        if changed.is_empty() {
            return None;
        }
        Some(ScreenUpdate {
            rows: changed,
            cursor_row,
            cursor_col,
        })
    }

    /// Return the full screen state and sync the diff baseline, so
    /// subsequent diffs are measured from this snapshot.
    pub fn snapshot(&self) -> ScreenSnapshot {
        let mut inner = self.inner.lock().expect("screen lock poisoned");
        let cols = inner.cols;
        let rows = inner.rows;

        let screen = inner.parser.screen();
        let (cursor_row, cursor_col) = screen.cursor_position();

        let mut all = HashMap::with_capacity(rows as usize);
        let mut rendered = Vec::with_capacity(rows as usize);
        for y in 0..rows {
            let row = render::render_row(screen, y, cols);
            all.insert(y as usize, row.clone());
            rendered.push(row);
        }
        inner.prev_rows = rendered;

        ScreenSnapshot {
            rows: all,
            cols,
            num_rows: rows,
            cursor_row,
            cursor_col,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Remove SGR escape sequences, leaving the plain text.
    fn strip_ansi(s: &str) -> String {
        let mut out = String::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\u{1b}' && chars.peek() == Some(&'[') {
                chars.next();
                for param in chars.by_ref() {
                    if param == 'm' {
                        break;
                    }
                }
                continue;
            }
            out.push(c);
        }
        out
    }

    #[test]
    fn new_screen_is_empty() {
        let s = Screen::new(80, 24);
        let snap = s.snapshot();
        assert_eq!(snap.cols, 80);
        assert_eq!(snap.num_rows, 24);
        assert_eq!(snap.cursor_row, 0);
        assert_eq!(snap.cursor_col, 0);
        for y in 0..24 {
            assert_eq!(snap.rows[&y], "");
        }
    }

    #[test]
    fn write_plain_text() {
        let s = Screen::new(80, 24);
        let update = s.write(b"hello world").expect("update");
        assert_eq!(update.rows[&0], "hello world");
        assert_eq!(update.cursor_col, 11);
    }

    #[test]
    fn write_with_newlines() {
        let s = Screen::new(80, 24);
        let update = s.write(b"line one\r\nline two\r\nline three").expect("update");
        assert_eq!(update.rows[&0], "line one");
        assert_eq!(update.rows[&1], "line two");
        assert_eq!(update.rows[&2], "line three");
    }

    #[test]
    fn write_with_colors() {
        let s = Screen::new(80, 24);
        let update = s.write(b"\x1b[31mhello\x1b[0m world").expect("update");
        let row = &update.rows[&0];
        assert!(row.contains("\x1b["), "expected SGR codes, got {row:?}");
        assert_eq!(strip_ansi(row), "hello world");
    }

    #[test]
    fn write_with_bold() {
        let s = Screen::new(80, 24);
        let update = s.write(b"\x1b[1mbold\x1b[0m normal").expect("update");
        let row = &update.rows[&0];
        assert!(
            row.contains("\x1b[1m") || row.contains(";1;") || row.contains(";1m"),
            "expected bold SGR, got {row:?}"
        );
        assert_eq!(strip_ansi(row), "bold normal");
    }

    #[test]
    fn cursor_movement_overwrites() {
        let s = Screen::new(80, 24);
        let update = s.write(b"hello\x1b[HHELLO").expect("update");
        assert_eq!(strip_ansi(&update.rows[&0]), "HELLO");
    }

    #[test]
    fn screen_clear() {
        let s = Screen::new(80, 24);
        s.write(b"old text");
        let update = s.write(b"\x1b[2J\x1b[Hnew text").expect("update");
        assert_eq!(strip_ansi(&update.rows[&0]), "new text");
    }

    #[test]
    fn diff_only_changed_rows() {
        let s = Screen::new(80, 24);
        s.write(b"initial");
        let update = s.write(b"\r\nsecond line").expect("update");
        assert!(!update.rows.contains_key(&0), "row 0 unchanged");
        assert!(update.rows.contains_key(&1));
    }

    #[test]
    fn no_update_when_nothing_changes() {
        let s = Screen::new(80, 24);
        s.write(b"hello");
        assert!(s.write(b"").is_none());
    }

    #[test]
    fn snapshot_syncs_baseline() {
        let s = Screen::new(80, 24);
        s.write(b"hello");
        let snap = s.snapshot();
        assert_eq!(snap.rows[&0], "hello");
        assert!(s.write(b"").is_none());
    }

    #[test]
    fn snapshot_is_idempotent() {
        let s = Screen::new(80, 24);
        s.write(b"\x1b[33msome styled\x1b[0m text\r\nsecond");
        let a = s.snapshot();
        let b = s.snapshot();
        assert_eq!(a, b);
    }

    #[test]
    fn scrolling() {
        let s = Screen::new(80, 5);
        s.write(b"line1\r\nline2\r\nline3\r\nline4\r\nline5");
        let snap = s.snapshot();
        assert_eq!(strip_ansi(&snap.rows[&0]), "line1");

        assert!(s.write(b"\r\nline6").is_some());
        let snap2 = s.snapshot();
        assert_eq!(strip_ansi(&snap2.rows[&0]), "line2");
        assert_eq!(strip_ansi(&snap2.rows[&4]), "line6");
    }

    #[test]
    fn color_256() {
        let s = Screen::new(80, 24);
        let update = s.write(b"\x1b[38;5;196mcolored\x1b[0m").expect("update");
        let row = &update.rows[&0];
        assert_eq!(strip_ansi(row), "colored");
        assert!(row.contains("38;5;196"), "expected 256-color SGR, got {row:?}");
    }

    #[test]
    fn truecolor_roundtrip() {
        let s = Screen::new(80, 24);
        let update = s.write(b"\x1b[38;2;10;20;30mrgb\x1b[0m").expect("update");
        assert!(update.rows[&0].contains("38;2;10;20;30"));
    }

    #[test]
    fn background_color() {
        let s = Screen::new(80, 24);
        let update = s.write(b"\x1b[42m bg \x1b[0m").expect("update");
        assert!(update.rows[&0].contains("\x1b["));
    }

    #[test]
    fn styled_then_partial_overwrite() {
        let s = Screen::new(80, 24);
        let snap_input = b"\x1b[31mhello\x1b[0m\r\nworld";
        s.write(snap_input);
        let snap = s.snapshot();
        assert_eq!(strip_ansi(&snap.rows[&0]), "hello");
        assert!(snap.rows[&0].contains("\x1b["));
        assert_eq!(snap.rows[&1], "world");

        assert!(s.write(b"").is_none());

        let update = s.write(b"\r\x1b[32mbye").expect("update");
        assert_eq!(update.rows.len(), 1);
        let row = &update.rows[&1];
        assert_eq!(strip_ansi(row), "byeld");
        assert!(row.contains("32") || row.contains("38;5;2"), "green SGR, got {row:?}");
    }

    #[test]
    fn trailing_style_gets_reset() {
        let s = Screen::new(80, 24);
        let update = s.write(b"\x1b[31mred to end of line").expect("update");
        assert!(update.rows[&0].ends_with("\x1b[0m"));
    }

    #[test]
    fn update_merge_prefers_newer() {
        let mut a = ScreenUpdate {
            rows: HashMap::from([(0, "old".into()), (1, "keep".into())]),
            cursor_row: 0,
            cursor_col: 3,
        };
        let b = ScreenUpdate {
            rows: HashMap::from([(0, "new".into()), (2, "more".into())]),
            cursor_row: 2,
            cursor_col: 4,
        };
        a.merge(b);
        assert_eq!(a.rows[&0], "new");
        assert_eq!(a.rows[&1], "keep");
        assert_eq!(a.rows[&2], "more");
        assert_eq!((a.cursor_row, a.cursor_col), (2, 4));
    }

    #[test]
    fn update_serializes_camel_case() {
        let s = Screen::new(80, 24);
        let update = s.write(b"x").expect("update");
        let json = serde_json::to_value(&update).unwrap();
        assert!(json.get("rows").is_some());
        assert!(json.get("cursorRow").is_some());
        assert!(json.get("cursorCol").is_some());
        assert_eq!(json["rows"]["0"], "x");
    }

    #[test]
    fn snapshot_serializes_dimensions() {
        let s = Screen::new(80, 24);
        let json = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(json["cols"], 80);
        assert_eq!(json["numRows"], 24);
    }

    #[test]
    fn wide_chars_do_not_duplicate() {
        let s = Screen::new(80, 24);
        let update = s.write("漢x".as_bytes()).expect("update");
        assert_eq!(strip_ansi(&update.rows[&0]), "漢x");
    }

    #[test]
    fn concurrent_writes_and_snapshots() {
        use std::sync::Arc;
        let s = Arc::new(Screen::new(80, 24));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let s = s.clone();
            handles.push(std::thread::spawn(move || {
                s.write(b"hello\r\n");
                s.snapshot();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
