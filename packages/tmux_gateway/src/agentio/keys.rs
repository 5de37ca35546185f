//! Translation of VT escape sequences to the symbolic key names tmux
//! understands. Sequences not in the table are sent as raw bytes instead.

/// Map a client keystroke payload to a tmux key name, if it is one of the
/// recognized VT sequences.
pub fn tmux_key_name(payload: &[u8]) -> Option<&'static str> {
    let name = match payload {
        b"\x1b[Z" => "BTab",

        // Arrow keys, CSI and SS3 forms
        b"\x1b[A" | b"\x1bOA" => "Up",
        b"\x1b[B" | b"\x1bOB" => "Down",
        b"\x1b[C" | b"\x1bOC" => "Right",
        b"\x1b[D" | b"\x1bOD" => "Left",

        // Home/End, CSI and SS3 forms
        b"\x1b[H" | b"\x1bOH" => "Home",
        b"\x1b[F" | b"\x1bOF" => "End",

        b"\x1b[5~" => "PgUp",
        b"\x1b[6~" => "PgDn",
        b"\x1b[2~" => "IC",
        b"\x1b[3~" => "DC",

        // F1-F4 arrive as SS3, F5-F12 as CSI
        b"\x1bOP" => "F1",
        b"\x1bOQ" => "F2",
        b"\x1bOR" => "F3",
        b"\x1bOS" => "F4",
        b"\x1b[15~" => "F5",
        b"\x1b[17~" => "F6",
        b"\x1b[18~" => "F7",
        b"\x1b[19~" => "F8",
        b"\x1b[20~" => "F9",
        b"\x1b[21~" => "F10",
        b"\x1b[23~" => "F11",
        b"\x1b[24~" => "F12",

        b"\x1b" => "Escape",
        b"\x7f" => "BSpace",

        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_known_sequences() {
        let cases: &[(&[u8], &str)] = &[
            (b"\x1b[Z", "BTab"),
            (b"\x1b[A", "Up"),
            (b"\x1b[B", "Down"),
            (b"\x1b[C", "Right"),
            (b"\x1b[D", "Left"),
            (b"\x1bOA", "Up"),
            (b"\x1bOB", "Down"),
            (b"\x1bOC", "Right"),
            (b"\x1bOD", "Left"),
            (b"\x1b[H", "Home"),
            (b"\x1b[F", "End"),
            (b"\x1bOH", "Home"),
            (b"\x1bOF", "End"),
            (b"\x1b[5~", "PgUp"),
            (b"\x1b[6~", "PgDn"),
            (b"\x1b[2~", "IC"),
            (b"\x1b[3~", "DC"),
            (b"\x1bOP", "F1"),
            (b"\x1bOQ", "F2"),
            (b"\x1bOR", "F3"),
            (b"\x1bOS", "F4"),
            (b"\x1b[15~", "F5"),
            (b"\x1b[17~", "F6"),
            (b"\x1b[18~", "F7"),
            (b"\x1b[19~", "F8"),
            (b"\x1b[20~", "F9"),
            (b"\x1b[21~", "F10"),
            (b"\x1b[23~", "F11"),
            (b"\x1b[24~", "F12"),
            (b"\x1b", "Escape"),
            (b"\x7f", "BSpace"),
        ];
        for (payload, want) in cases {
            assert_eq!(tmux_key_name(payload), Some(*want), "payload {payload:?}");
        }
    }

    #[test]
    fn unknown_sequences() {
        for payload in [&b"not-a-vt-seq"[..], b"a", b"\x1b[99~", b""] {
            assert_eq!(tmux_key_name(payload), None, "payload {payload:?}");
        }
    }
}
