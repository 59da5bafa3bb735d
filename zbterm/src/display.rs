//! Rendering of received bytes for the terminal.
//!
//! Output is always terminated with `\r\n` so it lines up while the terminal
//! is in raw mode.

use {
    console::style,
    std::{
        fmt::Write as _,
        time::{SystemTime, UNIX_EPOCH},
    },
    zbserial::format_hex,
};

/// Bytes per hex row.
const HEX_ROW: usize = 16;

/// `[hh:mm:ss.mmm] ` wall-clock prefix (UTC), dimmed when colors are on.
pub(crate) fn timestamp_prefix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let stamp = format!(
        "[{:02}:{:02}:{:02}.{:03}]",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    );
    format!("{} ", style(stamp).dim())
}

/// Decode as much of `buffer` as possible, replacing invalid sequences with
/// U+FFFD. An incomplete sequence at the end stays in `buffer` for the next
/// chunk.
pub(crate) fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                return output;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                output.push_str(&String::from_utf8_lossy(&buffer[..valid_up_to]));

                let Some(invalid_len) = err.error_len() else {
                    buffer.drain(..valid_up_to);
                    return output;
                };
                output.push(char::REPLACEMENT_CHARACTER);
                buffer.drain(..(valid_up_to + invalid_len).min(buffer.len()));
            },
        }
    }
}

/// Stateful text view of the received stream.
#[derive(Debug)]
pub(crate) struct TextRenderer {
    pending: Vec<u8>,
    at_line_start: bool,
    after_cr: bool,
}

impl Default for TextRenderer {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            at_line_start: true,
            after_cr: false,
        }
    }
}

impl TextRenderer {
    /// Render one received chunk.
    ///
    /// `\r`, `\n` and `\r\n` all end a line, even when a `\r\n` pair is split
    /// across chunks. Control characters other than tab and ESC are dropped.
    pub(crate) fn render(&mut self, bytes: &[u8], timestamps: bool) -> String {
        self.pending.extend_from_slice(bytes);
        let text = drain_utf8_lossy(&mut self.pending);

        let mut out = String::with_capacity(text.len() + 16);
        for c in text.chars() {
            let after_cr = std::mem::replace(&mut self.after_cr, c == '\r');
            match c {
                '\n' if after_cr => {},
                '\r' | '\n' => {
                    out.push_str("\r\n");
                    self.at_line_start = true;
                },
                c if c.is_control() && c != '\t' && c != '\x1b' => {},
                c => {
                    if timestamps && self.at_line_start {
                        out.push_str(&timestamp_prefix());
                    }
                    self.at_line_start = false;
                    out.push(c);
                },
            }
        }
        out
    }

    /// Line break needed before printing something else on its own line.
    pub(crate) fn break_line(&mut self) -> &'static str {
        if self.at_line_start {
            ""
        } else {
            self.at_line_start = true;
            "\r\n"
        }
    }
}

fn printable(row: &[u8]) -> String {
    row.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                char::from(b)
            } else {
                '.'
            }
        })
        .collect()
}

fn hex_row(out: &mut String, row: &[u8]) {
    let width = HEX_ROW * 3 - 1;
    let _ = write!(out, "{:<width$}  |{}|", format_hex(row), printable(row));
}

/// Hex rows for one received chunk, as shown by the monitor.
pub(crate) fn hex_rows(bytes: &[u8], timestamps: bool) -> String {
    let mut out = String::new();
    for row in bytes.chunks(HEX_ROW) {
        if timestamps {
            out.push_str(&timestamp_prefix());
        }
        hex_row(&mut out, row);
        out.push_str("\r\n");
    }
    out
}

/// Offset-annotated hex dump.
pub(crate) fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, row) in bytes.chunks(HEX_ROW).enumerate() {
        let _ = write!(out, "{:04x}  ", i * HEX_ROW);
        hex_row(&mut out, row);
        out.push('\n');
    }
    out
}
