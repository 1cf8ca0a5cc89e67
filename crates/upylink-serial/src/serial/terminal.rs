//! REPL terminal emulator.
//!
//! Renders the byte stream of a MicroPython REPL into a plain text buffer.
//! Only the subset of VT100 the REPL line editor emits is interpreted:
//! backspace, carriage return, line feed and `ESC [ n A|B|C|D|K`. Escape
//! sequences and UTF-8 code points split across reads are withheld until the
//! rest arrives, so the result does not depend on how the stream was chunked.
//!
//! Two cursors are tracked. The device cursor is where the device's line
//! editor believes the cursor is; the view cursor is where the user has put
//! it locally. Each `process_bytes` pass starts from the device cursor and
//! leaves both on the same position.

const ESC: u8 = 0x1b;
const BACKSPACE: u8 = 0x08;
const CR: u8 = b'\r';
const LF: u8 = b'\n';
/// Longest parameter run accepted inside a CSI sequence.
const MAX_CSI_PARAMS: usize = 16;

/// Result of scanning for an escape sequence at the start of a slice.
#[derive(Debug, PartialEq, Eq)]
enum Escape {
    /// Recognised cursor / erase sequence.
    Csi { len: usize, count: usize, action: u8 },
    /// Complete sequence the emulator does not act on.
    Ignored { len: usize },
    /// Not a sequence: skip this many bytes and rescan.
    Invalid { skip: usize },
    /// Cut off by the end of the data.
    Incomplete,
}

/// Result of decoding one code point.
#[derive(Debug, PartialEq, Eq)]
enum Decoded {
    Char(char, usize),
    Incomplete,
    Invalid,
}

#[derive(Debug, Clone, Default)]
pub struct TerminalEmulator {
    text: Vec<char>,
    view_cursor: usize,
    device_cursor: usize,
    unprocessed: Vec<u8>,
}

impl TerminalEmulator {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn text(&self) -> String {
        self.text.iter().collect()
    }

    pub fn view_cursor(&self) -> usize {
        self.view_cursor
    }

    pub fn device_cursor(&self) -> usize {
        self.device_cursor
    }

    /// Bytes held back from the last pass.
    pub fn unprocessed_input(&self) -> &[u8] {
        &self.unprocessed
    }

    /// Number of withheld bytes that start an undecoded UTF-8 code point.
    pub fn utf8_carry(&self) -> usize {
        match self.unprocessed.first() {
            Some(&ESC) | None => 0,
            Some(_) => self.unprocessed.len(),
        }
    }

    /// Move the local cursor, e.g. after a click. Clamped to the buffer.
    pub fn set_view_cursor(&mut self, pos: usize) {
        self.view_cursor = pos.min(self.text.len());
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.view_cursor = 0;
        self.device_cursor = 0;
        self.unprocessed.clear();
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Inbound
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Apply bytes received from the device.
    pub fn process_bytes(&mut self, data: &[u8]) {
        let mut input = std::mem::take(&mut self.unprocessed);
        input.extend_from_slice(data);
        self.view_cursor = self.device_cursor.min(self.text.len());

        let mut i = 0;
        while i < input.len() {
            match input[i] {
                BACKSPACE => {
                    self.move_left(1);
                    i += 1;
                }
                CR => i += 1,
                LF => {
                    self.newline();
                    i += 1;
                }
                ESC => match scan_escape(&input[i..]) {
                    Escape::Csi { len, count, action } => {
                        self.apply_csi(action, count);
                        i += len;
                    }
                    Escape::Ignored { len } => i += len,
                    Escape::Invalid { skip } => i += skip,
                    Escape::Incomplete => {
                        self.unprocessed = input[i..].to_vec();
                        break;
                    }
                },
                _ => match decode_char(&input[i..]) {
                    Decoded::Char(c, len) => {
                        self.put_char(c);
                        i += len;
                    }
                    Decoded::Invalid => {
                        self.put_char(char::REPLACEMENT_CHARACTER);
                        i += 1;
                    }
                    Decoded::Incomplete => {
                        self.unprocessed = input[i..].to_vec();
                        break;
                    }
                },
            }
        }
        self.device_cursor = self.view_cursor;
    }

    fn apply_csi(&mut self, action: u8, count: usize) {
        match action {
            b'A' => self.move_up(count),
            b'B' => self.move_down(count),
            b'C' => self.move_right(count),
            b'D' => self.move_left(count),
            b'K' => self.erase_to_eol(),
            _ => {}
        }
    }

    // ── Buffer geometry ─────────────────────────────────────────────

    fn line_start(&self, pos: usize) -> usize {
        self.text[..pos]
            .iter()
            .rposition(|&c| c == '\n')
            .map_or(0, |p| p + 1)
    }

    fn line_end(&self, pos: usize) -> usize {
        self.text[pos..]
            .iter()
            .position(|&c| c == '\n')
            .map_or(self.text.len(), |p| pos + p)
    }

    /// Column of `pos` within its line.
    pub fn column(&self, pos: usize) -> usize {
        let pos = pos.min(self.text.len());
        pos - self.line_start(pos)
    }

    // ── Cursor movement and editing ─────────────────────────────────

    fn move_left(&mut self, n: usize) {
        let start = self.line_start(self.view_cursor);
        self.view_cursor = self.view_cursor.saturating_sub(n).max(start);
    }

    fn move_right(&mut self, n: usize) {
        let end = self.line_end(self.view_cursor);
        self.view_cursor = self.view_cursor.saturating_add(n).min(end);
    }

    fn move_up(&mut self, n: usize) {
        let col = self.column(self.view_cursor);
        for _ in 0..n {
            let start = self.line_start(self.view_cursor);
            if start == 0 {
                break;
            }
            let prev_start = self.line_start(start - 1);
            let prev_len = start - 1 - prev_start;
            self.view_cursor = prev_start + col.min(prev_len);
        }
    }

    fn move_down(&mut self, n: usize) {
        let col = self.column(self.view_cursor);
        for _ in 0..n {
            let end = self.line_end(self.view_cursor);
            if end == self.text.len() {
                break;
            }
            let next_start = end + 1;
            let next_len = self.line_end(next_start) - next_start;
            self.view_cursor = next_start + col.min(next_len);
        }
    }

    fn erase_to_eol(&mut self) {
        let end = self.line_end(self.view_cursor);
        self.text.drain(self.view_cursor..end);
    }

    fn newline(&mut self) {
        let end = self.line_end(self.view_cursor);
        self.text.insert(end, '\n');
        self.view_cursor = end + 1;
    }

    /// Overwrite the character under the cursor, or insert at line end.
    fn put_char(&mut self, c: char) {
        if self.view_cursor < self.line_end(self.view_cursor) {
            self.text[self.view_cursor] = c;
        } else {
            self.text.insert(self.view_cursor, c);
        }
        self.view_cursor += 1;
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Outbound
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Arrow-key presses that walk the device cursor to the view cursor's
    /// column on the device's line. Empty when they already agree.
    pub fn cursor_sync_bytes(&self) -> Vec<u8> {
        let device = self.device_cursor.min(self.text.len());
        let start = self.line_start(device);
        let line_len = self.line_end(device) - start;
        let target = start + self.column(self.view_cursor).min(line_len);

        let (step, moves): (&[u8], usize) = if target > device {
            (b"\x1b[C", target - device)
        } else {
            (b"\x1b[D", device - target)
        };
        step.repeat(moves)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Scanners
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Scan `data`, which starts with ESC.
fn scan_escape(data: &[u8]) -> Escape {
    match data.get(1) {
        None => return Escape::Incomplete,
        Some(b'[') => {}
        // Lone ESC: drop it and rescan the next byte as ordinary data.
        Some(_) => return Escape::Invalid { skip: 1 },
    }

    let params_start = 2;
    let mut i = params_start;
    loop {
        let Some(&b) = data.get(i) else {
            return Escape::Incomplete;
        };
        match b {
            // Parameter and intermediate bytes.
            0x20..=0x3f => {
                if i - params_start >= MAX_CSI_PARAMS {
                    return Escape::Invalid { skip: 2 };
                }
                i += 1;
            }
            0x40..=0x7e => {
                let params = &data[params_start..i];
                let len = i + 1;
                let digits_only = params.iter().all(u8::is_ascii_digit);
                return match b {
                    b'A' | b'B' | b'C' | b'D' | b'K' if digits_only => Escape::Csi {
                        len,
                        count: parse_count(params),
                        action: b,
                    },
                    _ => Escape::Ignored { len },
                };
            }
            // Malformed: drop `ESC [` and rescan what follows.
            _ => return Escape::Invalid { skip: 2 },
        }
    }
}

fn parse_count(digits: &[u8]) -> usize {
    let n = digits
        .iter()
        .fold(0usize, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as usize));
    n.max(1)
}

/// Decode the code point starting at `data[0]`.
fn decode_char(data: &[u8]) -> Decoded {
    let window = &data[..data.len().min(4)];
    let valid = match std::str::from_utf8(window) {
        Ok(s) => s,
        Err(e) if e.valid_up_to() > 0 => {
            // `valid_up_to` lies on a char boundary.
            match std::str::from_utf8(&window[..e.valid_up_to()]) {
                Ok(s) => s,
                Err(_) => return Decoded::Invalid,
            }
        }
        Err(e) => {
            return match e.error_len() {
                None => Decoded::Incomplete,
                Some(_) => Decoded::Invalid,
            }
        }
    };
    match valid.chars().next() {
        Some(c) => Decoded::Char(c, c.len_utf8()),
        None => Decoded::Invalid,
    }
}
