//! Key translation for the REPL.
//!
//! Turns key presses into the bytes a MicroPython line editor expects and
//! intercepts the clipboard shortcuts so they never reach the device.

use crate::serial::terminal::TerminalEmulator;
use serde::{Deserialize, Serialize};

/// A key, independent of any UI toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Key {
    /// Printable character, already shifted.
    Char(char),
    Backspace,
    Delete,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    Enter,
    Tab,
    Escape,
}

/// Physical modifier keys held during a press. `meta` is the Command key
/// on macOS and the Super / Windows key elsewhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Platform {
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInput {
    pub key: Key,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl KeyInput {
    pub fn plain(key: Key) -> Self {
        Self {
            key,
            modifiers: Modifiers::default(),
        }
    }

    pub fn ctrl(c: char) -> Self {
        Self {
            key: Key::Char(c),
            modifiers: Modifiers {
                ctrl: true,
                ..Default::default()
            },
        }
    }
}

/// What the caller should do with a key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Write these bytes to the device.
    Send(Vec<u8>),
    /// Copy the current selection; nothing goes to the device.
    Copy,
    /// Paste the clipboard through `paste_bytes`.
    Paste,
    Ignored,
}

/// Translate one key press, without cursor synchronisation.
pub fn translate_key(input: &KeyInput, platform: Platform) -> KeyOutcome {
    let m = input.modifiers;

    if let Key::Char(c) = input.key {
        let letter = c.to_ascii_lowercase();
        let clipboard_chord = match platform {
            Platform::MacOs => m.meta && !m.ctrl,
            Platform::Other => m.ctrl && m.shift,
        };
        if clipboard_chord {
            match letter {
                'c' => return KeyOutcome::Copy,
                'v' => return KeyOutcome::Paste,
                _ => {}
            }
        }
        if m.meta {
            return KeyOutcome::Ignored;
        }
        if m.ctrl {
            return match letter {
                'a'..='z' => KeyOutcome::Send(vec![1 + (letter as u8 - b'a')]),
                _ => KeyOutcome::Ignored,
            };
        }
    }

    let bytes: Vec<u8> = match input.key {
        Key::Char(c) => {
            let mut buf = [0u8; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        }
        Key::Backspace => b"\x08".to_vec(),
        Key::Delete => b"\x1b[3~".to_vec(),
        Key::Up => b"\x1b[A".to_vec(),
        Key::Down => b"\x1b[B".to_vec(),
        Key::Right => b"\x1b[C".to_vec(),
        Key::Left => b"\x1b[D".to_vec(),
        Key::Home => b"\x1b[H".to_vec(),
        Key::End => b"\x1b[F".to_vec(),
        Key::Enter => b"\r".to_vec(),
        Key::Tab => b"\t".to_vec(),
        Key::Escape => b"\x1b".to_vec(),
    };
    KeyOutcome::Send(bytes)
}

/// Keys that act on the character at the cursor.
fn edits_at_cursor(key: Key) -> bool {
    matches!(key, Key::Char(_) | Key::Backspace | Key::Delete)
}

/// Translate a key press, first walking the device cursor to where the
/// user moved the view cursor when the key edits text.
pub fn key_bytes(term: &TerminalEmulator, input: &KeyInput, platform: Platform) -> KeyOutcome {
    match translate_key(input, platform) {
        KeyOutcome::Send(bytes) if edits_at_cursor(input.key) && !is_control(&bytes) => {
            let mut out = term.cursor_sync_bytes();
            out.extend_from_slice(&bytes);
            KeyOutcome::Send(out)
        }
        other => other,
    }
}

fn is_control(bytes: &[u8]) -> bool {
    matches!(bytes, [b] if *b < 0x20 && *b != 0x08)
}

/// Bytes to send for pasted text: line breaks become carriage returns.
pub fn paste_bytes(text: &str) -> Vec<u8> {
    text.replace('\n', "\r").replace("\r\r", "\r").into_bytes()
}
