//! Input requests handed to an input backend.
//!
//! Covers key names, mouse coordinate modes and the seeded key timing
//! that decides how long each key stays down.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ApiError;

/// Keys the bot knows how to press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    O,
    P,
    Q,
    R,
    S,
    T,
    U,
    V,
    W,
    X,
    Y,
    Z,
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    PageUp,
    PageDown,
    Insert,
    Delete,
    Enter,
    Space,
    Tilde,
    Quote,
    Semicolon,
    Comma,
    Period,
    Slash,
    Esc,
    Shift,
    Ctrl,
    Alt,
    Backspace,
}

impl KeyKind {
    pub const ALL: [KeyKind; 71] = [
        KeyKind::A,
        KeyKind::B,
        KeyKind::C,
        KeyKind::D,
        KeyKind::E,
        KeyKind::F,
        KeyKind::G,
        KeyKind::H,
        KeyKind::I,
        KeyKind::J,
        KeyKind::K,
        KeyKind::L,
        KeyKind::M,
        KeyKind::N,
        KeyKind::O,
        KeyKind::P,
        KeyKind::Q,
        KeyKind::R,
        KeyKind::S,
        KeyKind::T,
        KeyKind::U,
        KeyKind::V,
        KeyKind::W,
        KeyKind::X,
        KeyKind::Y,
        KeyKind::Z,
        KeyKind::Zero,
        KeyKind::One,
        KeyKind::Two,
        KeyKind::Three,
        KeyKind::Four,
        KeyKind::Five,
        KeyKind::Six,
        KeyKind::Seven,
        KeyKind::Eight,
        KeyKind::Nine,
        KeyKind::F1,
        KeyKind::F2,
        KeyKind::F3,
        KeyKind::F4,
        KeyKind::F5,
        KeyKind::F6,
        KeyKind::F7,
        KeyKind::F8,
        KeyKind::F9,
        KeyKind::F10,
        KeyKind::F11,
        KeyKind::F12,
        KeyKind::Up,
        KeyKind::Down,
        KeyKind::Left,
        KeyKind::Right,
        KeyKind::Home,
        KeyKind::End,
        KeyKind::PageUp,
        KeyKind::PageDown,
        KeyKind::Insert,
        KeyKind::Delete,
        KeyKind::Enter,
        KeyKind::Space,
        KeyKind::Tilde,
        KeyKind::Quote,
        KeyKind::Semicolon,
        KeyKind::Comma,
        KeyKind::Period,
        KeyKind::Slash,
        KeyKind::Esc,
        KeyKind::Shift,
        KeyKind::Ctrl,
        KeyKind::Alt,
        KeyKind::Backspace,
    ];

    /// Canonical name, identical to the serde representation.
    pub fn name(&self) -> &'static str {
        match self {
            KeyKind::A => "a",
            KeyKind::B => "b",
            KeyKind::C => "c",
            KeyKind::D => "d",
            KeyKind::E => "e",
            KeyKind::F => "f",
            KeyKind::G => "g",
            KeyKind::H => "h",
            KeyKind::I => "i",
            KeyKind::J => "j",
            KeyKind::K => "k",
            KeyKind::L => "l",
            KeyKind::M => "m",
            KeyKind::N => "n",
            KeyKind::O => "o",
            KeyKind::P => "p",
            KeyKind::Q => "q",
            KeyKind::R => "r",
            KeyKind::S => "s",
            KeyKind::T => "t",
            KeyKind::U => "u",
            KeyKind::V => "v",
            KeyKind::W => "w",
            KeyKind::X => "x",
            KeyKind::Y => "y",
            KeyKind::Z => "z",
            KeyKind::Zero => "zero",
            KeyKind::One => "one",
            KeyKind::Two => "two",
            KeyKind::Three => "three",
            KeyKind::Four => "four",
            KeyKind::Five => "five",
            KeyKind::Six => "six",
            KeyKind::Seven => "seven",
            KeyKind::Eight => "eight",
            KeyKind::Nine => "nine",
            KeyKind::F1 => "f1",
            KeyKind::F2 => "f2",
            KeyKind::F3 => "f3",
            KeyKind::F4 => "f4",
            KeyKind::F5 => "f5",
            KeyKind::F6 => "f6",
            KeyKind::F7 => "f7",
            KeyKind::F8 => "f8",
            KeyKind::F9 => "f9",
            KeyKind::F10 => "f10",
            KeyKind::F11 => "f11",
            KeyKind::F12 => "f12",
            KeyKind::Up => "up",
            KeyKind::Down => "down",
            KeyKind::Left => "left",
            KeyKind::Right => "right",
            KeyKind::Home => "home",
            KeyKind::End => "end",
            KeyKind::PageUp => "page_up",
            KeyKind::PageDown => "page_down",
            KeyKind::Insert => "insert",
            KeyKind::Delete => "delete",
            KeyKind::Enter => "enter",
            KeyKind::Space => "space",
            KeyKind::Tilde => "tilde",
            KeyKind::Quote => "quote",
            KeyKind::Semicolon => "semicolon",
            KeyKind::Comma => "comma",
            KeyKind::Period => "period",
            KeyKind::Slash => "slash",
            KeyKind::Esc => "esc",
            KeyKind::Shift => "shift",
            KeyKind::Ctrl => "ctrl",
            KeyKind::Alt => "alt",
            KeyKind::Backspace => "backspace",
        }
    }

    /// Parse a key name, case-insensitive, accepting common aliases.
    ///
    /// Returns None if the name is not recognized.
    pub fn from_name(name: &str) -> Option<KeyKind> {
        let lower = name.trim().to_lowercase();
        let alias = match lower.as_str() {
            "0" => Some(KeyKind::Zero),
            "1" => Some(KeyKind::One),
            "2" => Some(KeyKind::Two),
            "3" => Some(KeyKind::Three),
            "4" => Some(KeyKind::Four),
            "5" => Some(KeyKind::Five),
            "6" => Some(KeyKind::Six),
            "7" => Some(KeyKind::Seven),
            "8" => Some(KeyKind::Eight),
            "9" => Some(KeyKind::Nine),
            "escape" => Some(KeyKind::Esc),
            "return" => Some(KeyKind::Enter),
            "pageup" | "pgup" => Some(KeyKind::PageUp),
            "pagedown" | "pgdn" => Some(KeyKind::PageDown),
            "del" => Some(KeyKind::Delete),
            "ins" => Some(KeyKind::Insert),
            "control" => Some(KeyKind::Ctrl),
            "`" | "~" => Some(KeyKind::Tilde),
            "'" => Some(KeyKind::Quote),
            ";" => Some(KeyKind::Semicolon),
            "," => Some(KeyKind::Comma),
            "." => Some(KeyKind::Period),
            "/" => Some(KeyKind::Slash),
            " " => Some(KeyKind::Space),
            _ => None,
        };
        alias.or_else(|| KeyKind::ALL.iter().copied().find(|k| k.name() == lower))
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyKind::from_name(s).ok_or_else(|| ApiError::unknown_key(s))
    }
}

/// Horizontal direction on the minimap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Direction from `from_x` towards `to_x`, None when already aligned.
    pub fn towards(from_x: i32, to_x: i32) -> Option<Direction> {
        match to_x.cmp(&from_x) {
            std::cmp::Ordering::Greater => Some(Direction::Right),
            std::cmp::Ordering::Less => Some(Direction::Left),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn key(&self) -> KeyKind {
        match self {
            Direction::Left => KeyKind::Left,
            Direction::Right => KeyKind::Right,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

/// How mouse coordinates are expressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateMode {
    /// Offset within the captured game-window rectangle.
    #[default]
    Relative,
    /// Absolute monitor coordinates.
    Screen,
}

/// The captured game window in screen coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl WindowRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseAction {
    Move,
    Click,
    ScrollDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseRequest {
    pub action: MouseAction,
    pub x: i32,
    pub y: i32,
    pub coordinate_mode: CoordinateMode,
}

impl MouseRequest {
    /// A request expressed relative to the game window.
    pub fn relative(action: MouseAction, x: i32, y: i32) -> Self {
        Self {
            action,
            x,
            y,
            coordinate_mode: CoordinateMode::Relative,
        }
    }

    /// Re-express the coordinates in `mode` using the window origin.
    ///
    /// Converting into the mode the request is already in is a no-op.
    pub fn convert(self, mode: CoordinateMode, window: WindowRect) -> MouseRequest {
        let (x, y) = match (self.coordinate_mode, mode) {
            (CoordinateMode::Relative, CoordinateMode::Screen) => {
                (self.x.saturating_add(window.x), self.y.saturating_add(window.y))
            }
            (CoordinateMode::Screen, CoordinateMode::Relative) => {
                (self.x.saturating_sub(window.x), self.y.saturating_sub(window.y))
            }
            _ => (self.x, self.y),
        };
        MouseRequest {
            x,
            y,
            coordinate_mode: mode,
            ..self
        }
    }
}

/// Press `key`, hold it for at least `down_ms`, release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRequest {
    pub key: KeyKind,
    pub down_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputTarget {
    Key(KeyRequest),
    /// Press and keep holding until a matching `KeyUp`.
    KeyDown { key: KeyKind },
    KeyUp { key: KeyKind },
    Mouse(MouseRequest),
}

/// A single request for the input backend. Built per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub target: InputTarget,
}

impl InputRequest {
    pub fn key(key: KeyKind, down_ms: u64) -> Self {
        Self {
            target: InputTarget::Key(KeyRequest { key, down_ms }),
        }
    }

    pub fn key_down(key: KeyKind) -> Self {
        Self {
            target: InputTarget::KeyDown { key },
        }
    }

    pub fn key_up(key: KeyKind) -> Self {
        Self {
            target: InputTarget::KeyUp { key },
        }
    }

    pub fn mouse(request: MouseRequest) -> Self {
        Self {
            target: InputTarget::Mouse(request),
        }
    }
}

/// Per-process random seed.
///
/// Generated once, persisted, and shared with a remote executor during
/// the protocol's init exchange so both sides derive the same jitter.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Seed(pub [u8; 32]);

impl Seed {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse 64 hex characters. Returns None on any other input.
    pub fn from_hex(hex: &str) -> Option<Seed> {
        let hex = hex.trim();
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Seed(bytes))
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a prefix, the full seed does not belong in logs.
        write!(f, "Seed({}..)", &self.to_hex()[..8])
    }
}

impl Serialize for Seed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Seed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Seed::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom("seed must be 64 hexadecimal characters"))
    }
}

/// Bounds for key hold times and inter-keystroke gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyTimingConfig {
    pub down_min_ms: u64,
    pub down_jitter_ms: u64,
    pub gap_min_ms: u64,
    pub gap_jitter_ms: u64,
}

impl Default for KeyTimingConfig {
    fn default() -> Self {
        Self {
            down_min_ms: 40,
            down_jitter_ms: 35,
            gap_min_ms: 25,
            gap_jitter_ms: 30,
        }
    }
}

/// Deterministic key timing derived from the session seed.
///
/// Two `KeyTiming`s built from the same seed and config produce the same
/// sequence, which is what lets a remote executor reproduce our jitter.
#[derive(Debug, Clone)]
pub struct KeyTiming {
    rng: StdRng,
    config: KeyTimingConfig,
}

impl KeyTiming {
    pub fn from_seed(seed: Seed, config: KeyTimingConfig) -> Self {
        Self {
            rng: StdRng::from_seed(seed.0),
            config,
        }
    }

    /// How long the next key press stays down, in milliseconds.
    pub fn next_down_ms(&mut self) -> u64 {
        self.config.down_min_ms + self.rng.gen_range(0..=self.config.down_jitter_ms)
    }

    /// Delay inserted after a key press before the next one.
    pub fn next_gap(&mut self) -> Duration {
        let ms = self.config.gap_min_ms + self.rng.gen_range(0..=self.config.gap_jitter_ms);
        Duration::from_millis(ms)
    }
}
