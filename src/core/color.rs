//! Highlight color palette
//!
//! The palette covers the host protocol's full style-code space: sixteen
//! paintable colors plus the text style codes that share the same code
//! space but cannot color a highlight. Mutating calls validate with
//! [`HighlightColor::is_color`] and reject style codes.
//!
//! Use `HighlightColor::try_from(code)` to convert a raw palette index.

use std::collections::HashMap;

use num_enum::TryFromPrimitive;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A palette token understood by the wire protocol's group-create message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, Serialize, Deserialize)]
pub enum HighlightColor {
    // =========================================================================
    // Paintable colors (0x0 - 0xf)
    // =========================================================================
    Black = 0x0,
    DarkBlue = 0x1,
    DarkGreen = 0x2,
    DarkAqua = 0x3,
    DarkRed = 0x4,
    DarkPurple = 0x5,
    Gold = 0x6,
    Gray = 0x7,
    DarkGray = 0x8,
    Blue = 0x9,
    Green = 0xa,
    Aqua = 0xb,
    Red = 0xc,
    LightPurple = 0xd,
    Yellow = 0xe,
    White = 0xf,

    // =========================================================================
    // Style codes (share the code space, never paintable)
    // =========================================================================
    Obfuscated = 0x10,
    Bold = 0x11,
    Strikethrough = 0x12,
    Underline = 0x13,
    Italic = 0x14,
    Reset = 0x15,
}

/// The sixteen paintable colors, in palette order.
pub const PALETTE: [HighlightColor; 16] = [
    HighlightColor::Black,
    HighlightColor::DarkBlue,
    HighlightColor::DarkGreen,
    HighlightColor::DarkAqua,
    HighlightColor::DarkRed,
    HighlightColor::DarkPurple,
    HighlightColor::Gold,
    HighlightColor::Gray,
    HighlightColor::DarkGray,
    HighlightColor::Blue,
    HighlightColor::Green,
    HighlightColor::Aqua,
    HighlightColor::Red,
    HighlightColor::LightPurple,
    HighlightColor::Yellow,
    HighlightColor::White,
];

static CODE_INDEX: Lazy<HashMap<char, HighlightColor>> = Lazy::new(|| {
    let mut index = HashMap::new();
    for value in 0x0u8..=0x15 {
        let color = HighlightColor::try_from(value).expect("code space is contiguous");
        index.insert(color.code(), color);
    }
    index
});

impl HighlightColor {
    /// Whether this token can color a highlight group.
    pub fn is_color(self) -> bool {
        (self as u8) < 0x10
    }

    /// The stable one-character wire code (`0`-`f` for colors, `k`-`o` and
    /// `r` for style codes).
    pub fn code(self) -> char {
        match self {
            Self::Obfuscated => 'k',
            Self::Bold => 'l',
            Self::Strikethrough => 'm',
            Self::Underline => 'n',
            Self::Italic => 'o',
            Self::Reset => 'r',
            color => char::from_digit(color as u32, 16).expect("color codes are hex digits"),
        }
    }

    /// Look a token up by its wire code.
    pub fn from_code(code: char) -> Option<Self> {
        CODE_INDEX.get(&code.to_ascii_lowercase()).copied()
    }
}

// =============================================================================
// TESTS
// =============================================================================
