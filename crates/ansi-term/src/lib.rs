//! ANSI foreground colors for console output.
//!
//! [`WithFg`] wraps any `Display` value so that it is printed bold in the
//! given color, followed by a reset sequence.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::fmt;

/// Terminal foreground colors.
///
/// The `Light*` variants and [`DarkGray`](Self::DarkGray) use the bright
/// color codes (`90..=97`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    LightGray,
    DarkGray,
    LightRed,
    LightGreen,
    LightYellow,
    LightBlue,
    LightMagenta,
    LightCyan,
    White,
    Default,
}

impl Color {
    /// SGR parameter selecting this color as the foreground.
    #[must_use]
    pub const fn fg_code(self) -> u8 {
        match self {
            Self::Black => 30,
            Self::Red => 31,
            Self::Green => 32,
            Self::Yellow => 33,
            Self::Blue => 34,
            Self::Magenta => 35,
            Self::Cyan => 36,
            Self::LightGray => 37,
            Self::Default => 39,
            Self::DarkGray => 90,
            Self::LightRed => 91,
            Self::LightGreen => 92,
            Self::LightYellow => 93,
            Self::LightBlue => 94,
            Self::LightMagenta => 95,
            Self::LightCyan => 96,
            Self::White => 97,
        }
    }
}

/// A value printed bold with a foreground color.
pub struct WithFg<T> {
    color: Color,
    value: T,
}

impl<T> WithFg<T> {
    pub const fn new(color: Color, value: T) -> Self {
        Self { color, value }
    }
}

impl<T> fmt::Display for WithFg<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { color, value } = self;
        write!(f, "\x1B[{};1m{value}\x1B[0m", color.fg_code())
    }
}
