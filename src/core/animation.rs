//! Color animations
//!
//! An animation maps an update counter to a palette color. The service runs
//! a periodic task that asks the animation for the current color and
//! recolors through the normal apply path; the counter advances once per
//! update, so durations here are measured in updates, not raw ticks.

use super::color::HighlightColor;

/// A color-over-time program for an animated highlight.
pub trait HighlightAnimation: Send + Sync {
    /// Color for the given update counter value.
    fn color_at(&self, tick: u64) -> HighlightColor;

    /// Whether the animation has finished at this counter value. Infinite
    /// animations never complete.
    fn is_complete(&self, tick: u64) -> bool;

    /// Total length in updates; 0 for infinite animations.
    fn duration(&self) -> u64;
}

// =============================================================================
// MODELS
// =============================================================================

/// Cycles through the seven bright palette colors.
pub struct Rainbow;

impl Rainbow {
    const COLORS: [HighlightColor; 7] = [
        HighlightColor::Red,
        HighlightColor::Gold,
        HighlightColor::Yellow,
        HighlightColor::Green,
        HighlightColor::Aqua,
        HighlightColor::Blue,
        HighlightColor::LightPurple,
    ];
    const CYCLE: u64 = 10;
}

impl HighlightAnimation for Rainbow {
    fn color_at(&self, tick: u64) -> HighlightColor {
        Self::COLORS[((tick / Self::CYCLE) % Self::COLORS.len() as u64) as usize]
    }

    fn is_complete(&self, _tick: u64) -> bool {
        false
    }

    fn duration(&self) -> u64 {
        0
    }
}

/// Alternates between the primary color and white on a fixed beat.
pub struct Pulse {
    color: HighlightColor,
}

impl Pulse {
    const INTERVAL: u64 = 5;

    pub fn new(color: HighlightColor) -> Self {
        Self { color }
    }
}

impl HighlightAnimation for Pulse {
    fn color_at(&self, tick: u64) -> HighlightColor {
        if (tick / Self::INTERVAL) % 2 == 0 {
            self.color
        } else {
            HighlightColor::White
        }
    }

    fn is_complete(&self, _tick: u64) -> bool {
        false
    }

    fn duration(&self) -> u64 {
        0
    }
}

/// Like [`Pulse`] with a caller-chosen beat.
pub struct Blink {
    color: HighlightColor,
    interval: u64,
}

impl Blink {
    pub fn new(color: HighlightColor, interval: u64) -> Self {
        Self {
            color,
            interval: interval.max(1),
        }
    }
}

impl HighlightAnimation for Blink {
    fn color_at(&self, tick: u64) -> HighlightColor {
        if (tick / self.interval) % 2 == 0 {
            self.color
        } else {
            HighlightColor::White
        }
    }

    fn is_complete(&self, _tick: u64) -> bool {
        false
    }

    fn duration(&self) -> u64 {
        0
    }
}

/// Switches from one color to another at the halfway point, then completes.
pub struct Fade {
    from: HighlightColor,
    to: HighlightColor,
    duration: u64,
}

impl Fade {
    pub fn new(from: HighlightColor, to: HighlightColor, duration: u64) -> Self {
        Self { from, to, duration }
    }
}

impl HighlightAnimation for Fade {
    fn color_at(&self, tick: u64) -> HighlightColor {
        if tick >= self.duration || tick >= self.duration / 2 {
            self.to
        } else {
            self.from
        }
    }

    fn is_complete(&self, tick: u64) -> bool {
        tick >= self.duration
    }

    fn duration(&self) -> u64 {
        self.duration
    }
}

/// A constant color, useful as a degenerate animation.
pub struct Fixed {
    color: HighlightColor,
}

impl Fixed {
    pub fn new(color: HighlightColor) -> Self {
        Self { color }
    }
}

impl HighlightAnimation for Fixed {
    fn color_at(&self, _tick: u64) -> HighlightColor {
        self.color
    }

    fn is_complete(&self, _tick: u64) -> bool {
        false
    }

    fn duration(&self) -> u64 {
        0
    }
}

// =============================================================================
// TESTS
// =============================================================================
