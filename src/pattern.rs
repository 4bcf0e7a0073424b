// src/pattern.rs

//! Frame content generator: a color-cycling border around a dark field of
//! drifting dots and sparse sparkles.
//!
//! The generator is a pure pixel producer. It owns no display resources and
//! has no failure modes; the flip scheduler hands it a mapped framebuffer
//! once per frame. All animation state lives in [`PatternState`], one
//! instance per output.

use bitflags::bitflags;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::PatternConfig;

/// Ramp bounds for the border color channels. Each channel advances by a
/// random step below its bound, so the three channels cycle at different
/// rates.
const RED_STEP_BOUND: u8 = 20;
const GREEN_STEP_BOUND: u8 = 10;
const BLUE_STEP_BOUND: u8 = 5;

/// Per-pixel odds of a sparkle inside the interior region.
const SPARKLE_NUMERATOR: u32 = 35;
const SPARKLE_DENOMINATOR: u32 = 130_000;

/// Edge length of the square drawn for each dot, in pixels.
const DOT_SIZE: i32 = 2;

/// Undirected jitter applied to each dot axis per advance.
const DOT_JITTER: i32 = 4;

/// Upper bound (exclusive) for the directed step applied along the drift
/// axis per advance.
const DOT_DRIFT_BOUND: i32 = 8;

const WHITE: u32 = 0x00ff_ffff;
const BLACK: u32 = 0x0000_0000;

bitflags! {
    /// Direction bits for the border color ramps. A set bit means the
    /// channel is currently rising; it flips when the ramp saturates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelRising: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
    }
}

/// Drift direction for the dot field, commanded from the input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Up,
    Down,
    Left,
    #[default]
    Right,
}

/// Per-output animation state, advanced once per presented frame.
#[derive(Debug)]
pub struct PatternState {
    r: u8,
    g: u8,
    b: u8,
    rising: ChannelRising,
    drift: Direction,
    dots: Vec<(i32, i32)>,
    inset_x: u32,
    inset_y: u32,
    rng: StdRng,
}

impl PatternState {
    /// Builds state for an output of the given mode size. Channel values
    /// and dot positions start randomized so multiple outputs do not cycle
    /// in lockstep.
    pub fn new(width: u32, height: u32, config: &PatternConfig) -> Self {
        Self::with_rng(width, height, config, StdRng::from_entropy())
    }

    /// Like [`PatternState::new`] with a caller-provided RNG. Tests seed
    /// this for determinism.
    pub fn with_rng(width: u32, height: u32, config: &PatternConfig, mut rng: StdRng) -> Self {
        // The dot field lives inside the interior region; a mode smaller
        // than twice the inset has no interior and gets no dots.
        let (x0, x1, y0, y1) = interior_bounds(width, height, config.inset_x, config.inset_y);
        let dots = if x0 < x1 && y0 < y1 {
            (0..config.dot_count)
                .map(|_| (rng.gen_range(x0..x1) as i32, rng.gen_range(y0..y1) as i32))
                .collect()
        } else {
            Vec::new()
        };

        PatternState {
            r: rng.gen(),
            g: rng.gen(),
            b: rng.gen(),
            rising: ChannelRising::all(),
            drift: Direction::default(),
            dots,
            inset_x: config.inset_x,
            inset_y: config.inset_y,
            rng,
        }
    }

    /// Sets the drift direction read on the next render.
    pub fn set_drift(&mut self, direction: Direction) {
        self.drift = direction;
    }

    pub fn drift(&self) -> Direction {
        self.drift
    }

    /// Current border color as a packed 0x00RRGGBB value.
    pub fn border_color(&self) -> u32 {
        pack(self.r, self.g, self.b)
    }

    /// Walks every dot: undirected jitter on both axes plus a directed step
    /// along the drift axis, clamped to the interior region. Called by the
    /// scheduler after a flip was accepted, so a rejected frame does not
    /// advance the field.
    pub fn advance_dots(&mut self, width: u32, height: u32) {
        let (x0, x1, y0, y1) = interior_bounds(width, height, self.inset_x, self.inset_y);
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let (dx, dy) = match self.drift {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        };
        for dot in &mut self.dots {
            let step = self.rng.gen_range(0..DOT_DRIFT_BOUND);
            dot.0 += self.rng.gen_range(-DOT_JITTER..=DOT_JITTER) + dx * step;
            dot.1 += self.rng.gen_range(-DOT_JITTER..=DOT_JITTER) + dy * step;
            dot.0 = dot.0.clamp(x0 as i32, x1 as i32 - 1);
            dot.1 = dot.1.clamp(y0 as i32, y1 as i32 - 1);
        }
    }

    fn next_channel(rng: &mut StdRng, rising: bool, current: u8, bound: u8) -> (u8, bool) {
        let step = rng.gen_range(0..bound);
        let (next, overflowed) = if rising {
            current.overflowing_add(step)
        } else {
            current.overflowing_sub(step)
        };
        // Saturation reverses the ramp and holds the value for one frame.
        if overflowed {
            (current, !rising)
        } else {
            (next, rising)
        }
    }

    fn advance_channels(&mut self) {
        let (r, r_up) = Self::next_channel(
            &mut self.rng,
            self.rising.contains(ChannelRising::RED),
            self.r,
            RED_STEP_BOUND,
        );
        let (g, g_up) = Self::next_channel(
            &mut self.rng,
            self.rising.contains(ChannelRising::GREEN),
            self.g,
            GREEN_STEP_BOUND,
        );
        let (b, b_up) = Self::next_channel(
            &mut self.rng,
            self.rising.contains(ChannelRising::BLUE),
            self.b,
            BLUE_STEP_BOUND,
        );
        self.r = r;
        self.g = g;
        self.b = b;
        self.rising.set(ChannelRising::RED, r_up);
        self.rising.set(ChannelRising::GREEN, g_up);
        self.rising.set(ChannelRising::BLUE, b_up);
    }
}

fn pack(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

/// Interior region as half-open `[x0, x1) x [y0, y1)` ranges. Collapses to
/// an empty region when the mode is smaller than twice the inset.
fn interior_bounds(width: u32, height: u32, inset_x: u32, inset_y: u32) -> (u32, u32, u32, u32) {
    (
        inset_x,
        width.saturating_sub(inset_x),
        inset_y,
        height.saturating_sub(inset_y),
    )
}

/// Renders one frame: cycling border, dark interior with sparse sparkles,
/// and the dot field.
///
/// `frame` is the mapped framebuffer; pixels are packed 0x00RRGGBB at
/// `row * pitch + col * 4`. `pitch` is the driver-chosen row stride and may
/// exceed `width * 4`; padding bytes are left untouched.
pub fn render(frame: &mut [u8], pitch: usize, width: usize, height: usize, state: &mut PatternState) {
    state.advance_channels();
    let border = state.border_color();
    let (x0, x1, y0, y1) =
        interior_bounds(width as u32, height as u32, state.inset_x, state.inset_y);
    let (x0, x1, y0, y1) = (x0 as usize, x1 as usize, y0 as usize, y1 as usize);

    for row in 0..height {
        let interior_row = row >= y0 && row < y1;
        for col in 0..width {
            let color = if interior_row && col >= x0 && col < x1 {
                if state.rng.gen_range(0..SPARKLE_DENOMINATOR) < SPARKLE_NUMERATOR {
                    WHITE
                } else {
                    BLACK
                }
            } else {
                border
            };
            put_pixel(frame, pitch, row, col, color);
        }
    }

    for &(dot_x, dot_y) in &state.dots {
        for row in dot_y..dot_y + DOT_SIZE {
            for col in dot_x..dot_x + DOT_SIZE {
                if row >= 0 && (row as usize) < height && col >= 0 && (col as usize) < width {
                    put_pixel(frame, pitch, row as usize, col as usize, WHITE);
                }
            }
        }
    }
}

#[inline]
fn put_pixel(frame: &mut [u8], pitch: usize, row: usize, col: usize, color: u32) {
    let off = row * pitch + col * 4;
    frame[off..off + 4].copy_from_slice(&color.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PatternConfig {
        PatternConfig {
            dot_count: 8,
            inset_x: 4,
            inset_y: 4,
        }
    }

    fn seeded_state(width: u32, height: u32, seed: u64) -> PatternState {
        PatternState::with_rng(width, height, &test_config(), StdRng::seed_from_u64(seed))
    }

    #[test]
    fn it_should_leave_row_padding_untouched_when_pitch_exceeds_row_bytes() {
        let (width, height) = (16usize, 16usize);
        let pitch = width * 4 + 32;
        let mut frame = vec![0xaau8; pitch * height];
        let mut state = seeded_state(width as u32, height as u32, 7);

        render(&mut frame, pitch, width, height, &mut state);

        for row in 0..height {
            let pad = &frame[row * pitch + width * 4..(row + 1) * pitch];
            assert!(
                pad.iter().all(|&b| b == 0xaa),
                "row {} padding was written",
                row
            );
        }
    }

    #[test]
    fn it_should_fill_the_border_with_the_current_cycle_color() {
        let (width, height) = (16usize, 16usize);
        let pitch = width * 4;
        let mut frame = vec![0u8; pitch * height];
        let mut state = seeded_state(width as u32, height as u32, 7);

        render(&mut frame, pitch, width, height, &mut state);

        let expected = state.border_color().to_le_bytes();
        // Corner pixels are always outside the interior inset.
        assert_eq!(&frame[0..4], &expected);
        let last = (height - 1) * pitch + (width - 1) * 4;
        assert_eq!(&frame[last..last + 4], &expected);
    }

    #[test]
    fn it_should_only_write_black_white_or_border_pixels() {
        let (width, height) = (24usize, 24usize);
        let pitch = width * 4;
        let mut frame = vec![0u8; pitch * height];
        let mut state = seeded_state(width as u32, height as u32, 11);

        render(&mut frame, pitch, width, height, &mut state);

        let border = state.border_color();
        for row in 0..height {
            for col in 0..width {
                let off = row * pitch + col * 4;
                let px = u32::from_le_bytes(frame[off..off + 4].try_into().unwrap());
                assert!(
                    px == BLACK || px == WHITE || px == border,
                    "unexpected pixel {:#010x} at ({}, {})",
                    px,
                    col,
                    row
                );
            }
        }
    }

    #[test]
    fn it_should_keep_dots_inside_the_interior_region() {
        let (width, height) = (64u32, 64u32);
        let mut state = seeded_state(width, height, 3);

        for _ in 0..200 {
            state.advance_dots(width, height);
        }

        let (x0, x1, y0, y1) = interior_bounds(width, height, 4, 4);
        for &(x, y) in &state.dots {
            assert!(x >= x0 as i32 && x < x1 as i32, "dot x {} out of range", x);
            assert!(y >= y0 as i32 && y < y1 as i32, "dot y {} out of range", y);
        }
    }

    #[test]
    fn it_should_bias_the_dot_walk_toward_the_drift_direction() {
        let (width, height) = (512u32, 512u32);
        let mut state = seeded_state(width, height, 5);
        state.set_drift(Direction::Right);

        let start: i32 = state.dots.iter().map(|d| d.0).sum();
        for _ in 0..50 {
            state.advance_dots(width, height);
        }
        let end: i32 = state.dots.iter().map(|d| d.0).sum();

        assert!(
            end > start,
            "dots did not drift right: sum {} -> {}",
            start,
            end
        );
    }

    #[test]
    fn it_should_tolerate_modes_smaller_than_the_inset() {
        let (width, height) = (6usize, 6usize);
        let config = PatternConfig {
            dot_count: 4,
            inset_x: 250,
            inset_y: 200,
        };
        let mut state =
            PatternState::with_rng(width as u32, height as u32, &config, StdRng::seed_from_u64(1));
        let pitch = width * 4;
        let mut frame = vec![0u8; pitch * height];

        render(&mut frame, pitch, width, height, &mut state);
        state.advance_dots(width as u32, height as u32);

        // Everything is border; no interior region exists.
        let expected = state.border_color().to_le_bytes();
        assert_eq!(&frame[0..4], &expected);
    }

    #[test]
    fn it_should_reverse_a_channel_ramp_on_saturation() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut current = 250u8;
        let mut rising = true;
        // A rising ramp near the top must eventually reverse, never wrap.
        for _ in 0..64 {
            let (next, up) = PatternState::next_channel(&mut rng, rising, current, RED_STEP_BOUND);
            if rising {
                assert!(next >= current, "rising ramp wrapped: {} -> {}", current, next);
            }
            current = next;
            rising = up;
            if !rising {
                return;
            }
        }
        panic!("ramp never saturated");
    }
}
