//! RGBA canvas and display-list painter.

use crate::font::{self, ADVANCE_X, GLYPH_H, GLYPH_W};
use crate::layout::{DrawOp, Rgba, PAPER, SEAL_RED};

/// Captured pixels, row-major RGBA8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl Raster {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.rgba.is_empty()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y as usize) * (self.width as usize) + x as usize) * 4;
        self.rgba.get(i..i + 4).map(|p| [p[0], p[1], p[2], p[3]])
    }
}

pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32, background: Rgba) -> Self {
        let len = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(len * 4);
        for _ in 0..len {
            pixels.extend_from_slice(&background.0);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    fn put(&mut self, x: u32, y: u32, color: Rgba) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = ((y as usize) * (self.width as usize) + x as usize) * 4;
        self.pixels[i..i + 4].copy_from_slice(&color.0);
    }

    pub fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: Rgba) {
        let x_end = x.saturating_add(w).min(self.width);
        let y_end = y.saturating_add(h).min(self.height);
        for yy in y..y_end {
            for xx in x..x_end {
                self.put(xx, yy, color);
            }
        }
    }

    pub fn draw_text(&mut self, x: u32, y: u32, scale: u32, color: Rgba, text: &str) {
        let scale = scale.max(1);
        for (i, ch) in text.chars().enumerate() {
            let gx = x + i as u32 * ADVANCE_X * scale;
            if gx >= self.width {
                break;
            }
            let rows = font::glyph(ch);
            for (row, bits) in rows.iter().enumerate().take(GLYPH_H as usize) {
                for col in 0..GLYPH_W {
                    if bits & (0x10 >> col) != 0 {
                        self.fill_rect(
                            gx + col * scale,
                            y + row as u32 * scale,
                            scale,
                            scale,
                            color,
                        );
                    }
                }
            }
        }
    }

    fn draw_frame(&mut self, inset: u32, thickness: u32, color: Rgba) {
        if self.width <= 2 * inset || self.height <= 2 * inset {
            return;
        }
        let w = self.width - 2 * inset;
        let h = self.height - 2 * inset;
        self.fill_rect(inset, inset, w, thickness, color);
        self.fill_rect(inset, inset + h.saturating_sub(thickness), w, thickness, color);
        self.fill_rect(inset, inset, thickness, h, color);
        self.fill_rect(inset + w.saturating_sub(thickness), inset, thickness, h, color);
    }

    /// Red double ring around a filled centre disc.
    fn draw_seal(&mut self, cx: u32, cy: u32, radius: u32) {
        let r = radius as i64;
        let (cx, cy) = (cx as i64, cy as i64);
        let outer = r * r;
        let ring_in = (r - 8) * (r - 8);
        let inner_out = (r - 16) * (r - 16);
        let inner_in = (r - 20) * (r - 20);
        let core = (r / 3) * (r / 3);
        for dy in -r..=r {
            for dx in -r..=r {
                let d = dx * dx + dy * dy;
                let on = (d <= outer && d >= ring_in)
                    || (d <= inner_out && d >= inner_in)
                    || d <= core;
                let (x, y) = (cx + dx, cy + dy);
                if on && x >= 0 && y >= 0 {
                    self.put(x as u32, y as u32, SEAL_RED);
                }
            }
        }
    }

    pub fn paint(&mut self, ops: &[DrawOp], seal_loaded: bool) {
        for op in ops {
            match op {
                DrawOp::Frame {
                    inset,
                    thickness,
                    color,
                } => self.draw_frame(*inset, *thickness, *color),
                DrawOp::Fill { x, y, w, h, color } => self.fill_rect(*x, *y, *w, *h, *color),
                DrawOp::Text {
                    x,
                    y,
                    scale,
                    color,
                    text,
                } => self.draw_text(*x, *y, *scale, *color, text),
                DrawOp::Seal { cx, cy, radius } if seal_loaded => {
                    self.draw_seal(*cx, *cy, *radius)
                }
                DrawOp::Seal { .. } => {}
            }
        }
    }

    pub fn into_raster(self) -> Raster {
        Raster {
            width: self.width,
            height: self.height,
            rgba: self.pixels,
        }
    }
}

/// Paint `ops` onto a fresh paper-coloured canvas.
pub fn rasterize(ops: &[DrawOp], width: u32, height: u32, seal_loaded: bool) -> Raster {
    let mut canvas = Canvas::new(width, height, PAPER);
    canvas.paint(ops, seal_loaded);
    canvas.into_raster()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::INK;

    #[test]
    fn text_and_fill_land_inside_bounds_only() {
        let mut c = Canvas::new(20, 10, PAPER);
        c.fill_rect(15, 5, 100, 100, INK);
        c.draw_text(0, 0, 1, INK, "I");
        let r = c.into_raster();
        assert_eq!(r.pixel(19, 9), Some(INK.0));
        assert_eq!(r.pixel(14, 4), Some(PAPER.0));
        // top bar of 'I' (row 0x0E covers columns 1..=3)
        assert_eq!(r.pixel(2, 0), Some(INK.0));
        assert_eq!(r.pixel(0, 0), Some(PAPER.0));
        assert_eq!(r.pixel(20, 0), None);
    }

    #[test]
    fn seal_is_skipped_until_loaded() {
        let ops = vec![DrawOp::Seal {
            cx: 50,
            cy: 50,
            radius: 40,
        }];
        let without = rasterize(&ops, 100, 100, false);
        let with = rasterize(&ops, 100, 100, true);
        assert_eq!(without.pixel(50, 50), Some(PAPER.0));
        assert_eq!(with.pixel(50, 50), Some(SEAL_RED.0));
    }
}
