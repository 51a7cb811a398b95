//! Certificate layout: turns [`CertificateData`] into a display list at a fixed width.
//!
//! Height is whatever the content needs. It grows with every wrapped line, so
//! more line items always produce a taller certificate.

use crate::document::CertificateData;
use crate::font::{self, ADVANCE_Y};

pub const MARGIN: u32 = 72;
pub const TITLE_SCALE: u32 = 5;
pub const BODY_SCALE: u32 = 3;
pub const SEAL_RADIUS: u32 = 90;

const TITLE: &str = "FORMAL ORDER CERTIFICATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba(pub [u8; 4]);

pub const PAPER: Rgba = Rgba([250, 246, 236, 255]);
pub const INK: Rgba = Rgba([34, 30, 28, 255]);
pub const ACCENT: Rgba = Rgba([176, 138, 62, 255]);
pub const SEAL_RED: Rgba = Rgba([186, 32, 38, 255]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOp {
    /// Border inset from every canvas edge; drawn against the captured size.
    Frame { inset: u32, thickness: u32, color: Rgba },
    Fill { x: u32, y: u32, w: u32, h: u32, color: Rgba },
    Text { x: u32, y: u32, scale: u32, color: Rgba, text: String },
    /// The red company seal. Painted only once its resource has loaded.
    Seal { cx: u32, cy: u32, radius: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub ops: Vec<DrawOp>,
    pub content_height: u32,
}

struct Cursor {
    ops: Vec<DrawOp>,
    y: u32,
    left: u32,
    inner_width: u32,
}

impl Cursor {
    fn line_height(scale: u32) -> u32 {
        ADVANCE_Y * scale
    }

    fn text_block(&mut self, text: &str, scale: u32, color: Rgba, centered: bool) {
        let max_chars = font::chars_per_line(self.inner_width, scale);
        for line in wrap(text, max_chars) {
            let x = if centered {
                let w = font::text_width(line.chars().count(), scale);
                self.left + self.inner_width.saturating_sub(w) / 2
            } else {
                self.left
            };
            self.ops.push(DrawOp::Text {
                x,
                y: self.y,
                scale,
                color,
                text: line,
            });
            self.y += Self::line_height(scale);
        }
    }

    fn rule(&mut self, thickness: u32, color: Rgba) {
        self.ops.push(DrawOp::Fill {
            x: self.left,
            y: self.y,
            w: self.inner_width,
            h: thickness,
            color,
        });
        self.y += thickness;
    }

    fn gap(&mut self, px: u32) {
        self.y += px;
    }
}

pub fn layout_certificate(doc: &CertificateData, width: u32) -> Layout {
    let inner_width = width
        .saturating_sub(2 * MARGIN)
        .max(font::ADVANCE_X * TITLE_SCALE);
    let mut c = Cursor {
        ops: vec![DrawOp::Frame {
            inset: MARGIN / 3,
            thickness: 6,
            color: ACCENT,
        }],
        y: MARGIN,
        left: MARGIN,
        inner_width,
    };

    c.text_block(TITLE, TITLE_SCALE, INK, true);
    c.gap(16);
    c.rule(4, ACCENT);
    c.gap(24);
    c.text_block(&format!("ORDER NO. {}", doc.order_id), BODY_SCALE, INK, false);
    c.gap(12);

    for (label, value) in doc.field_rows() {
        c.text_block(&format!("{label}: {value}"), BODY_SCALE, INK, false);
    }

    c.gap(24);
    c.text_block("REQUESTED ITEMS", BODY_SCALE, ACCENT, false);
    c.rule(2, ACCENT);
    c.gap(14);
    for line in doc.item_lines() {
        c.text_block(&line, BODY_SCALE, INK, false);
    }

    c.gap(32);
    c.text_block(&format!("ISSUED {}", doc.issued_on), BODY_SCALE, INK, false);

    let seal_top = c.y;
    c.ops.push(DrawOp::Seal {
        cx: (MARGIN + inner_width).saturating_sub(SEAL_RADIUS),
        cy: seal_top + SEAL_RADIUS,
        radius: SEAL_RADIUS,
    });
    c.y = seal_top + 2 * SEAL_RADIUS + MARGIN;

    Layout {
        ops: c.ops,
        content_height: c.y,
    }
}

/// Greedy word wrap to at most `max_chars` per line. Words longer than a line are split.
pub fn wrap(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > max_chars {
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let rest = word.split_off(max_chars);
            lines.push(word.into_iter().collect());
            word = rest;
        }
        if word.is_empty() {
            continue;
        }
        let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
        if needed > max_chars {
            lines.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push(' ');
            current_len += 1;
        }
        current.extend(word.iter());
        current_len += word.len();
    }
    if current_len > 0 || lines.is_empty() {
        lines.push(current);
    }
    lines
}
