//! Scripted layout engines and render options for fast tests.

use std::time::Duration;

use tch_render::{CertificateData, ConsoleSink, LayoutEngine, Raster, RenderOptions};

/// Render options with short bounds so timeout paths finish quickly.
pub fn fast_render_options() -> RenderOptions {
    RenderOptions {
        signal_timeout: Duration::from_millis(500),
        settle: Duration::from_millis(10),
        ..RenderOptions::default()
    }
}

/// Loads content that never reports completion.
#[derive(Debug, Default)]
pub struct SilentEngine;

impl LayoutEngine for SilentEngine {
    fn load(&mut self, _doc: CertificateData, console: ConsoleSink) {
        console.log("loading seal");
    }

    fn tick(&mut self) -> bool {
        false
    }

    fn measure(&mut self, _width: u32) -> i64 {
        0
    }

    fn capture(&mut self, width: u32, height: u32) -> Raster {
        Raster {
            width,
            height,
            rgba: vec![0; width as usize * height as usize * 4],
        }
    }

    fn unload(&mut self) {}
}
