//! Document Renderer: confirmed order → PNG certificate.
//!
//! Flow for one render:
//! 1. load the certificate document on the engine thread
//! 2. wait (bounded) for the content's `RENDER_COMPLETE` console signal
//! 3. settle, so late resources (the seal) land before capture
//! 4. measure at unbounded height, re-lay-out at that height, capture
//! 5. encode PNG on the blocking pool
//!
//! Renders are serialized: the engine is single-threaded and stateful.

use std::time::Duration;

use tch_config::RenderSection;
use tch_schemas::{Order, OrderId, OrderStage};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub mod document;
pub mod engine;
pub mod font;
pub mod layout;
pub mod paint;
pub mod snapshot_file;

pub use document::CertificateData;
pub use engine::{CertificateEngine, ConsoleSink, EngineHandle, LayoutEngine, RENDER_COMPLETE};
pub use paint::Raster;
pub use snapshot_file::{snapshot_file_name, write_snapshot};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("order {order_id} is {stage}; only CONFIRMED orders can be rendered")]
    NotRenderable { order_id: OrderId, stage: OrderStage },
    #[error("no render-complete signal within {0:?}")]
    RenderTimeout(Duration),
    #[error("captured certificate has zero area ({width}x{height})")]
    RenderEmptyContent { width: u32, height: u32 },
    #[error("render engine is not running")]
    EngineUnavailable,
    #[error("png encoding failed: {0}")]
    Encode(#[from] png::EncodingError),
    #[error("failed to write snapshot {path}: {source}")]
    SnapshotWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<engine::EngineGone> for RenderError {
    fn from(_: engine::EngineGone) -> Self {
        RenderError::EngineUnavailable
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub width: u32,
    pub default_height: u32,
    pub signal_timeout: Duration,
    pub settle: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::from(&RenderSection::default())
    }
}

impl From<&RenderSection> for RenderOptions {
    fn from(section: &RenderSection) -> Self {
        Self {
            width: section.width,
            default_height: section.default_height,
            signal_timeout: section.signal_timeout(),
            settle: section.settle(),
        }
    }
}

/// An encoded certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub order_id: OrderId,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

pub struct Renderer {
    engine: EngineHandle,
    options: RenderOptions,
    gate: Mutex<()>,
}

impl Renderer {
    /// Start a renderer backed by the production [`CertificateEngine`].
    pub fn start(options: RenderOptions) -> Result<Self, RenderError> {
        Self::with_engine(CertificateEngine::new, options)
    }

    /// Start a renderer whose engine thread is built by `factory`.
    pub fn with_engine<E, F>(factory: F, options: RenderOptions) -> Result<Self, RenderError>
    where
        E: LayoutEngine + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        let engine = EngineHandle::spawn(factory).map_err(|e| {
            warn!(error = %e, "failed to start render engine thread");
            RenderError::EngineUnavailable
        })?;
        Ok(Self {
            engine,
            options,
            gate: Mutex::new(()),
        })
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    pub async fn render(&self, order: &Order) -> Result<Snapshot, RenderError> {
        if order.stage != OrderStage::Confirmed {
            return Err(RenderError::NotRenderable {
                order_id: order.id,
                stage: order.stage,
            });
        }
        let _gate = self.gate.lock().await;
        let order_id = order.id;

        let (console_tx, mut console_rx) = mpsc::unbounded_channel();
        self.engine
            .load(CertificateData::from_order(order), ConsoleSink::new(console_tx))?;

        // A closed console is silence; only the bound ends the wait.
        let signalled = tokio::time::timeout(self.options.signal_timeout, async {
            while let Some(line) = console_rx.recv().await {
                if line == RENDER_COMPLETE {
                    return;
                }
                debug!(order_id, console = %line, "render console");
            }
            std::future::pending::<()>().await
        })
        .await;

        if signalled.is_err() {
            self.engine.unload();
            warn!(order_id, timeout = ?self.options.signal_timeout, "render timed out");
            return Err(RenderError::RenderTimeout(self.options.signal_timeout));
        }

        tokio::time::sleep(self.options.settle).await;

        let width = self.options.width;
        let measured = self.engine.measure(width).await?;
        let height = if measured <= 0 {
            debug!(order_id, measured, "measured height not positive; using default");
            self.options.default_height
        } else {
            u32::try_from(measured).unwrap_or(self.options.default_height)
        };

        let raster = self.engine.capture(width, height).await?;
        self.engine.unload();
        if raster.is_empty() {
            return Err(RenderError::RenderEmptyContent {
                width: raster.width,
                height: raster.height,
            });
        }

        let (w, h) = (raster.width, raster.height);
        let png = tokio::task::spawn_blocking(move || encode_png(&raster))
            .await
            .map_err(|_| RenderError::EngineUnavailable)??;

        info!(order_id, width = w, height = h, bytes = png.len(), "certificate rendered");
        Ok(Snapshot {
            order_id,
            width: w,
            height: h,
            png,
        })
    }
}

pub fn encode_png(raster: &Raster) -> Result<Vec<u8>, png::EncodingError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, raster.width, raster.height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&raster.rgba)?;
    }
    Ok(out)
}
