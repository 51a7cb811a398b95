//! Layout/paint engine and the dedicated thread that owns it.
//!
//! Engines are stateful and need not be `Send`: the thread builds its own
//! instance from a factory and is the only code that ever touches it. Callers
//! talk to it through [`EngineHandle`] commands.
//!
//! Loaded content runs as a sequence of frames. When the content considers
//! itself complete it writes [`RENDER_COMPLETE`] to its console, which the
//! host observes on a channel. Resource loads (the seal image) may still land
//! a frame after that signal.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc as async_mpsc, oneshot};
use tracing::debug;

use crate::document::CertificateData;
use crate::layout::{layout_certificate, Layout};
use crate::paint::{rasterize, Raster};

/// Console line emitted by loaded content once it has finished drawing.
pub const RENDER_COMPLETE: &str = "RENDER_COMPLETE";

/// Interval between content frames while work is pending.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Console of the currently loaded document.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    tx: async_mpsc::UnboundedSender<String>,
}

impl ConsoleSink {
    pub fn new(tx: async_mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn log(&self, line: &str) {
        // The host may have stopped listening (timed out); that is not an engine error.
        let _ = self.tx.send(line.to_string());
    }
}

pub trait LayoutEngine {
    /// Replace the current document. Content starts running on the next frame.
    fn load(&mut self, doc: CertificateData, console: ConsoleSink);

    /// Run one content frame. Returns `true` while more frames are pending.
    fn tick(&mut self) -> bool;

    /// Lay out at `width` with unbounded height and return the content height.
    /// Zero or negative means the engine could not measure.
    fn measure(&mut self, width: u32) -> i64;

    /// Lay out at `width` x `height` and paint.
    fn capture(&mut self, width: u32, height: u32) -> Raster;

    /// Drop the current document and any pending frames.
    fn unload(&mut self);
}

// ---------------------------------------------------------------------------
// CertificateEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    LayoutText,
    SignalComplete,
    SealLoaded,
}

/// The production engine: certificate layout with an asynchronously loaded seal.
#[derive(Default)]
pub struct CertificateEngine {
    doc: Option<CertificateData>,
    console: Option<ConsoleSink>,
    frames: Vec<Frame>,
    layout: Option<(u32, Layout)>,
    text_ready: bool,
    seal_loaded: bool,
}

impl CertificateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn layout_at(&mut self, width: u32) -> Option<&Layout> {
        let doc = self.doc.as_ref()?;
        let stale = !matches!(&self.layout, Some((w, _)) if *w == width);
        if stale {
            self.layout = Some((width, layout_certificate(doc, width)));
        }
        self.layout.as_ref().map(|(_, l)| l)
    }
}

impl LayoutEngine for CertificateEngine {
    fn load(&mut self, doc: CertificateData, console: ConsoleSink) {
        self.doc = Some(doc);
        self.console = Some(console);
        self.layout = None;
        self.text_ready = false;
        self.seal_loaded = false;
        // Popped from the back.
        self.frames = vec![Frame::SealLoaded, Frame::SignalComplete, Frame::LayoutText];
    }

    fn tick(&mut self) -> bool {
        match self.frames.pop() {
            Some(Frame::LayoutText) => self.text_ready = true,
            Some(Frame::SignalComplete) => {
                if let Some(console) = &self.console {
                    console.log(RENDER_COMPLETE);
                }
            }
            Some(Frame::SealLoaded) => self.seal_loaded = true,
            None => {}
        }
        !self.frames.is_empty()
    }

    fn measure(&mut self, width: u32) -> i64 {
        if !self.text_ready {
            return 0;
        }
        self.layout_at(width)
            .map(|l| i64::from(l.content_height))
            .unwrap_or(0)
    }

    fn capture(&mut self, width: u32, height: u32) -> Raster {
        let seal_loaded = self.seal_loaded;
        match self.layout_at(width) {
            Some(layout) => rasterize(&layout.ops, width, height, seal_loaded),
            None => rasterize(&[], width, height, false),
        }
    }

    fn unload(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Engine thread
// ---------------------------------------------------------------------------

enum EngineCommand {
    Load {
        doc: CertificateData,
        console: ConsoleSink,
    },
    Measure {
        width: u32,
        reply: oneshot::Sender<i64>,
    },
    Capture {
        width: u32,
        height: u32,
        reply: oneshot::Sender<Raster>,
    },
    Unload,
}

/// Sender side of the engine thread. Dropping every clone stops the thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

/// The engine thread has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineGone;

impl EngineHandle {
    /// Start the engine thread. `factory` runs on that thread.
    pub fn spawn<E, F>(factory: F) -> std::io::Result<Self>
    where
        E: LayoutEngine + 'static,
        F: FnOnce() -> E + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("tch-render-engine".to_string())
            .spawn(move || run_engine(factory(), rx))?;
        Ok(Self { tx })
    }

    pub fn load(&self, doc: CertificateData, console: ConsoleSink) -> Result<(), EngineGone> {
        self.tx
            .send(EngineCommand::Load { doc, console })
            .map_err(|_| EngineGone)
    }

    pub fn unload(&self) {
        let _ = self.tx.send(EngineCommand::Unload);
    }

    pub async fn measure(&self, width: u32) -> Result<i64, EngineGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Measure { width, reply })
            .map_err(|_| EngineGone)?;
        rx.await.map_err(|_| EngineGone)
    }

    pub async fn capture(&self, width: u32, height: u32) -> Result<Raster, EngineGone> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Capture {
                width,
                height,
                reply,
            })
            .map_err(|_| EngineGone)?;
        rx.await.map_err(|_| EngineGone)
    }
}

fn run_engine<E: LayoutEngine>(mut engine: E, rx: mpsc::Receiver<EngineCommand>) {
    let mut pending = false;
    loop {
        let cmd = if pending {
            match rx.recv_timeout(FRAME_INTERVAL) {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            }
        };

        match cmd {
            None => pending = engine.tick(),
            Some(EngineCommand::Load { doc, console }) => {
                debug!(order_id = doc.order_id, "engine: load");
                engine.load(doc, console);
                pending = true;
            }
            Some(EngineCommand::Measure { width, reply }) => {
                let _ = reply.send(engine.measure(width));
            }
            Some(EngineCommand::Capture {
                width,
                height,
                reply,
            }) => {
                let _ = reply.send(engine.capture(width, height));
            }
            Some(EngineCommand::Unload) => {
                engine.unload();
                pending = false;
            }
        }
    }
    debug!("render engine thread stopped");
}
