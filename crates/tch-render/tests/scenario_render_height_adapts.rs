//! Certificate height follows content; the seal lands before capture.
//!
//! GREEN when:
//! - 1 and 20 line items both produce non-zero-height PNGs
//! - height strictly increases with line-item count
//! - the seal is present in the captured pixels
//! - a non-positive measurement falls back to the default height

use std::time::Duration;

use chrono::Utc;
use tch_render::layout::{MARGIN, SEAL_RADIUS, SEAL_RED};
use tch_render::{
    CertificateData, CertificateEngine, ConsoleSink, LayoutEngine, Raster, RenderError,
    RenderOptions, Renderer, RENDER_COMPLETE,
};
use tch_schemas::{LineItem, Order, OrderStage, TargetFields};

fn order_with_items(id: i64, n: usize) -> Order {
    Order {
        id,
        stage: OrderStage::Confirmed,
        contact_name: "Li Wei".to_string(),
        contact_method: Some("wechat: liwei".to_string()),
        line_items: (0..n)
            .map(|i| LineItem {
                name: format!("Jade Vase {i}"),
                qty: 2,
                spec: Some("20cm".to_string()),
                note: None,
            })
            .collect(),
        target: TargetFields {
            gift_name: Some("Jade Vase".to_string()),
            qty: 2,
            delivery_date: Some("2026-11-01".to_string()),
        },
        handler_id: 3,
        handler_name: Some("Scarlett".to_string()),
        suggestion: None,
        created_at: Utc::now(),
        snapshot_ref: None,
        original_order_id: None,
    }
}

fn decode(png_bytes: &[u8]) -> Raster {
    let decoder = png::Decoder::new(png_bytes);
    let mut reader = decoder.read_info().unwrap();
    let mut buf = vec![0; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).unwrap();
    buf.truncate(info.buffer_size());
    Raster {
        width: info.width,
        height: info.height,
        rgba: buf,
    }
}

#[tokio::test]
async fn height_grows_with_line_items() {
    let renderer = Renderer::start(RenderOptions::default()).unwrap();

    let one = renderer.render(&order_with_items(1, 1)).await.unwrap();
    let twenty = renderer.render(&order_with_items(2, 20)).await.unwrap();

    assert_eq!(one.width, 1080);
    assert_eq!(twenty.width, 1080);
    assert!(one.height > 0);
    assert!(twenty.height > one.height, "{} vs {}", twenty.height, one.height);

    let mut last = 0;
    for n in [1usize, 2, 5, 10] {
        let snap = renderer.render(&order_with_items(10 + n as i64, n)).await.unwrap();
        assert!(snap.height > last, "height must grow at n={n}");
        last = snap.height;
    }

    let decoded = decode(&one.png);
    assert_eq!((decoded.width, decoded.height), (one.width, one.height));
}

#[tokio::test]
async fn seal_is_captured_after_settle() {
    let renderer = Renderer::start(RenderOptions::default()).unwrap();
    let snap = renderer.render(&order_with_items(7, 1)).await.unwrap();
    let raster = decode(&snap.png);

    let cx = 1080 - MARGIN - SEAL_RADIUS;
    let cy = snap.height - MARGIN - SEAL_RADIUS;
    assert_eq!(raster.pixel(cx, cy), Some(SEAL_RED.0));
}

#[tokio::test]
async fn concurrent_renders_are_serialized_and_all_succeed() {
    let renderer = std::sync::Arc::new(Renderer::start(RenderOptions::default()).unwrap());
    let mut handles = Vec::new();
    for id in 1..=4 {
        let r = renderer.clone();
        handles.push(tokio::spawn(async move {
            r.render(&order_with_items(id, id as usize)).await
        }));
    }
    for h in handles {
        let snap = h.await.unwrap().unwrap();
        assert!(!snap.png.is_empty());
    }
}

#[tokio::test]
async fn only_confirmed_orders_render() {
    let renderer = Renderer::start(RenderOptions::default()).unwrap();
    let mut order = order_with_items(3, 1);
    order.stage = OrderStage::Intent;
    let err = renderer.render(&order).await.unwrap_err();
    assert!(matches!(err, RenderError::NotRenderable { order_id: 3, .. }));
}

/// Signals immediately but cannot measure its content.
struct UnmeasurableEngine {
    inner: CertificateEngine,
}

impl LayoutEngine for UnmeasurableEngine {
    fn load(&mut self, doc: CertificateData, console: ConsoleSink) {
        self.inner.load(doc, console.clone());
        console.log(RENDER_COMPLETE);
    }
    fn tick(&mut self) -> bool {
        self.inner.tick()
    }
    fn measure(&mut self, _width: u32) -> i64 {
        -1
    }
    fn capture(&mut self, width: u32, height: u32) -> Raster {
        self.inner.capture(width, height)
    }
    fn unload(&mut self) {
        self.inner.unload()
    }
}

#[tokio::test]
async fn non_positive_measurement_uses_default_height() {
    let options = RenderOptions {
        default_height: 640,
        settle: Duration::from_millis(10),
        ..RenderOptions::default()
    };
    let renderer = Renderer::with_engine(
        || UnmeasurableEngine {
            inner: CertificateEngine::new(),
        },
        options,
    )
    .unwrap();
    let snap = renderer.render(&order_with_items(4, 3)).await.unwrap();
    assert_eq!(snap.height, 640);
}
