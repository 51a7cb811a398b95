//! Order fixtures shared by the scenario tests.

use tch_schemas::{Handler, LineItem, NewIntentOrder, TargetFields};

pub fn scarlett() -> Handler {
    Handler::new(3, "Scarlett")
}

/// An intent order for Li Wei with `n` line items (at least one).
pub fn intent_with_items(n: usize) -> NewIntentOrder {
    let n = n.max(1);
    NewIntentOrder {
        contact_name: "Li Wei".to_string(),
        contact_method: Some("wechat: liwei".to_string()),
        line_items: (0..n)
            .map(|i| LineItem {
                name: if i == 0 {
                    "Jade Vase".to_string()
                } else {
                    format!("Silk Scarf {i}")
                },
                qty: 2,
                spec: Some("20cm".to_string()),
                note: None,
            })
            .collect(),
        handler_id: scarlett().id,
        suggestion: Some("Suggest a matching stand".to_string()),
    }
}

pub fn jade_vase_target() -> TargetFields {
    TargetFields {
        gift_name: Some("Jade Vase".to_string()),
        qty: 2,
        delivery_date: Some("2026-11-01".to_string()),
    }
}
