//! Certificate content derived from an order.

use tch_schemas::{LineItem, Order, OrderId};

pub const PLACEHOLDER_TBD: &str = "TBD";
pub const PLACEHOLDER_UNASSIGNED: &str = "Unassigned";

/// Everything the certificate shows, with placeholders already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateData {
    pub order_id: OrderId,
    pub contact_name: String,
    pub contact_method: String,
    pub gift_name: String,
    pub qty: i64,
    pub delivery_date: String,
    pub handler_name: String,
    pub line_items: Vec<LineItem>,
    pub issued_on: String,
}

impl CertificateData {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.id,
            contact_name: non_blank(Some(&order.contact_name), PLACEHOLDER_TBD),
            contact_method: non_blank(order.contact_method.as_deref(), PLACEHOLDER_TBD),
            gift_name: non_blank(order.target.gift_name.as_deref(), PLACEHOLDER_TBD),
            qty: order.target.qty,
            delivery_date: non_blank(order.target.delivery_date.as_deref(), PLACEHOLDER_TBD),
            handler_name: non_blank(order.handler_name.as_deref(), PLACEHOLDER_UNASSIGNED),
            line_items: order.line_items.clone(),
            issued_on: order.created_at.format("%Y-%m-%d").to_string(),
        }
    }

    /// Labelled rows in display order.
    pub fn field_rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CUSTOMER", self.contact_name.clone()),
            ("CONTACT", self.contact_method.clone()),
            ("GIFT", self.gift_name.clone()),
            ("QUANTITY", self.qty.to_string()),
            ("DELIVERY", self.delivery_date.clone()),
            ("HANDLER", self.handler_name.clone()),
        ]
    }

    /// One display line per requested item, e.g. `2. Tea Set x1 (Celadon) - gift wrap`.
    pub fn item_lines(&self) -> Vec<String> {
        self.line_items
            .iter()
            .enumerate()
            .map(|(i, li)| {
                let mut line = format!("{}. {} x{}", i + 1, li.name, li.qty);
                if let Some(spec) = li.spec.as_deref().filter(|s| !s.trim().is_empty()) {
                    line.push_str(&format!(" ({spec})"));
                }
                if let Some(note) = li.note.as_deref().filter(|s| !s.trim().is_empty()) {
                    line.push_str(&format!(" - {note}"));
                }
                line
            })
            .collect()
    }
}

fn non_blank(value: Option<&str>, placeholder: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => placeholder.to_string(),
    }
}
