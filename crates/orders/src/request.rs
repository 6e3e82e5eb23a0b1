use common::OrderLine;
use serde::{Deserialize, Serialize};

use crate::OrderError;

/// An order as submitted by a client: `{customerId, items:[{productId, quantity}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub items: Vec<OrderLine>,
}

impl OrderRequest {
    pub fn new(customer_id: impl Into<String>, items: Vec<OrderLine>) -> Self {
        Self {
            customer_id: customer_id.into(),
            items,
        }
    }

    /// Checks the request before it may enter the workflow.
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.customer_id.trim().is_empty() {
            return Err(OrderError::CustomerIdRequired);
        }
        if self.items.is_empty() {
            return Err(OrderError::NoItems);
        }
        for (line, item) in self.items.iter().enumerate() {
            if item.product_id.trim().is_empty() {
                return Err(OrderError::ProductIdRequired { line });
            }
            if item.quantity <= 0 {
                return Err(OrderError::InvalidQuantity {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_request_passes() {
        let req = OrderRequest::new("CUST-001", vec![OrderLine::new("SKU-001", 1)]);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn missing_customer_is_rejected() {
        let req = OrderRequest::new("  ", vec![OrderLine::new("SKU-001", 1)]);
        assert_eq!(req.validate(), Err(OrderError::CustomerIdRequired));
    }

    #[test]
    fn empty_items_are_rejected() {
        let req = OrderRequest::new("CUST-001", vec![]);
        assert_eq!(req.validate(), Err(OrderError::NoItems));
    }

    #[test]
    fn blank_product_is_rejected() {
        let req = OrderRequest::new(
            "CUST-001",
            vec![OrderLine::new("SKU-001", 1), OrderLine::new("", 1)],
        );
        assert_eq!(req.validate(), Err(OrderError::ProductIdRequired { line: 1 }));
    }

    #[test]
    fn non_positive_quantity_is_rejected() {
        let req = OrderRequest::new("CUST-001", vec![OrderLine::new("SKU-001", 0)]);
        assert!(matches!(
            req.validate(),
            Err(OrderError::InvalidQuantity { quantity: 0, .. })
        ));
    }

    #[test]
    fn deserializes_wire_shape_with_defaults() {
        let req: OrderRequest = serde_json::from_value(serde_json::json!({
            "items": [{"productId": "SKU-001", "quantity": 3}]
        }))
        .unwrap();
        assert_eq!(req.customer_id, "");
        assert_eq!(req.items, vec![OrderLine::new("SKU-001", 3)]);
    }
}
