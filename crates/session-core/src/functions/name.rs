//! The closed set of business functions the agent may call

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Function names advertised to the engine
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FunctionName {
    LookupOrder,
    TransferToHuman,
    CheckProductAvailability,
    CreateTicket,
}

impl FunctionName {
    /// Parameters the engine must supply
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            FunctionName::LookupOrder => &["order_id"],
            FunctionName::TransferToHuman => &["reason", "customer_context"],
            FunctionName::CheckProductAvailability => &["product_name"],
            FunctionName::CreateTicket => &["issue_type", "description"],
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FunctionName::LookupOrder => {
                "Retrieve order details using the order ID. Use this when the customer asks about \
                 order status or delivery, or provides an order ID."
            }
            FunctionName::TransferToHuman => {
                "Transfer the call to a human agent with context. Use when the customer asks for a \
                 person, the issue is complex, or it needs authorization."
            }
            FunctionName::CheckProductAvailability => {
                "Check whether a product is in stock and get a delivery estimate."
            }
            FunctionName::CreateTicket => {
                "Create a support ticket for follow-up when an issue cannot be resolved on the call."
            }
        }
    }

    fn parameters(&self) -> Value {
        let priority = json!({
            "type": "string",
            "enum": ["low", "medium", "high"],
            "default": "medium"
        });
        let properties = match self {
            FunctionName::LookupOrder => json!({
                "order_id": {
                    "type": "string",
                    "description": "The order ID provided by the customer (e.g. ORD12345)"
                }
            }),
            FunctionName::TransferToHuman => json!({
                "reason": {"type": "string", "description": "Reason for the transfer"},
                "customer_context": {
                    "type": "string",
                    "description": "Summary of the conversation so far"
                },
                "priority": priority
            }),
            FunctionName::CheckProductAvailability => json!({
                "product_name": {"type": "string", "description": "Name or ID of the product"},
                "pincode": {"type": "string", "description": "Delivery pincode, optional"}
            }),
            FunctionName::CreateTicket => json!({
                "issue_type": {"type": "string", "description": "Type of issue"},
                "description": {"type": "string", "description": "Detailed description of the issue"},
                "customer_phone": {"type": "string", "description": "Phone number for follow-up"},
                "priority": priority
            }),
        };
        json!({
            "type": "object",
            "properties": properties,
            "required": self.required_params(),
        })
    }

    /// Tool definition as sent in `session.update`
    pub fn schema(&self) -> Value {
        json!({
            "type": "function",
            "name": self.as_ref(),
            "description": self.description(),
            "parameters": self.parameters(),
        })
    }
}
