//! Policy artifact generation and delivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::channels::{Channel, OutgoingContent, OutgoingMessage};
use crate::error::CollaboratorError;

/// File name the policy is delivered under.
pub const POLICY_FILE_NAME: &str = "policy.txt";

/// A rendered, not yet delivered, insurance policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDocument {
    pub policy_number: Uuid,
    pub issued_at: DateTime<Utc>,
    pub text: String,
}

impl PolicyDocument {
    /// Render a policy from confirmed fields and the quoted price.
    pub fn render(fields: &BTreeMap<String, String>, price: Decimal, currency: &str) -> Self {
        let policy_number = Uuid::new_v4();
        let issued_at = Utc::now();
        let field = |key: &str| fields.get(key).map(String::as_str).unwrap_or("-");

        let text = format!(
            "Car Insurance Policy\n\
             Policy number: {policy_number}\n\
             Issued: {issued}\n\
             \n\
             INSURED INFORMATION\n\
             ------------------\n\
             Name: {name}\n\
             Date of Birth: {dob}\n\
             \n\
             VEHICLE INFORMATION\n\
             ------------------\n\
             Manufacturer: {manufacturer}\n\
             Model: {model}\n\
             Registered Owner: {owner}\n\
             \n\
             COVERAGE DETAILS\n\
             ------------------\n\
             Liability: 100,000 bodily injury per person, 300,000 per accident; 50,000 property damage.\n\
             Collision: 500 deductible.\n\
             Comprehensive: 300 deductible.\n\
             Uninsured/Underinsured Motorist: 100,000 bodily injury, 50,000 property damage.\n\
             \n\
             Premium: {price} {currency}\n\
             \n\
             ADDITIONAL BENEFITS\n\
             ------------------\n\
             24/7 roadside assistance.\n\
             \n\
             EXCLUSIONS\n\
             ------------------\n\
             Intentional damage, commercial use, racing, wear and tear.\n",
            issued = issued_at.format("%Y-%m-%d"),
            name = field("passport_name"),
            dob = field("passport_date_of_birth"),
            manufacturer = field("vehicle_manufacturer"),
            model = field("vehicle_model"),
            owner = field("vehicle_owner"),
        );

        Self {
            policy_number,
            issued_at,
            text,
        }
    }
}

/// Sends an issued policy to the user.
#[async_trait]
pub trait PolicyDelivery: Send + Sync {
    /// Returns once the transport confirmed delivery.
    async fn deliver(&self, user_id: &str, policy: &PolicyDocument) -> Result<(), CollaboratorError>;
}

/// Delivers the policy as a document attachment on the chat channel.
pub struct ChannelPolicyDelivery {
    channel: Arc<dyn Channel>,
}

impl ChannelPolicyDelivery {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl PolicyDelivery for ChannelPolicyDelivery {
    async fn deliver(&self, user_id: &str, policy: &PolicyDocument) -> Result<(), CollaboratorError> {
        let message = OutgoingMessage {
            user_id: user_id.to_string(),
            content: OutgoingContent::Document {
                file_name: POLICY_FILE_NAME.to_string(),
                bytes: policy.text.clone().into_bytes(),
                caption: Some(format!("Policy {}", policy.policy_number)),
            },
        };
        self.channel
            .send(message)
            .await
            .map_err(|e| CollaboratorError::transient("policy delivery", e))?;
        tracing::info!(user_id, policy_number = %policy.policy_number, "Policy delivered");
        Ok(())
    }
}
