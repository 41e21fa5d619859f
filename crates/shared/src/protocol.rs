use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ClientId, InvoiceState, ProjectId, ProjectStatus, ProposalId, ProposalStatus, User,
        UserId,
    },
    stage::{Stage, StageCompletion},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
    pub name: String,
    pub status: ProjectStatus,
    pub current_stage: Stage,
    pub stage_completion: StageCompletion,
    pub total_fee: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProjectStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_completion: Option<StageCompletion>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProposalPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProposalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_content: Option<String>,
}

impl ProposalPatch {
    pub fn status(status: ProposalStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub project_id: ProjectId,
    pub client_id: ClientId,
    pub stage: Stage,
    pub amount: f64,
    pub percentage: u8,
    pub description: String,
    pub due_date: NaiveDate,
    #[serde(flatten)]
    pub state: InvoiceState,
}

/// Merge-PATCH body moving an invoice to a new state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoicePatch {
    #[serde(flatten)]
    pub state: InvoiceState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_read: Option<bool>,
}

/// Request body shared by the default mailer and the Gmail sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailReceipt {
    pub provider: String,
    pub message_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_json_schema: Option<serde_json::Value>,
}

/// Generation output exactly as the provider returned it: a JSON object, or a
/// string that may wrap JSON in a markdown fence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicAccessQuery {
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvitationAcceptRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub full_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_clients: u64,
    pub active_projects: u64,
    pub open_proposals: u64,
    pub outstanding_amount: f64,
    pub paid_amount: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_patches_serialize_to_empty_objects() {
        assert_eq!(
            serde_json::to_value(ProjectPatch::default()).expect("json"),
            serde_json::json!({})
        );
        assert_eq!(
            serde_json::to_value(ProposalPatch::status(ProposalStatus::Accepted)).expect("json"),
            serde_json::json!({ "status": "accepted" })
        );
    }

    #[test]
    fn invoice_patch_carries_state_fields() {
        let patch = InvoicePatch {
            state: InvoiceState::Paid {
                paid_date: NaiveDate::from_ymd_opt(2026, 4, 2).expect("date"),
            },
        };
        assert_eq!(
            serde_json::to_value(patch).expect("json"),
            serde_json::json!({ "status": "paid", "paid_date": "2026-04-02" })
        );
    }
}
