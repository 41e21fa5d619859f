use serde_json::Value;
use shared::{
    domain::{InvoiceState, ProjectStatus, ProposalStatus, Settings},
    error::{ApiError, ErrorCode},
    protocol::{DashboardStats, EmailReceipt, LlmRequest, LlmResponse, OutboundEmail},
};
use tracing::{info, warn};

use crate::{decode_body, internal, ApiContext};

pub const DEFAULT_PROVIDER: &str = "default";
pub const GMAIL_PROVIDER: &str = "gmail";

const MAX_SUMMARY_CHARS: usize = 200;

pub async fn send_email(ctx: &ApiContext, email: &OutboundEmail) -> Result<EmailReceipt, ApiError> {
    validate_email(email)?;
    deliver(ctx, DEFAULT_PROVIDER, email).await
}

/// Gmail-backed sender. Refuses to send unless a refresh token is stored in
/// the settings record.
pub async fn send_gmail(ctx: &ApiContext, email: &OutboundEmail) -> Result<EmailReceipt, ApiError> {
    validate_email(email)?;
    let connected = load_settings(ctx)
        .await?
        .is_some_and(|settings| settings.has_gmail_connection());
    if !connected {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "gmail is not connected: no refresh token stored",
        ));
    }
    deliver(ctx, GMAIL_PROVIDER, email).await
}

async fn deliver(
    ctx: &ApiContext,
    provider: &str,
    email: &OutboundEmail,
) -> Result<EmailReceipt, ApiError> {
    let message_id = ctx
        .storage
        .record_email(provider, email)
        .await
        .map_err(internal)?;
    info!(provider, message_id, to = %email.to, "email queued");
    Ok(EmailReceipt {
        provider: provider.to_string(),
        message_id,
    })
}

fn validate_email(email: &OutboundEmail) -> Result<(), ApiError> {
    let to = email.to.trim();
    if to.is_empty() || !to.contains('@') {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("to: '{}' is not an email address", email.to),
        ));
    }
    if email.subject.trim().is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "subject: must not be empty"));
    }
    Ok(())
}

pub async fn load_settings(ctx: &ApiContext) -> Result<Option<Settings>, ApiError> {
    let records = ctx
        .storage
        .list_records("settings")
        .await
        .map_err(internal)?;
    records
        .into_iter()
        .next()
        .map(|record| decode_body("settings", record.body))
        .transpose()
}

/// Local stand-in for the text-generation integration. Answers in the same
/// shape the hosted model does: a fenced JSON string with a `description`.
pub async fn generate_text(_ctx: &ApiContext, req: &LlmRequest) -> Result<LlmResponse, ApiError> {
    let first_line = req.prompt.lines().map(str::trim).find(|line| !line.is_empty());
    let Some(first_line) = first_line else {
        return Err(ApiError::new(ErrorCode::Validation, "prompt: must not be empty"));
    };

    let summary: String = first_line.chars().take(MAX_SUMMARY_CHARS).collect();
    let payload = serde_json::json!({ "description": summary });
    Ok(LlmResponse {
        output: Value::String(format!("```json\n{payload}\n```")),
    })
}

pub async fn dashboard_stats(ctx: &ApiContext) -> Result<DashboardStats, ApiError> {
    let mut stats = DashboardStats {
        total_clients: ctx
            .storage
            .list_records("clients")
            .await
            .map_err(internal)?
            .len() as u64,
        ..DashboardStats::default()
    };

    for record in ctx.storage.list_records("projects").await.map_err(internal)? {
        let status = record
            .body
            .get("status")
            .cloned()
            .and_then(|value| serde_json::from_value::<ProjectStatus>(value).ok());
        if status == Some(ProjectStatus::Active) {
            stats.active_projects += 1;
        }
    }

    for record in ctx.storage.list_records("proposals").await.map_err(internal)? {
        let status = record
            .body
            .get("status")
            .cloned()
            .and_then(|value| serde_json::from_value::<ProposalStatus>(value).ok())
            .unwrap_or_default();
        if !status.is_terminal() {
            stats.open_proposals += 1;
        }
    }

    for record in ctx.storage.list_records("invoices").await.map_err(internal)? {
        let amount = record
            .body
            .get("amount")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        match serde_json::from_value::<InvoiceState>(record.body) {
            Ok(InvoiceState::Paid { .. }) => stats.paid_amount += amount,
            Ok(InvoiceState::Sent { .. } | InvoiceState::Overdue { .. }) => {
                stats.outstanding_amount += amount
            }
            Ok(InvoiceState::Draft) => {}
            Err(err) => warn!(id = record.id, %err, "skipping malformed invoice in stats"),
        }
    }

    Ok(stats)
}
