//! Unauthenticated endpoints keyed by record id plus the invited email.
//!
//! A mismatched email answers exactly like a missing record.

use serde_json::{json, Map, Value};
use shared::{
    domain::{Client, InvitationStatus, Proposal, ProposalStatus, Role, UserInvitation},
    error::{ApiError, ErrorCode},
    protocol::InvitationAcceptRequest,
};
use tracing::info;

use crate::{create_record, decode_body, internal, load_typed, ApiContext, Caller};

pub async fn public_proposal(
    ctx: &ApiContext,
    proposal_id: i64,
    email: &str,
) -> Result<Proposal, ApiError> {
    let proposal: Proposal = load_typed(ctx, "proposals", proposal_id).await?;
    let client: Client = load_typed(ctx, "clients", proposal.client_id.0)
        .await
        .map_err(|_| ApiError::not_found("proposals", proposal_id))?;
    if !same_email(&client.email, email) {
        return Err(ApiError::not_found("proposals", proposal_id));
    }
    Ok(proposal)
}

/// Records the client's acceptance only. The project and first invoice are
/// created when staff run the acceptance lifecycle for the proposal.
pub async fn accept_public_proposal(
    ctx: &ApiContext,
    proposal_id: i64,
    email: &str,
) -> Result<Proposal, ApiError> {
    let proposal = public_proposal(ctx, proposal_id, email).await?;
    if !proposal.status.can_transition_to(ProposalStatus::Accepted) {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            format!(
                "proposal {proposal_id} is {} and cannot be accepted",
                proposal.status.as_str()
            ),
        ));
    }

    let record = ctx
        .storage
        .merge_record("proposals", proposal_id, patch(json!({ "status": "accepted" })))
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("proposals", proposal_id))?;
    info!(proposal_id, "proposal accepted through public link");
    decode_body("proposals", record.body)
}

pub async fn public_invitation(
    ctx: &ApiContext,
    invitation_id: i64,
    email: &str,
) -> Result<UserInvitation, ApiError> {
    let invitation: UserInvitation = load_typed(ctx, "user_invitations", invitation_id).await?;
    if !same_email(&invitation.email, email) {
        return Err(ApiError::not_found("user_invitations", invitation_id));
    }
    Ok(invitation)
}

/// Creates the client's portal user, links it to the client record and marks
/// the invitation accepted.
pub async fn accept_invitation(
    ctx: &ApiContext,
    invitation_id: i64,
    req: &InvitationAcceptRequest,
) -> Result<UserInvitation, ApiError> {
    let invitation = public_invitation(ctx, invitation_id, &req.email).await?;
    if invitation.status == InvitationStatus::Accepted {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            format!("invitation {invitation_id} was already accepted"),
        ));
    }
    let client: Client = load_typed(ctx, "clients", invitation.client_id.0).await?;

    let user = create_record(
        ctx,
        Caller::Operator,
        "users",
        json!({
            "email": invitation.email,
            "full_name": req.full_name,
            "role": Role::Client,
            "password": req.password,
        }),
    )
    .await?;
    let user_id = user.get("id").cloned().unwrap_or(Value::Null);

    ctx.storage
        .merge_record("clients", client.id.0, patch(json!({ "user_id": user_id })))
        .await
        .map_err(internal)?;
    let record = ctx
        .storage
        .merge_record(
            "user_invitations",
            invitation_id,
            patch(json!({ "status": "accepted" })),
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user_invitations", invitation_id))?;
    info!(invitation_id, client_id = client.id.0, "invitation accepted");
    decode_body("user_invitations", record.body)
}

fn same_email(stored: &str, supplied: &str) -> bool {
    stored.trim().eq_ignore_ascii_case(supplied.trim())
}

fn patch(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}
