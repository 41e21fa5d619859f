//! Multi-step business flows: accepting a proposal, completing a project
//! stage, and the emails and status changes around them.
//!
//! Each flow is a fixed ordered list of remote calls. Nothing is rolled back
//! when a step fails; the journal records which steps completed so the run
//! can be resumed from the first missing one.

use std::{fmt, sync::Arc};

use anyhow::Context;
use chrono::{Duration, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{
        billed_percentage, Client, ClientId, Invoice, InvoiceId, InvoiceState, Notification,
        NotificationId, ProjectId, ProjectStatus, Proposal, ProposalId, ProposalStatus, Settings,
    },
    protocol::{
        InvoicePatch, LlmRequest, NewInvoice, NewNotification, NewProject, NotificationPatch,
        OutboundEmail, ProjectPatch, ProposalPatch,
    },
    stage::{next_stage, stage_invoice_amount, Stage, StageCompletion},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::{
    ai_response::{decode_ai_response, GeneratedDescription},
    config::ClientConfig,
    error::ClientError,
    journal::{RunStatus, SagaJournal, SagaKind, SagaRun},
    mailer::{invoice_email, proposal_email, MailerSet},
    rest::RestClient,
    RecordApi, TextGenerator,
};

pub const DEFAULT_INVOICE_DUE_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStep {
    MarkAccepted,
    CreateProject,
    Describe,
    CreateInvoice,
    SendInvoice,
    MarkStageComplete,
    Notify,
}

impl SagaStep {
    pub fn as_str(self) -> &'static str {
        match self {
            SagaStep::MarkAccepted => "mark_accepted",
            SagaStep::CreateProject => "create_project",
            SagaStep::Describe => "describe",
            SagaStep::CreateInvoice => "create_invoice",
            SagaStep::SendInvoice => "send_invoice",
            SagaStep::MarkStageComplete => "mark_stage_complete",
            SagaStep::Notify => "notify",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            SagaStep::MarkAccepted,
            SagaStep::CreateProject,
            SagaStep::Describe,
            SagaStep::CreateInvoice,
            SagaStep::SendInvoice,
            SagaStep::MarkStageComplete,
            SagaStep::Notify,
        ]
        .into_iter()
        .find(|step| step.as_str() == raw)
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ACCEPT_PROPOSAL_STEPS: [SagaStep; 6] = [
    SagaStep::MarkAccepted,
    SagaStep::CreateProject,
    SagaStep::Describe,
    SagaStep::CreateInvoice,
    SagaStep::SendInvoice,
    SagaStep::Notify,
];

const COMPLETE_STAGE_STEPS: [SagaStep; 4] = [
    SagaStep::Describe,
    SagaStep::CreateInvoice,
    SagaStep::MarkStageComplete,
    SagaStep::Notify,
];

pub fn steps_for(kind: SagaKind) -> &'static [SagaStep] {
    match kind {
        SagaKind::AcceptProposal => &ACCEPT_PROPOSAL_STEPS,
        SagaKind::CompleteStage => &COMPLETE_STAGE_STEPS,
    }
}

/// Everything a run needs to continue after a restart. Stored in the journal
/// after every step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaContext {
    pub client: Client,
    #[serde(default)]
    pub proposal_id: Option<ProposalId>,
    pub project_name: String,
    pub total_fee: f64,
    pub stage: Stage,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub invoice_id: Option<InvoiceId>,
    #[serde(default)]
    pub notification_id: Option<NotificationId>,
    #[serde(default)]
    pub send_invoice: bool,
    /// The proposal was accepted before the run started, e.g. through the
    /// client's public link.
    #[serde(default)]
    pub already_accepted: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub context: SagaContext,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    RunStarted {
        run_id: String,
        kind: SagaKind,
    },
    StepCompleted {
        run_id: String,
        step: SagaStep,
    },
    StepSkipped {
        run_id: String,
        step: SagaStep,
    },
    RunFailed {
        run_id: String,
        step: SagaStep,
        error: String,
    },
    RunCompleted {
        run_id: String,
        kind: SagaKind,
    },
    ProposalStatusChanged {
        proposal_id: ProposalId,
        status: ProposalStatus,
    },
    InvoiceStatusChanged {
        invoice_id: InvoiceId,
        status: &'static str,
    },
    EmailSent {
        to: String,
        provider: String,
    },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("client {client_id} could not be loaded: {source}")]
    UnresolvableClient {
        client_id: ClientId,
        #[source]
        source: ClientError,
    },
    #[error(
        "run {run_id} failed at step {step} (completed: {}): {source:#}",
        step_list(.completed)
    )]
    StepFailed {
        run_id: String,
        step: SagaStep,
        completed: Vec<SagaStep>,
        #[source]
        source: anyhow::Error,
    },
    #[error("run {run_id} cannot be resumed: {reason}")]
    RunNotResumable { run_id: String, reason: String },
    #[error("saga journal error: {0:#}")]
    Journal(#[source] anyhow::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
}

fn step_list(steps: &[SagaStep]) -> String {
    if steps.is_empty() {
        return "none".to_string();
    }
    steps
        .iter()
        .map(|step| step.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub invoice_due_days: i64,
    pub send_invoice_on_accept: bool,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            invoice_due_days: DEFAULT_INVOICE_DUE_DAYS,
            send_invoice_on_accept: false,
        }
    }
}

impl From<&ClientConfig> for LifecycleOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            invoice_due_days: config.invoice_due_days,
            send_invoice_on_accept: config.send_invoice_on_accept,
        }
    }
}

enum StepOutcome {
    Done,
    Skipped,
}

pub struct LifecycleController {
    records: Arc<dyn RecordApi>,
    generator: Arc<dyn TextGenerator>,
    mailers: MailerSet,
    journal: Arc<dyn SagaJournal>,
    options: LifecycleOptions,
    events: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleController {
    pub fn new(
        rest: Arc<RestClient>,
        journal: Arc<dyn SagaJournal>,
        options: LifecycleOptions,
    ) -> Self {
        Self::new_with_dependencies(
            rest.clone(),
            rest.clone(),
            MailerSet::over_rest(rest),
            journal,
            options,
        )
    }

    pub fn new_with_dependencies(
        records: Arc<dyn RecordApi>,
        generator: Arc<dyn TextGenerator>,
        mailers: MailerSet,
        journal: Arc<dyn SagaJournal>,
        options: LifecycleOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            records,
            generator,
            mailers,
            journal,
            options,
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    pub async fn accept_proposal(&self, proposal: &Proposal) -> Result<RunOutcome, LifecycleError> {
        self.accept_proposal_with(proposal, self.options.send_invoice_on_accept)
            .await
    }

    /// Accepts the proposal, creates its project and bills the discovery
    /// stage. `send_invoice` emails the first invoice to the client.
    ///
    /// A proposal the client already accepted through the public link is
    /// taken as long as nothing has been built for it yet.
    pub async fn accept_proposal_with(
        &self,
        proposal: &Proposal,
        send_invoice: bool,
    ) -> Result<RunOutcome, LifecycleError> {
        let already_accepted = proposal.status == ProposalStatus::Accepted;
        if already_accepted {
            self.ensure_unmaterialized(proposal.id).await?;
        } else if !proposal.status.can_transition_to(ProposalStatus::Accepted) {
            return Err(LifecycleError::InvalidTransition(format!(
                "proposal {} is {} and cannot be accepted",
                proposal.id,
                proposal.status.as_str()
            )));
        }
        let client = self.resolve_client(proposal.client_id).await?;

        let context = SagaContext {
            client,
            proposal_id: Some(proposal.id),
            project_name: proposal.title.clone(),
            total_fee: proposal.total_fee,
            stage: Stage::Discovery,
            project_id: None,
            description: None,
            invoice_id: None,
            notification_id: None,
            send_invoice,
            already_accepted,
        };
        self.start(SagaKind::AcceptProposal, proposal.id.0, context)
            .await
    }

    /// Bills `stage` and advances the project to the next stage. Open tasks
    /// for the stage do not block completion.
    pub async fn complete_project_stage(
        &self,
        project_id: ProjectId,
        stage: Stage,
    ) -> Result<RunOutcome, LifecycleError> {
        let project = self.records.get_project(project_id).await?;
        if project.stage_completion.is_complete(stage) {
            return Err(LifecycleError::InvalidTransition(format!(
                "stage {} of project {} is already complete",
                stage.key(),
                project.id
            )));
        }
        let client = self.resolve_client(project.client_id).await?;

        let context = SagaContext {
            client,
            proposal_id: project.proposal_id,
            project_name: project.name,
            total_fee: project.total_fee,
            stage,
            project_id: Some(project.id),
            description: None,
            invoice_id: None,
            notification_id: None,
            send_invoice: false,
            already_accepted: false,
        };
        self.start(SagaKind::CompleteStage, project.id.0, context)
            .await
    }

    /// Continues a failed or interrupted run from its first incomplete step.
    pub async fn resume(&self, run_id: &str) -> Result<RunOutcome, LifecycleError> {
        let not_resumable = |reason: String| LifecycleError::RunNotResumable {
            run_id: run_id.to_string(),
            reason,
        };
        let run = self
            .journal
            .load(run_id)
            .await
            .map_err(LifecycleError::Journal)?
            .ok_or_else(|| not_resumable("no such run".into()))?;
        if run.status == RunStatus::Completed {
            return Err(not_resumable("run already completed".into()));
        }
        let context: SagaContext = serde_json::from_value(run.context.clone())
            .map_err(|err| not_resumable(format!("stored context is unreadable: {err}")))?;
        let completed = run
            .completed_steps
            .iter()
            .filter_map(|step| SagaStep::parse(step))
            .collect();

        info!(
            run_id,
            kind = run.kind.as_str(),
            failed_step = run.failed_step.as_deref().unwrap_or("none"),
            "resuming lifecycle run"
        );
        self.drive(run.run_id, run.kind, context, completed).await
    }

    pub async fn incomplete_runs(&self) -> Result<Vec<SagaRun>, LifecycleError> {
        self.journal
            .list_incomplete()
            .await
            .map_err(LifecycleError::Journal)
    }

    /// Sends `email` for the invoice through the selected mailer and marks the
    /// invoice sent today.
    pub async fn send_invoice_email(
        &self,
        invoice_id: InvoiceId,
        email: &OutboundEmail,
    ) -> Result<Invoice, LifecycleError> {
        let invoice = self.records.get_invoice(invoice_id).await?;
        if invoice.state.is_paid() {
            return Err(LifecycleError::InvalidTransition(format!(
                "invoice {invoice_id} is already paid"
            )));
        }
        let settings = self.records.load_settings().await?;
        Ok(self
            .deliver_invoice(invoice.id, email, settings.as_ref())
            .await?)
    }

    /// The standard invoice email addressed to the invoice's client.
    pub async fn default_invoice_email(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<OutboundEmail, LifecycleError> {
        let invoice = self.records.get_invoice(invoice_id).await?;
        let project = self.records.get_project(invoice.project_id).await?;
        let client = self.resolve_client(invoice.client_id).await?;
        let settings = self.records.load_settings().await?;
        Ok(invoice_email(
            &invoice,
            &project.name,
            &client,
            settings.as_ref(),
        ))
    }

    /// Sends the proposal. A draft moves to sent; a sent proposal stays sent.
    pub async fn send_proposal_email(
        &self,
        proposal: &Proposal,
        email: &OutboundEmail,
    ) -> Result<Proposal, LifecycleError> {
        if proposal.status.is_terminal() {
            return Err(LifecycleError::InvalidTransition(format!(
                "proposal {} is {} and cannot be sent",
                proposal.id,
                proposal.status.as_str()
            )));
        }
        let settings = self.records.load_settings().await?;
        self.deliver(email, settings.as_ref()).await?;

        if proposal.status == ProposalStatus::Sent {
            return Ok(proposal.clone());
        }
        let updated = self
            .records
            .update_proposal(proposal.id, &ProposalPatch::status(ProposalStatus::Sent))
            .await?;
        self.emit(LifecycleEvent::ProposalStatusChanged {
            proposal_id: proposal.id,
            status: ProposalStatus::Sent,
        });
        Ok(updated)
    }

    pub async fn default_proposal_email(
        &self,
        proposal: &Proposal,
    ) -> Result<OutboundEmail, LifecycleError> {
        let client = self.resolve_client(proposal.client_id).await?;
        let settings = self.records.load_settings().await?;
        Ok(proposal_email(proposal, &client, settings.as_ref()))
    }

    pub async fn decline_proposal(&self, proposal: &Proposal) -> Result<Proposal, LifecycleError> {
        if !proposal.status.can_transition_to(ProposalStatus::Declined) {
            return Err(LifecycleError::InvalidTransition(format!(
                "proposal {} is {} and cannot be declined",
                proposal.id,
                proposal.status.as_str()
            )));
        }
        let updated = self
            .records
            .update_proposal(
                proposal.id,
                &ProposalPatch::status(ProposalStatus::Declined),
            )
            .await?;
        info!(proposal_id = proposal.id.0, "proposal declined");
        self.emit(LifecycleEvent::ProposalStatusChanged {
            proposal_id: proposal.id,
            status: ProposalStatus::Declined,
        });
        Ok(updated)
    }

    pub async fn mark_invoice_paid(
        &self,
        invoice_id: InvoiceId,
        paid_date: NaiveDate,
    ) -> Result<Invoice, LifecycleError> {
        let invoice = self.records.get_invoice(invoice_id).await?;
        if invoice.state.is_paid() {
            return Err(LifecycleError::InvalidTransition(format!(
                "invoice {invoice_id} is already paid"
            )));
        }
        let updated = self
            .records
            .update_invoice(
                invoice_id,
                &InvoicePatch {
                    state: InvoiceState::Paid { paid_date },
                },
            )
            .await?;
        info!(invoice_id = invoice_id.0, %paid_date, "invoice marked paid");
        self.emit(LifecycleEvent::InvoiceStatusChanged {
            invoice_id,
            status: updated.state.label(),
        });
        Ok(updated)
    }

    pub async fn dismiss_notification(
        &self,
        notification_id: NotificationId,
    ) -> Result<Notification, LifecycleError> {
        Ok(self
            .records
            .update_notification(
                notification_id,
                &NotificationPatch {
                    is_read: Some(true),
                },
            )
            .await?)
    }

    /// An accepted proposal with a project, or with a run still in flight, has
    /// been handled already.
    async fn ensure_unmaterialized(&self, proposal_id: ProposalId) -> Result<(), LifecycleError> {
        if let Some(project) = self
            .records
            .list_proposal_projects(proposal_id)
            .await?
            .first()
        {
            return Err(LifecycleError::InvalidTransition(format!(
                "proposal {proposal_id} is already accepted with project {}",
                project.id
            )));
        }
        let pending = self
            .incomplete_runs()
            .await?
            .into_iter()
            .find(|run| run.kind == SagaKind::AcceptProposal && run.subject_id == proposal_id.0);
        if let Some(run) = pending {
            return Err(LifecycleError::InvalidTransition(format!(
                "proposal {proposal_id} is already accepted; resume run {}",
                run.run_id
            )));
        }
        Ok(())
    }

        async fn resolve_client(&self, client_id: ClientId) -> Result<Client, LifecycleError> {
        self.records
            .get_client(client_id)
            .await
            .map_err(|source| LifecycleError::UnresolvableClient { client_id, source })
    }

    async fn start(
        &self,
        kind: SagaKind,
        subject_id: i64,
        context: SagaContext,
    ) -> Result<RunOutcome, LifecycleError> {
        let snapshot = context_value(&context)?;
        let run_id = self
            .journal
            .begin(kind, subject_id, &snapshot)
            .await
            .map_err(LifecycleError::Journal)?;
        info!(run_id = %run_id, kind = kind.as_str(), subject_id, "lifecycle run started");
        self.emit(LifecycleEvent::RunStarted {
            run_id: run_id.clone(),
            kind,
        });
        self.drive(run_id, kind, context, Vec::new()).await
    }

    async fn drive(
        &self,
        run_id: String,
        kind: SagaKind,
        mut context: SagaContext,
        mut completed: Vec<SagaStep>,
    ) -> Result<RunOutcome, LifecycleError> {
        for &step in steps_for(kind) {
            if completed.contains(&step) {
                continue;
            }
            match self.run_step(kind, step, &mut context).await {
                Ok(outcome) => {
                    let snapshot = context_value(&context)?;
                    self.journal
                        .record_step(&run_id, step.as_str(), &snapshot)
                        .await
                        .map_err(LifecycleError::Journal)?;
                    completed.push(step);
                    match outcome {
                        StepOutcome::Done => {
                            info!(run_id = %run_id, %step, "lifecycle step completed");
                            self.emit(LifecycleEvent::StepCompleted {
                                run_id: run_id.clone(),
                                step,
                            });
                        }
                        StepOutcome::Skipped => {
                            info!(run_id = %run_id, %step, "lifecycle step skipped");
                            self.emit(LifecycleEvent::StepSkipped {
                                run_id: run_id.clone(),
                                step,
                            });
                        }
                    }
                }
                Err(source) => {
                    let message = format!("{source:#}");
                    error!(run_id = %run_id, %step, error = %message, "lifecycle step failed");
                    if let Err(err) = self.journal.fail(&run_id, step.as_str(), &message).await {
                        warn!(run_id = %run_id, %err, "failed to journal step failure");
                    }
                    self.emit(LifecycleEvent::RunFailed {
                        run_id: run_id.clone(),
                        step,
                        error: message,
                    });
                    return Err(LifecycleError::StepFailed {
                        run_id,
                        step,
                        completed,
                        source,
                    });
                }
            }
        }

        self.journal
            .complete(&run_id)
            .await
            .map_err(LifecycleError::Journal)?;
        info!(run_id = %run_id, kind = kind.as_str(), "lifecycle run completed");
        self.emit(LifecycleEvent::RunCompleted {
            run_id: run_id.clone(),
            kind,
        });
        Ok(RunOutcome { run_id, context })
    }

    async fn run_step(
        &self,
        kind: SagaKind,
        step: SagaStep,
        ctx: &mut SagaContext,
    ) -> anyhow::Result<StepOutcome> {
        match step {
            SagaStep::MarkAccepted => {
                if ctx.already_accepted {
                    return Ok(StepOutcome::Skipped);
                }
                let proposal_id = ctx.proposal_id.context("run has no proposal")?;
                self.records
                    .update_proposal(proposal_id, &ProposalPatch::status(ProposalStatus::Accepted))
                    .await?;
                self.emit(LifecycleEvent::ProposalStatusChanged {
                    proposal_id,
                    status: ProposalStatus::Accepted,
                });
            }
            SagaStep::CreateProject => {
                let project = self
                    .records
                    .create_project(&NewProject {
                        client_id: ctx.client.id,
                        proposal_id: ctx.proposal_id,
                        name: ctx.project_name.clone(),
                        status: ProjectStatus::Active,
                        current_stage: Stage::Discovery,
                        stage_completion: StageCompletion::new(),
                        total_fee: ctx.total_fee,
                    })
                    .await?;
                ctx.project_id = Some(project.id);
            }
            SagaStep::Describe => {
                ctx.description = Some(self.describe_stage(&ctx.project_name, ctx.stage).await);
            }
            SagaStep::CreateInvoice => {
                let project_id = ctx.project_id.context("run has no project")?;
                if kind == SagaKind::CompleteStage {
                    self.warn_on_overbilling(project_id, ctx.stage).await?;
                }
                let description = ctx
                    .description
                    .clone()
                    .unwrap_or_else(|| template_description(&ctx.project_name, ctx.stage));
                let invoice = self
                    .records
                    .create_invoice(&NewInvoice {
                        project_id,
                        client_id: ctx.client.id,
                        stage: ctx.stage,
                        amount: stage_invoice_amount(ctx.total_fee, ctx.stage),
                        percentage: ctx.stage.percentage(),
                        description,
                        due_date: today() + Duration::days(self.options.invoice_due_days),
                        state: InvoiceState::Draft,
                    })
                    .await?;
                ctx.invoice_id = Some(invoice.id);
            }
            SagaStep::SendInvoice => {
                if !ctx.send_invoice {
                    return Ok(StepOutcome::Skipped);
                }
                let invoice_id = ctx.invoice_id.context("run has no invoice")?;
                let invoice = self.records.get_invoice(invoice_id).await?;
                let settings = self.records.load_settings().await?;
                let email = invoice_email(&invoice, &ctx.project_name, &ctx.client, settings.as_ref());
                self.deliver_invoice(invoice_id, &email, settings.as_ref())
                    .await?;
            }
            SagaStep::MarkStageComplete => {
                let project_id = ctx.project_id.context("run has no project")?;
                let project = self.records.get_project(project_id).await?;
                let mut completion = project.stage_completion;
                completion.mark(ctx.stage);
                self.records
                    .update_project(
                        project_id,
                        &ProjectPatch {
                            status: None,
                            current_stage: Some(next_stage(ctx.stage)),
                            stage_completion: Some(completion),
                        },
                    )
                    .await?;
            }
            SagaStep::Notify => {
                let Some(user_id) = ctx.client.user_id else {
                    return Ok(StepOutcome::Skipped);
                };
                let (title, message) = match kind {
                    SagaKind::AcceptProposal => (
                        "Your project has started".to_string(),
                        format!(
                            "{} is underway. The first invoice covers the {} stage.",
                            ctx.project_name,
                            ctx.stage.display_name()
                        ),
                    ),
                    SagaKind::CompleteStage => (
                        format!("{} completed", ctx.stage.display_name()),
                        format!(
                            "The {} stage of {} is complete and has been invoiced.",
                            ctx.stage.display_name(),
                            ctx.project_name
                        ),
                    ),
                };
                let notification = self
                    .records
                    .create_notification(&NewNotification {
                        user_id: Some(user_id),
                        title,
                        message,
                        link: ctx.project_id.map(|id| format!("/projects/{id}")),
                        is_read: false,
                    })
                    .await?;
                ctx.notification_id = Some(notification.id);
            }
        }
        Ok(StepOutcome::Done)
    }

    /// Asks the generator for an invoice description. Any transport or
    /// decode failure falls back to the template.
    async fn describe_stage(&self, project_name: &str, stage: Stage) -> String {
        let request = LlmRequest {
            prompt: format!(
                "{} phase for {project_name}\n\
                 Write one or two sentences describing the work in this stage for a client \
                 invoice. Answer as JSON with a `description` field.",
                stage.display_name()
            ),
            response_json_schema: Some(json!({
                "type": "object",
                "properties": { "description": { "type": "string" } },
                "required": ["description"],
            })),
        };
        match self.generator.generate(&request).await {
            Ok(response) => match decode_ai_response::<GeneratedDescription>(&response.output) {
                Ok(generated) if !generated.description.trim().is_empty() => {
                    return generated.description.trim().to_string();
                }
                Ok(_) => warn!(stage = stage.key(), "generated description is empty; using template"),
                Err(err) => {
                    warn!(stage = stage.key(), %err, "undecodable generation output; using template")
                }
            },
            Err(err) => warn!(stage = stage.key(), %err, "text generation failed; using template"),
        }
        template_description(project_name, stage)
    }

    async fn warn_on_overbilling(&self, project_id: ProjectId, stage: Stage) -> anyhow::Result<()> {
        let invoices = self.records.list_project_invoices(project_id).await?;
        let billed = billed_percentage(&invoices) + u32::from(stage.percentage());
        if billed > 100 {
            warn!(
                project_id = project_id.0,
                stage = stage.key(),
                billed,
                "project is billed for more than its total fee"
            );
        }
        Ok(())
    }

    async fn deliver(
        &self,
        email: &OutboundEmail,
        settings: Option<&Settings>,
    ) -> Result<String, ClientError> {
        let mailer = self.mailers.select(settings);
        let receipt = mailer.send(email).await.inspect_err(|err| {
            warn!(provider = mailer.provider(), to = %email.to, %err, "email delivery failed");
        })?;
        info!(provider = %receipt.provider, to = %email.to, "email sent");
        self.emit(LifecycleEvent::EmailSent {
            to: email.to.clone(),
            provider: receipt.provider.clone(),
        });
        Ok(receipt.provider)
    }

    async fn deliver_invoice(
        &self,
        invoice_id: InvoiceId,
        email: &OutboundEmail,
        settings: Option<&Settings>,
    ) -> Result<Invoice, ClientError> {
        self.deliver(email, settings).await?;
        let updated = self
            .records
            .update_invoice(
                invoice_id,
                &InvoicePatch {
                    state: InvoiceState::Sent {
                        sent_date: today(),
                    },
                },
            )
            .await?;
        self.emit(LifecycleEvent::InvoiceStatusChanged {
            invoice_id,
            status: updated.state.label(),
        });
        Ok(updated)
    }
}

pub fn template_description(project_name: &str, stage: Stage) -> String {
    format!(
        "{} phase for {project_name}: {}% of the total project fee.",
        stage.display_name(),
        stage.percentage()
    )
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn context_value(context: &SagaContext) -> Result<Value, LifecycleError> {
    serde_json::to_value(context)
        .context("failed to serialize run context")
        .map_err(LifecycleError::Journal)
}
