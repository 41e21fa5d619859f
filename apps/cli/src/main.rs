use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use client_core::{
    journal::SagaJournal,
    lifecycle::{LifecycleOptions, RunOutcome},
    ClientConfig, ClientError, DurableSagaJournal, LifecycleController, MailerSet,
    MemorySagaJournal, MissingTextGenerator, RecordApi, RestClient, TextGenerator,
};
use shared::{
    domain::{stage_ready, InvoiceId, NotificationId, ProjectId, ProposalId, Task, User},
    stage::{Stage, STAGES},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crm", about = "Drive proposal, project and invoice lifecycles")]
struct Cli {
    /// Client config file. Defaults to `crm.toml` in the working directory.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Skip the text generator and use template invoice descriptions.
    #[arg(long)]
    no_ai: bool,
    /// Issue requests on behalf of another user. Admins only.
    #[arg(long)]
    act_as: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange credentials for an api token.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    #[command(flatten)]
    Session(SessionCommand),
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    Whoami,
    Stats,
    SendProposal {
        proposal_id: i64,
    },
    AcceptProposal {
        proposal_id: i64,
        /// Email the discovery invoice right away.
        #[arg(long)]
        send_invoice: bool,
    },
    DeclineProposal {
        proposal_id: i64,
    },
    CompleteStage {
        project_id: i64,
        #[arg(value_parser = parse_stage)]
        stage: Stage,
    },
    SendInvoice {
        invoice_id: i64,
    },
    MarkPaid {
        invoice_id: i64,
        /// Payment date, today when omitted.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    DismissNotification {
        notification_id: i64,
    },
    /// Failed and unfinished lifecycle runs.
    Runs,
    Resume {
        run_id: String,
    },
}

fn parse_stage(raw: &str) -> Result<Stage, String> {
    Stage::from_key(raw).ok_or_else(|| {
        let known: Vec<&str> = STAGES.iter().map(|stage| stage.key()).collect();
        format!("unknown stage '{raw}', expected one of: {}", known.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = ClientConfig::load(cli.config.as_deref()).context("failed to load client config")?;
    let rest = Arc::new(RestClient::new(&config)?);

    match cli.command {
        Command::Login { email, password } => {
            let session = rest.login(&email, &password).await?;
            let user = session.authenticated_user();
            println!("logged in as {} (user {})", user.email, user.id);
            println!("export CRM__API_TOKEN={}", session.api_token());
            Ok(())
        }
        Command::Session(command) => {
            let token = config.api_token.as_deref().ok_or(ClientError::NoSession)?;
            rest.resume_session(token)
                .await
                .context("stored api token was rejected")?;
            if let Some(user_id) = cli.act_as {
                let user: User = rest
                    .get(user_id)
                    .await
                    .with_context(|| format!("failed to load user {user_id}"))?;
                rest.impersonate(user).await?;
            }

            let journal: Arc<dyn SagaJournal> = match config.journal_url() {
                Some(url) => DurableSagaJournal::initialize(url).await?,
                None => {
                    warn!("journal_database_url is blank; failed runs cannot be resumed later");
                    MemorySagaJournal::new()
                }
            };
            let generator: Arc<dyn TextGenerator> = if cli.no_ai {
                Arc::new(MissingTextGenerator)
            } else {
                rest.clone()
            };
            let controller = LifecycleController::new_with_dependencies(
                rest.clone(),
                generator,
                MailerSet::over_rest(rest.clone()),
                journal,
                LifecycleOptions::from(&config),
            );
            run(command, &rest, &controller).await
        }
    }
}

async fn run(
    command: SessionCommand,
    rest: &RestClient,
    controller: &LifecycleController,
) -> Result<()> {
    match command {
        SessionCommand::Whoami => {
            if let Some(session) = rest.session().await {
                let user = session.effective_user();
                println!("{} (user {}, {:?})", user.email, user.id, user.role);
                if session.is_impersonating() {
                    println!("impersonated by {}", session.authenticated_user().email);
                }
            }
        }
        SessionCommand::Stats => {
            let stats = rest.dashboard_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        SessionCommand::SendProposal { proposal_id } => {
            let proposal = rest.get_proposal(ProposalId(proposal_id)).await?;
            let email = controller.default_proposal_email(&proposal).await?;
            let proposal = controller.send_proposal_email(&proposal, &email).await?;
            println!(
                "proposal {} sent to {}, now {}",
                proposal.id,
                email.to,
                proposal.status.as_str()
            );
        }
        SessionCommand::AcceptProposal {
            proposal_id,
            send_invoice,
        } => {
            let proposal = rest.get_proposal(ProposalId(proposal_id)).await?;
            let outcome = if send_invoice {
                controller.accept_proposal_with(&proposal, true).await?
            } else {
                controller.accept_proposal(&proposal).await?
            };
            print_outcome(&outcome);
        }
        SessionCommand::DeclineProposal { proposal_id } => {
            let proposal = rest.get_proposal(ProposalId(proposal_id)).await?;
            let proposal = controller.decline_proposal(&proposal).await?;
            println!("proposal {} declined", proposal.id);
        }
        SessionCommand::CompleteStage { project_id, stage } => {
            let tasks: Vec<Task> = rest.list(&[("project_id", project_id.to_string())]).await?;
            if !stage_ready(&tasks, stage) {
                warn!(
                    project_id,
                    stage = stage.key(),
                    "stage still has open tasks; completing anyway"
                );
            }
            let outcome = controller
                .complete_project_stage(ProjectId(project_id), stage)
                .await?;
            print_outcome(&outcome);
            let project = rest.get_project(ProjectId(project_id)).await?;
            let completion = &project.stage_completion;
            println!(
                "  {} of {} stages complete, {}% billed",
                completion.completed_count(),
                STAGES.len(),
                completion.progress_percent()
            );
            if project.is_finished() {
                println!("  all stages complete");
            } else {
                println!("  current stage: {}", project.current_stage.display_name());
            }
        }
        SessionCommand::SendInvoice { invoice_id } => {
            let email = controller
                .default_invoice_email(InvoiceId(invoice_id))
                .await?;
            let invoice = controller
                .send_invoice_email(InvoiceId(invoice_id), &email)
                .await?;
            println!(
                "invoice {} sent to {}, now {}",
                invoice.id,
                email.to,
                invoice.state.label()
            );
        }
        SessionCommand::MarkPaid { invoice_id, date } => {
            let paid_date = date.unwrap_or_else(|| Local::now().date_naive());
            let invoice = controller
                .mark_invoice_paid(InvoiceId(invoice_id), paid_date)
                .await?;
            println!("invoice {} paid on {paid_date}", invoice.id);
        }
        SessionCommand::DismissNotification { notification_id } => {
            controller
                .dismiss_notification(NotificationId(notification_id))
                .await?;
            println!("notification {notification_id} dismissed");
        }
        SessionCommand::Runs => {
            let runs = controller.incomplete_runs().await?;
            if runs.is_empty() {
                println!("no unfinished runs");
            }
            for run in runs {
                println!(
                    "{} {} subject={} status={} failed_step={} completed=[{}]",
                    run.run_id,
                    run.kind.as_str(),
                    run.subject_id,
                    run.status.as_str(),
                    run.failed_step.as_deref().unwrap_or("-"),
                    run.completed_steps.join(", "),
                );
                if let Some(error) = &run.last_error {
                    println!("    {error}");
                }
            }
        }
        SessionCommand::Resume { run_id } => {
            let outcome = controller.resume(&run_id).await?;
            print_outcome(&outcome);
        }
    }
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    println!("run {} completed", outcome.run_id);
    if let Some(project_id) = outcome.context.project_id {
        println!("  project {project_id}: {}", outcome.context.project_name);
    }
    if let Some(invoice_id) = outcome.context.invoice_id {
        println!(
            "  invoice {invoice_id} for {}",
            outcome.context.stage.display_name()
        );
    }
}
