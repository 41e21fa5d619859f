use async_trait::async_trait;
use shared::{
    domain::{
        Client, ClientId, Invoice, InvoiceId, Notification, NotificationId, Project, ProjectId,
        Proposal, ProposalId, Settings,
    },
    protocol::{
        InvoicePatch, LlmRequest, LlmResponse, NewInvoice, NewNotification, NewProject,
        NotificationPatch, ProjectPatch, ProposalPatch,
    },
};

pub mod ai_response;
pub mod config;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod mailer;
pub mod rest;
pub mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use journal::{DurableSagaJournal, MemorySagaJournal, SagaJournal};
pub use lifecycle::{LifecycleController, LifecycleError, LifecycleEvent};
pub use mailer::{DefaultMailer, GmailMailer, Mailer, MailerSet};
pub use rest::RestClient;
pub use session::{SessionContext, SessionError};

/// Typed record operations the lifecycle flows are built from.
#[async_trait]
pub trait RecordApi: Send + Sync {
    async fn get_proposal(&self, id: ProposalId) -> Result<Proposal, ClientError>;
    async fn update_proposal(
        &self,
        id: ProposalId,
        patch: &ProposalPatch,
    ) -> Result<Proposal, ClientError>;
    async fn get_client(&self, id: ClientId) -> Result<Client, ClientError>;
    async fn get_project(&self, id: ProjectId) -> Result<Project, ClientError>;
    async fn list_proposal_projects(&self, proposal_id: ProposalId)
        -> Result<Vec<Project>, ClientError>;
    async fn create_project(&self, project: &NewProject) -> Result<Project, ClientError>;
    async fn update_project(
        &self,
        id: ProjectId,
        patch: &ProjectPatch,
    ) -> Result<Project, ClientError>;
    async fn get_invoice(&self, id: InvoiceId) -> Result<Invoice, ClientError>;
    async fn list_project_invoices(&self, project_id: ProjectId)
        -> Result<Vec<Invoice>, ClientError>;
    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, ClientError>;
    async fn update_invoice(
        &self,
        id: InvoiceId,
        patch: &InvoicePatch,
    ) -> Result<Invoice, ClientError>;
    async fn create_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, ClientError>;
    async fn update_notification(
        &self,
        id: NotificationId,
        patch: &NotificationPatch,
    ) -> Result<Notification, ClientError>;
    /// The single settings record, if one exists.
    async fn load_settings(&self) -> Result<Option<Settings>, ClientError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ClientError>;
}

/// Used when no generator is configured; every description falls back to
/// its template.
pub struct MissingTextGenerator;

#[async_trait]
impl TextGenerator for MissingTextGenerator {
    async fn generate(&self, _request: &LlmRequest) -> Result<LlmResponse, ClientError> {
        Err(ClientError::NotConfigured("text generation"))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
