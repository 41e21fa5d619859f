//! HTTP client for the record service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use shared::{
    domain::{
        Client as CrmClient, ClientId, Entity, Invoice, InvoiceId, Notification, NotificationId,
        Project, ProjectId, Proposal, ProposalId, Settings, User,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        DashboardStats, EmailReceipt, InvoicePatch, LlmRequest, LlmResponse, LoginRequest,
        LoginResponse, NewInvoice, NewNotification, NewProject, NotificationPatch, OutboundEmail,
        ProjectPatch, ProposalPatch,
    },
};
use tokio::sync::RwLock;
use tracing::info;

use crate::{
    config::ClientConfig,
    error::ClientError,
    session::{SessionContext, SessionError},
    RecordApi, TextGenerator,
};

pub const ACTING_AS_HEADER: &str = "X-Acting-As";

pub struct RestClient {
    http: Client,
    base_url: String,
    session: RwLock<Option<SessionContext>>,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let base_url = config.api_base_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&base_url).map_err(|source| ClientError::InvalidBaseUrl {
            url: base_url.clone(),
            source,
        })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|source| ClientError::Transport {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self {
            http,
            base_url,
            session: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn session(&self) -> Option<SessionContext> {
        self.session.read().await.clone()
    }

    pub async fn set_session(&self, session: SessionContext) {
        *self.session.write().await = Some(session);
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<SessionContext, ClientError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let response: LoginResponse = self
            .send(self.request(Method::POST, "/auth/login").await.json(&request))
            .await?;
        info!(user_id = response.user.id.0, "logged in");
        let session = SessionContext::from_login(response);
        self.set_session(session.clone()).await;
        Ok(session)
    }

    /// Starts a session from a token issued earlier by `login`.
    pub async fn resume_session(&self, api_token: &str) -> Result<SessionContext, ClientError> {
        let path = "/auth/me";
        let url = self.url(path);
        let builder = self.http.get(&url).bearer_auth(api_token);
        let user: User = self.send(builder).await?;
        let session = SessionContext::new(user, api_token);
        self.set_session(session.clone()).await;
        Ok(session)
    }

    /// Admin-only. Later requests carry the acting-as header.
    pub async fn impersonate(&self, user: User) -> Result<(), SessionError> {
        let mut guard = self.session.write().await;
        match guard.as_mut() {
            Some(session) => session.impersonate(user),
            None => Err(SessionError::NotSignedIn),
        }
    }

    pub async fn stop_impersonating(&self) {
        if let Some(session) = self.session.write().await.as_mut() {
            session.stop_impersonating();
        }
    }

    pub async fn list<T: Entity>(&self, filters: &[(&str, String)]) -> Result<Vec<T>, ClientError> {
        let path = format!("/entities/{}", T::COLLECTION);
        self.send(self.request(Method::GET, &path).await.query(filters))
            .await
    }

    pub async fn get<T: Entity>(&self, id: i64) -> Result<T, ClientError> {
        let path = format!("/entities/{}/{id}", T::COLLECTION);
        self.send(self.request(Method::GET, &path).await).await
    }

    pub async fn create<T: Entity, B: Serialize + Sync>(&self, body: &B) -> Result<T, ClientError> {
        let path = format!("/entities/{}", T::COLLECTION);
        self.send(self.request(Method::POST, &path).await.json(body))
            .await
    }

    pub async fn update<T: Entity, P: Serialize + Sync>(
        &self,
        id: i64,
        patch: &P,
    ) -> Result<T, ClientError> {
        let path = format!("/entities/{}/{id}", T::COLLECTION);
        self.send(self.request(Method::PATCH, &path).await.json(patch))
            .await
    }

    pub async fn list_raw(
        &self,
        collection: &str,
        filters: &[(String, String)],
    ) -> Result<Vec<Value>, ClientError> {
        let path = format!("/entities/{collection}");
        self.send(self.request(Method::GET, &path).await.query(filters))
            .await
    }

    pub async fn get_raw(&self, collection: &str, id: i64) -> Result<Value, ClientError> {
        let path = format!("/entities/{collection}/{id}");
        self.send(self.request(Method::GET, &path).await).await
    }

    pub async fn create_raw(&self, collection: &str, body: &Value) -> Result<Value, ClientError> {
        let path = format!("/entities/{collection}");
        self.send(self.request(Method::POST, &path).await.json(body))
            .await
    }

    pub async fn update_raw(
        &self,
        collection: &str,
        id: i64,
        patch: &Value,
    ) -> Result<Value, ClientError> {
        let path = format!("/entities/{collection}/{id}");
        self.send(self.request(Method::PATCH, &path).await.json(patch))
            .await
    }

    pub async fn delete_raw(&self, collection: &str, id: i64) -> Result<(), ClientError> {
        let path = format!("/entities/{collection}/{id}");
        self.send_empty(self.request(Method::DELETE, &path).await)
            .await
    }

    pub async fn send_email(&self, email: &OutboundEmail) -> Result<EmailReceipt, ClientError> {
        self.send(
            self.request(Method::POST, "/integrations/email")
                .await
                .json(email),
        )
        .await
    }

    pub async fn send_gmail(&self, email: &OutboundEmail) -> Result<EmailReceipt, ClientError> {
        self.send(
            self.request(Method::POST, "/functions/send_gmail")
                .await
                .json(email),
        )
        .await
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardStats, ClientError> {
        self.send(self.request(Method::GET, "/functions/dashboard_stats").await)
            .await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, self.url(path));
        if let Some(session) = self.session.read().await.as_ref() {
            builder = builder.bearer_auth(session.api_token());
            if let Some(user) = session.acting_as() {
                builder = builder.header(ACTING_AS_HEADER, user.id.0.to_string());
            }
        }
        builder
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let (url, response) = self.execute(builder).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport {
                url: url.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode { url, source })
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), ClientError> {
        self.execute(builder).await.map(|_| ())
    }

    /// Sends the request and turns any non-success status into
    /// [`ClientError::Api`], keeping the service's error body when it has one.
    async fn execute(&self, builder: RequestBuilder) -> Result<(String, Response), ClientError> {
        let response = builder.send().await.map_err(|source| ClientError::Transport {
            url: source
                .url()
                .map(ToString::to_string)
                .unwrap_or_else(|| self.base_url.clone()),
            source,
        })?;
        let url = response.url().to_string();
        let status = response.status();
        if status.is_success() {
            return Ok((url, response));
        }

        let body = response.text().await.unwrap_or_default();
        let error = serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
            let code = match status.as_u16() {
                401 => ErrorCode::Unauthorized,
                403 => ErrorCode::Forbidden,
                404 => ErrorCode::NotFound,
                409 => ErrorCode::Conflict,
                400 | 422 => ErrorCode::Validation,
                _ => ErrorCode::Internal,
            };
            ApiError::new(code, body)
        });
        Err(ClientError::Api {
            url,
            status: status.as_u16(),
            error,
        })
    }
}

#[async_trait]
impl RecordApi for RestClient {
    async fn get_proposal(&self, id: ProposalId) -> Result<Proposal, ClientError> {
        self.get(id.0).await
    }

    async fn update_proposal(
        &self,
        id: ProposalId,
        patch: &ProposalPatch,
    ) -> Result<Proposal, ClientError> {
        self.update(id.0, patch).await
    }

    async fn get_client(&self, id: ClientId) -> Result<CrmClient, ClientError> {
        self.get(id.0).await
    }

    async fn get_project(&self, id: ProjectId) -> Result<Project, ClientError> {
        self.get(id.0).await
    }

    async fn list_proposal_projects(
        &self,
        proposal_id: ProposalId,
    ) -> Result<Vec<Project>, ClientError> {
        self.list(&[("proposal_id", proposal_id.0.to_string())]).await
    }

    async fn create_project(&self, project: &NewProject) -> Result<Project, ClientError> {
        self.create(project).await
    }

    async fn update_project(
        &self,
        id: ProjectId,
        patch: &ProjectPatch,
    ) -> Result<Project, ClientError> {
        self.update(id.0, patch).await
    }

    async fn get_invoice(&self, id: InvoiceId) -> Result<Invoice, ClientError> {
        self.get(id.0).await
    }

    async fn list_project_invoices(&self, project_id: ProjectId) -> Result<Vec<Invoice>, ClientError> {
        self.list(&[("project_id", project_id.0.to_string())]).await
    }

    async fn create_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, ClientError> {
        self.create(invoice).await
    }

    async fn update_invoice(
        &self,
        id: InvoiceId,
        patch: &InvoicePatch,
    ) -> Result<Invoice, ClientError> {
        self.update(id.0, patch).await
    }

    async fn create_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, ClientError> {
        self.create(notification).await
    }

    async fn update_notification(
        &self,
        id: NotificationId,
        patch: &NotificationPatch,
    ) -> Result<Notification, ClientError> {
        self.update(id.0, patch).await
    }

    async fn load_settings(&self) -> Result<Option<Settings>, ClientError> {
        let settings: Vec<Settings> = self.list(&[]).await?;
        Ok(settings.into_iter().next())
    }
}

#[async_trait]
impl TextGenerator for RestClient {
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, ClientError> {
        self.send(
            self.request(Method::POST, "/integrations/llm")
                .await
                .json(request),
        )
        .await
    }
}
