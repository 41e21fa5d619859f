//! Outbound email through one of the two senders the record service offers.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{Client, Invoice, Proposal, Settings},
    protocol::{EmailReceipt, OutboundEmail},
};

use crate::{error::ClientError, rest::RestClient};

#[async_trait]
pub trait Mailer: Send + Sync {
    fn provider(&self) -> &'static str;
    async fn send(&self, email: &OutboundEmail) -> Result<EmailReceipt, ClientError>;
}

/// The service's built-in mail integration.
pub struct DefaultMailer {
    rest: Arc<RestClient>,
}

impl DefaultMailer {
    pub fn new(rest: Arc<RestClient>) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl Mailer for DefaultMailer {
    fn provider(&self) -> &'static str {
        "default"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<EmailReceipt, ClientError> {
        self.rest.send_email(email).await
    }
}

/// Sends from the connected Gmail account.
pub struct GmailMailer {
    rest: Arc<RestClient>,
}

impl GmailMailer {
    pub fn new(rest: Arc<RestClient>) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl Mailer for GmailMailer {
    fn provider(&self) -> &'static str {
        "gmail"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<EmailReceipt, ClientError> {
        self.rest.send_gmail(email).await
    }
}

#[derive(Clone)]
pub struct MailerSet {
    pub default: Arc<dyn Mailer>,
    pub gmail: Arc<dyn Mailer>,
}

impl MailerSet {
    pub fn over_rest(rest: Arc<RestClient>) -> Self {
        Self {
            default: Arc::new(DefaultMailer::new(rest.clone())),
            gmail: Arc::new(GmailMailer::new(rest)),
        }
    }

    /// Gmail when a refresh token is stored, the default mailer otherwise.
    /// There is no fallback between the two.
    pub fn select(&self, settings: Option<&Settings>) -> &Arc<dyn Mailer> {
        if settings.is_some_and(Settings::has_gmail_connection) {
            &self.gmail
        } else {
            &self.default
        }
    }
}

fn sender_name(settings: Option<&Settings>) -> Option<String> {
    settings.and_then(|settings| settings.company_name.clone())
}

pub fn invoice_email(
    invoice: &Invoice,
    project_name: &str,
    client: &Client,
    settings: Option<&Settings>,
) -> OutboundEmail {
    let stage = invoice.stage.display_name();
    OutboundEmail {
        to: client.email.clone(),
        subject: format!("Invoice #{}: {project_name} ({stage})", invoice.id),
        html_body: format!(
            "<p>Hello {name},</p>\
             <p>Please find the invoice for the <strong>{stage}</strong> stage of \
             <strong>{project_name}</strong>.</p>\
             <p>{description}</p>\
             <p>Amount due: <strong>${amount:.2}</strong> ({percentage}% of the project fee)<br>\
             Due date: {due}</p>",
            name = client.name,
            description = invoice.description,
            amount = invoice.amount,
            percentage = invoice.percentage,
            due = invoice.due_date.format("%B %-d, %Y"),
        ),
        from_name: sender_name(settings),
    }
}

pub fn proposal_email(
    proposal: &Proposal,
    client: &Client,
    settings: Option<&Settings>,
) -> OutboundEmail {
    let body = proposal
        .generated_content
        .as_deref()
        .unwrap_or("The full proposal is attached to your client portal.");
    OutboundEmail {
        to: client.email.clone(),
        subject: format!("Proposal: {}", proposal.title),
        html_body: format!(
            "<p>Hello {name},</p><p>{body}</p>\
             <p>Total project fee: <strong>${fee:.2}</strong></p>",
            name = client.name,
            fee = proposal.total_fee,
        ),
        from_name: sender_name(settings),
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::SettingsId;

    use super::*;

    struct NamedMailer(&'static str);

    #[async_trait]
    impl Mailer for NamedMailer {
        fn provider(&self) -> &'static str {
            self.0
        }

        async fn send(&self, _email: &OutboundEmail) -> Result<EmailReceipt, ClientError> {
            Ok(EmailReceipt {
                provider: self.0.to_string(),
                message_id: 1,
            })
        }
    }

    fn settings(token: Option<&str>) -> Settings {
        Settings {
            id: SettingsId(1),
            company_name: Some("Studio".into()),
            gmail_address: Some("studio@gmail.test".into()),
            gmail_refresh_token: token.map(str::to_string),
        }
    }

    #[test]
    fn refresh_token_selects_gmail() {
        let set = MailerSet {
            default: Arc::new(NamedMailer("default")),
            gmail: Arc::new(NamedMailer("gmail")),
        };
        assert_eq!(set.select(None).provider(), "default");
        assert_eq!(set.select(Some(&settings(None))).provider(), "default");
        assert_eq!(set.select(Some(&settings(Some("  ")))).provider(), "default");
        assert_eq!(set.select(Some(&settings(Some("refresh")))).provider(), "gmail");
    }

    #[test]
    fn proposal_email_uses_generated_content_and_company_name() {
        let proposal = Proposal {
            id: shared::domain::ProposalId(3),
            client_id: shared::domain::ClientId(1),
            title: "Website rebuild".into(),
            total_fee: 10_000.0,
            status: Default::default(),
            generated_content: Some("Scope and timeline".into()),
        };
        let client = Client {
            id: shared::domain::ClientId(1),
            user_id: None,
            name: "Acme".into(),
            email: "ops@acme.test".into(),
            company: None,
        };
        let email = proposal_email(&proposal, &client, Some(&settings(None)));
        assert_eq!(email.to, "ops@acme.test");
        assert_eq!(email.subject, "Proposal: Website rebuild");
        assert!(email.html_body.contains("Scope and timeline"));
        assert!(email.html_body.contains("$10000.00"));
        assert_eq!(email.from_name.as_deref(), Some("Studio"));
    }
}
