use std::fmt;

use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::stage::{Stage, StageCompletion};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ProposalId);
id_newtype!(ProjectId);
id_newtype!(InvoiceId);
id_newtype!(ClientId);
id_newtype!(UserId);
id_newtype!(TaskId);
id_newtype!(NotificationId);
id_newtype!(SettingsId);
id_newtype!(InvitationId);

/// A record type stored in one of the record service's collections.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;

    fn record_id(&self) -> i64;
}

macro_rules! entity {
    ($ty:ty, $collection:literal) => {
        impl Entity for $ty {
            const COLLECTION: &'static str = $collection;

            fn record_id(&self) -> i64 {
                self.id.0
            }
        }
    };
}

pub const COLLECTIONS: [&str; 9] = [
    "proposals",
    "projects",
    "invoices",
    "clients",
    "users",
    "tasks",
    "notifications",
    "settings",
    "user_invitations",
];

pub fn is_known_collection(name: &str) -> bool {
    COLLECTIONS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Draft,
    Sent,
    Accepted,
    Declined,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProposalStatus::Accepted | ProposalStatus::Declined)
    }

    /// `draft -> sent -> accepted|declined`, plus the admin "proceed" shortcut
    /// `draft -> accepted`. Terminal states never move.
    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Draft, Accepted) | (Sent, Accepted) | (Sent, Declined)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Draft => "draft",
            ProposalStatus::Sent => "sent",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Declined => "declined",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub client_id: ClientId,
    pub title: String,
    pub total_fee: f64,
    #[serde(default)]
    pub status: ProposalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_content: Option<String>,
}

entity!(Proposal, "proposals");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Proposal,
    #[default]
    Active,
    Completed,
    OnHold,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub client_id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
    pub name: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub current_stage: Stage,
    #[serde(default)]
    pub stage_completion: StageCompletion,
    pub total_fee: f64,
}

entity!(Project, "projects");

impl Project {
    pub fn is_finished(&self) -> bool {
        self.stage_completion.all_complete()
    }
}

/// Invoice status together with the data each status requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvoiceState {
    Draft,
    Sent {
        sent_date: NaiveDate,
    },
    Paid {
        paid_date: NaiveDate,
    },
    Overdue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sent_date: Option<NaiveDate>,
    },
}

impl InvoiceState {
    pub fn label(&self) -> &'static str {
        match self {
            InvoiceState::Draft => "draft",
            InvoiceState::Sent { .. } => "sent",
            InvoiceState::Paid { .. } => "paid",
            InvoiceState::Overdue { .. } => "overdue",
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, InvoiceState::Paid { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub project_id: ProjectId,
    pub client_id: ClientId,
    pub stage: Stage,
    pub amount: f64,
    pub percentage: u8,
    #[serde(default)]
    pub description: String,
    pub due_date: NaiveDate,
    #[serde(flatten)]
    pub state: InvoiceState,
}

entity!(Invoice, "invoices");

/// Sum of stage percentages already billed across an invoice series.
pub fn billed_percentage(invoices: &[Invoice]) -> u32 {
    invoices
        .iter()
        .map(|invoice| u32::from(invoice.percentage))
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

entity!(Client, "clients");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    User,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub role: Role,
}

entity!(User, "users");

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub stage: Stage,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
}

entity!(Task, "tasks");

/// Advisory check shown before a stage may be completed: every task filed
/// under `stage` is done. A stage without tasks is ready.
pub fn stage_ready(tasks: &[Task], stage: Stage) -> bool {
    tasks
        .iter()
        .filter(|task| task.stage == stage)
        .all(|task| task.completed)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
}

entity!(Notification, "notifications");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub id: SettingsId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmail_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gmail_refresh_token: Option<String>,
}

entity!(Settings, "settings");

impl Settings {
    pub fn has_gmail_connection(&self) -> bool {
        self.gmail_refresh_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    #[default]
    Pending,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInvitation {
    pub id: InvitationId,
    pub email: String,
    pub client_id: ClientId,
    #[serde(default)]
    pub status: InvitationStatus,
}

entity!(UserInvitation, "user_invitations");

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ProposalStatus; 4] = [
        ProposalStatus::Draft,
        ProposalStatus::Sent,
        ProposalStatus::Accepted,
        ProposalStatus::Declined,
    ];

    #[test]
    fn terminal_proposals_never_move_back() {
        for terminal in [ProposalStatus::Accepted, ProposalStatus::Declined] {
            for next in ALL {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} must be rejected"
                );
            }
        }
    }

    #[test]
    fn proceed_shortcut_skips_sent() {
        assert!(ProposalStatus::Draft.can_transition_to(ProposalStatus::Accepted));
        assert!(!ProposalStatus::Draft.can_transition_to(ProposalStatus::Declined));
        assert!(ProposalStatus::Sent.can_transition_to(ProposalStatus::Declined));
    }

    #[test]
    fn paid_invoice_requires_paid_date() {
        let json = serde_json::json!({
            "id": 1,
            "project_id": 2,
            "client_id": 3,
            "stage": "discovery",
            "amount": 1500.0,
            "percentage": 15,
            "due_date": "2026-01-31",
            "status": "paid"
        });
        assert!(serde_json::from_value::<Invoice>(json).is_err());
    }

    #[test]
    fn invoice_state_flattens_into_record() {
        let json = serde_json::json!({
            "id": 1,
            "project_id": 2,
            "client_id": 3,
            "stage": "testing",
            "amount": 750.0,
            "percentage": 15,
            "description": "QA pass",
            "due_date": "2026-01-31",
            "status": "sent",
            "sent_date": "2026-01-10"
        });
        let invoice: Invoice = serde_json::from_value(json).expect("invoice");
        assert_eq!(
            invoice.state,
            InvoiceState::Sent {
                sent_date: NaiveDate::from_ymd_opt(2026, 1, 10).expect("date")
            }
        );

        let back = serde_json::to_value(&invoice).expect("serialize");
        assert_eq!(back["status"], "sent");
        assert_eq!(back["sent_date"], "2026-01-10");
    }

    #[test]
    fn project_finishes_only_when_every_stage_is_complete() {
        let mut project = Project {
            id: ProjectId(1),
            client_id: ClientId(1),
            proposal_id: None,
            name: "Site".into(),
            status: ProjectStatus::Active,
            current_stage: Stage::TrainingMaintenance,
            stage_completion: StageCompletion::new(),
            total_fee: 1_000.0,
        };
        project.stage_completion.mark(Stage::TrainingMaintenance);
        assert!(!project.is_finished());
        for stage in crate::stage::STAGES {
            project.stage_completion.mark(stage);
        }
        assert!(project.is_finished());
    }

    #[test]
    fn stage_ready_only_considers_matching_tasks() {
        let tasks = vec![
            Task {
                id: TaskId(1),
                project_id: ProjectId(1),
                stage: Stage::Discovery,
                title: "kickoff".into(),
                completed: true,
            },
            Task {
                id: TaskId(2),
                project_id: ProjectId(1),
                stage: Stage::Development,
                title: "build".into(),
                completed: false,
            },
        ];
        assert!(stage_ready(&tasks, Stage::Discovery));
        assert!(!stage_ready(&tasks, Stage::Development));
        assert!(stage_ready(&tasks, Stage::Testing));
    }

    #[test]
    fn gmail_connection_requires_non_blank_token() {
        let mut settings = Settings {
            id: SettingsId(1),
            company_name: None,
            gmail_address: None,
            gmail_refresh_token: Some("  ".into()),
        };
        assert!(!settings.has_gmail_connection());
        settings.gmail_refresh_token = Some("refresh".into());
        assert!(settings.has_gmail_connection());
    }
}
