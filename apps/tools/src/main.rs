use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use server_api::{ApiContext, AuthConfig, Caller};
use storage::Storage;

/// Direct access to the record service database, for bootstrapping and repair.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/crm.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a user who can log in. The password is stored hashed.
    CreateUser {
        email: String,
        password: String,
        #[arg(long, default_value = "")]
        full_name: String,
        #[arg(long, default_value = "admin")]
        role: String,
    },
    List {
        collection: String,
        /// `field=value` equality filters.
        #[arg(long = "where")]
        filters: Vec<String>,
    },
    Get {
        collection: String,
        id: i64,
    },
    Put {
        collection: String,
        body: String,
    },
    Patch {
        collection: String,
        id: i64,
        body: String,
    },
    Delete {
        collection: String,
        id: i64,
    },
    /// Emails recorded by the built-in mail integrations.
    Outbox,
}

fn parse_body(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| anyhow!("body is not valid JSON: {err}"))
}

fn parse_filter(raw: &str) -> Result<(String, String)> {
    raw.split_once('=')
        .map(|(field, value)| (field.trim().to_string(), value.trim().to_string()))
        .ok_or_else(|| anyhow!("filter '{raw}' is not of the form field=value"))
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let ctx = ApiContext {
        storage: storage.clone(),
        auth: AuthConfig {
            jwt_secret: String::new(),
            token_ttl_seconds: 0,
        },
    };

    match cli.command {
        Command::CreateUser {
            email,
            password,
            full_name,
            role,
        } => {
            let body = json!({
                "email": email,
                "password": password,
                "full_name": full_name,
                "role": role,
            });
            let user = server_api::create_record(&ctx, Caller::Operator, "users", body).await?;
            println!("created user_id={}", user["id"]);
        }
        Command::List {
            collection,
            filters,
        } => {
            let filters = filters
                .iter()
                .map(|raw| parse_filter(raw))
                .collect::<Result<Vec<_>>>()?;
            let records = server_api::list_records(&ctx, &collection, &filters).await?;
            print(&Value::Array(records))?;
        }
        Command::Get { collection, id } => {
            let record = server_api::get_record(&ctx, &collection, id).await?;
            print(&record)?;
        }
        Command::Put { collection, body } => {
            let body = parse_body(&body)?;
            let record =
                server_api::create_record(&ctx, Caller::Operator, &collection, body).await?;
            print(&record)?;
        }
        Command::Patch {
            collection,
            id,
            body,
        } => {
            let patch = parse_body(&body)?;
            let record =
                server_api::update_record(&ctx, Caller::Operator, &collection, id, patch).await?;
            print(&record)?;
        }
        Command::Delete { collection, id } => {
            server_api::delete_record(&ctx, Caller::Operator, &collection, id).await?;
            println!("deleted {collection}/{id}");
        }
        Command::Outbox => {
            for email in storage.list_outbox().await? {
                println!(
                    "#{} {} via {} to {}: {}",
                    email.id,
                    email.sent_at.format("%Y-%m-%d %H:%M"),
                    email.provider,
                    email.recipient,
                    email.subject
                );
            }
        }
    }

    Ok(())
}
