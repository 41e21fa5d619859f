use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use shared::{
    domain::{
        is_known_collection, Client, Invoice, Notification, Project, Proposal, Role, Settings,
        Task, User, UserInvitation,
    },
    error::{ApiError, ErrorCode},
};
use storage::{Storage, StoredRecord};
use tracing::info;

pub mod actions;
pub mod auth;
pub mod public;

pub use auth::{AuthConfig, Claims};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
}

const PASSWORD_FIELD: &str = "password";
const PASSWORD_HASH_FIELD: &str = "password_hash";

/// Who a record write is made for. Operator writes come from local tooling
/// and from servers running without bearer auth.
#[derive(Debug, Clone, Copy)]
pub enum Caller<'a> {
    Operator,
    Signed(&'a Claims),
}

impl Caller<'_> {
    fn is_admin(&self) -> bool {
        match self {
            Caller::Operator => true,
            Caller::Signed(claims) => claims.role == Role::Admin,
        }
    }
}

pub async fn list_records(
    ctx: &ApiContext,
    collection: &str,
    filters: &[(String, String)],
) -> Result<Vec<Value>, ApiError> {
    ensure_collection(collection)?;
    if filters.iter().any(|(field, _)| field == PASSWORD_HASH_FIELD) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "records cannot be filtered on password_hash",
        ));
    }
    let records = if filters.is_empty() {
        ctx.storage.list_records(collection).await
    } else {
        ctx.storage.filter_records(collection, filters).await
    }
    .map_err(internal)?;
    Ok(records.into_iter().map(public_body).collect())
}

pub async fn get_record(ctx: &ApiContext, collection: &str, id: i64) -> Result<Value, ApiError> {
    ensure_collection(collection)?;
    load_record(ctx, collection, id).await.map(public_body)
}

pub async fn create_record(
    ctx: &ApiContext,
    caller: Caller<'_>,
    collection: &str,
    body: Value,
) -> Result<Value, ApiError> {
    ensure_collection(collection)?;
    let Value::Object(mut fields) = body else {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "record body must be a JSON object",
        ));
    };
    if collection == "users" {
        guard_user_write(caller, None, &fields)?;
        hash_password_field(&mut fields)?;
    }

    let mut candidate = fields.clone();
    candidate.insert("id".into(), Value::from(0));
    validate_shape(collection, &Value::Object(candidate))?;

    let record = ctx
        .storage
        .insert_record(collection, Value::Object(fields))
        .await
        .map_err(internal)?;
    info!(collection, id = record.id, "record created");
    Ok(public_body(record))
}

/// Merges the top-level keys of `patch` into the stored record. The merged
/// record must still describe a valid entity.
pub async fn update_record(
    ctx: &ApiContext,
    caller: Caller<'_>,
    collection: &str,
    id: i64,
    patch: Value,
) -> Result<Value, ApiError> {
    ensure_collection(collection)?;
    let Value::Object(mut patch) = patch else {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "patch body must be a JSON object",
        ));
    };
    let existing = load_record(ctx, collection, id).await?;
    if collection == "users" {
        let current: User = decode_body(collection, existing.body.clone())?;
        guard_user_write(caller, Some(&current), &patch)?;
        hash_password_field(&mut patch)?;
    }
    let mut merged = match existing.body {
        Value::Object(fields) => fields,
        _ => Map::new(),
    };
    for (key, value) in &patch {
        if key != "id" {
            merged.insert(key.clone(), value.clone());
        }
    }
    validate_shape(collection, &Value::Object(merged))?;

    let record = ctx
        .storage
        .merge_record(collection, id, patch)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(collection, id))?;
    info!(collection, id, "record updated");
    Ok(public_body(record))
}

/// Hard delete. Nothing referencing the record is checked or cascaded.
pub async fn delete_record(
    ctx: &ApiContext,
    caller: Caller<'_>,
    collection: &str,
    id: i64,
) -> Result<(), ApiError> {
    ensure_collection(collection)?;
    if collection == "users" && !caller.is_admin() {
        return Err(forbidden("only admins may delete users"));
    }
    let removed = ctx
        .storage
        .delete_record(collection, id)
        .await
        .map_err(internal)?;
    if !removed {
        return Err(ApiError::not_found(collection, id));
    }
    info!(collection, id, "record deleted");
    Ok(())
}

pub(crate) async fn load_record(
    ctx: &ApiContext,
    collection: &str,
    id: i64,
) -> Result<StoredRecord, ApiError> {
    ctx.storage
        .load_record(collection, id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found(collection, id))
}

pub(crate) async fn load_typed<T: DeserializeOwned>(
    ctx: &ApiContext,
    collection: &str,
    id: i64,
) -> Result<T, ApiError> {
    let record = load_record(ctx, collection, id).await?;
    decode_body(collection, record.body)
}

pub(crate) fn decode_body<T: DeserializeOwned>(collection: &str, body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|err| {
        ApiError::new(
            ErrorCode::Internal,
            format!("stored {collection} record is malformed: {err}"),
        )
    })
}

fn ensure_collection(collection: &str) -> Result<(), ApiError> {
    if is_known_collection(collection) {
        Ok(())
    } else {
        Err(ApiError::new(
            ErrorCode::NotFound,
            format!("unknown collection '{collection}'"),
        ))
    }
}

fn validate_shape(collection: &str, body: &Value) -> Result<(), ApiError> {
    match collection {
        "proposals" => check::<Proposal>(body),
        "projects" => check::<Project>(body),
        "invoices" => check::<Invoice>(body),
        "clients" => check::<Client>(body),
        "users" => check::<User>(body),
        "tasks" => check::<Task>(body),
        "notifications" => check::<Notification>(body),
        "settings" => check::<Settings>(body),
        "user_invitations" => check::<UserInvitation>(body),
        _ => Ok(()),
    }
}

fn check<T: DeserializeOwned>(body: &Value) -> Result<(), ApiError> {
    T::deserialize(body)
        .map(|_| ())
        .map_err(|err| ApiError::new(ErrorCode::Validation, err.to_string()))
}

/// Password hashes are only ever written from a `password` field. Non-admins
/// may edit their own user record but never its role.
fn guard_user_write(
    caller: Caller<'_>,
    target: Option<&User>,
    fields: &Map<String, Value>,
) -> Result<(), ApiError> {
    if fields.contains_key(PASSWORD_HASH_FIELD) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "password_hash cannot be written; send password instead",
        ));
    }
    let Caller::Signed(claims) = caller else {
        return Ok(());
    };
    if caller.is_admin() {
        return Ok(());
    }
    let Some(target) = target.filter(|user| user.id == claims.user_id()) else {
        return Err(forbidden("only admins may create or edit other users"));
    };
    if let Some(role) = fields.get("role") {
        if serde_json::from_value::<Role>(role.clone()).ok() != Some(target.role) {
            return Err(forbidden("only admins may change a user's role"));
        }
    }
    Ok(())
}

fn forbidden(message: &str) -> ApiError {
    ApiError::new(ErrorCode::Forbidden, message)
}

fn hash_password_field(fields: &mut Map<String, Value>) -> Result<(), ApiError> {
    let Some(password) = fields.remove(PASSWORD_FIELD) else {
        return Ok(());
    };
    let password = password.as_str().ok_or_else(|| {
        ApiError::new(ErrorCode::Validation, "password must be a string")
    })?;
    auth::validate_password_strength(password)?;
    let hash = auth::hash_password(password)
        .map_err(|err| ApiError::new(ErrorCode::Internal, err.to_string()))?;
    fields.insert(PASSWORD_HASH_FIELD.into(), Value::String(hash));
    Ok(())
}

fn public_body(record: StoredRecord) -> Value {
    let mut body = record.body;
    if let Value::Object(fields) = &mut body {
        fields.remove(PASSWORD_HASH_FIELD);
    }
    body
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
