use super::*;
use serde_json::json;

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("proto_crm_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn inserted_record_body_carries_assigned_id() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = storage
        .insert_record("clients", json!({ "id": 999, "name": "Acme", "email": "ops@acme.test" }))
        .await
        .expect("insert");
    assert!(record.id > 0);
    assert_eq!(record.body["id"], json!(record.id));

    let loaded = storage
        .load_record("clients", record.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.body["name"], "Acme");
    assert_eq!(loaded.body["id"], json!(record.id));
}

#[tokio::test]
async fn rejects_non_object_bodies() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let err = storage
        .insert_record("clients", json!(["not", "an", "object"]))
        .await
        .expect_err("array body");
    assert!(err.to_string().contains("JSON object"));
}

#[tokio::test]
async fn records_are_scoped_to_their_collection() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let project = storage
        .insert_record("projects", json!({ "name": "Site" }))
        .await
        .expect("project");
    storage
        .insert_record("clients", json!({ "name": "Acme" }))
        .await
        .expect("client");

    assert!(storage
        .load_record("clients", project.id)
        .await
        .expect("load")
        .is_none());
    assert_eq!(storage.list_records("projects").await.expect("list").len(), 1);
}

#[tokio::test]
async fn filters_on_string_number_and_null_fields() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .insert_record("invoices", json!({ "project_id": 7, "status": "draft" }))
        .await
        .expect("first");
    storage
        .insert_record("invoices", json!({ "project_id": 7, "status": "paid" }))
        .await
        .expect("second");
    storage
        .insert_record("invoices", json!({ "project_id": 8, "status": "draft", "note": null }))
        .await
        .expect("third");

    let by_project = storage
        .filter_records("invoices", &[("project_id".into(), "7".into())])
        .await
        .expect("filter");
    assert_eq!(by_project.len(), 2);

    let drafts_for_seven = storage
        .filter_records(
            "invoices",
            &[
                ("project_id".into(), "7".into()),
                ("status".into(), "draft".into()),
            ],
        )
        .await
        .expect("filter");
    assert_eq!(drafts_for_seven.len(), 1);

    let without_note = storage
        .filter_records("invoices", &[("note".into(), "null".into())])
        .await
        .expect("filter");
    assert_eq!(without_note.len(), 3);
}

#[tokio::test]
async fn merge_overwrites_top_level_keys_but_not_id() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = storage
        .insert_record(
            "projects",
            json!({ "name": "Site", "stage_completion": { "discovery": false } }),
        )
        .await
        .expect("insert");

    let mut patch = Map::new();
    patch.insert("id".into(), json!(12345));
    patch.insert("stage_completion".into(), json!({ "discovery": true }));
    let merged = storage
        .merge_record("projects", record.id, patch)
        .await
        .expect("merge")
        .expect("present");

    assert_eq!(merged.body["id"], json!(record.id));
    assert_eq!(merged.body["name"], "Site");
    assert_eq!(merged.body["stage_completion"]["discovery"], true);

    let missing = storage
        .merge_record("projects", record.id + 100, Map::new())
        .await
        .expect("merge");
    assert!(missing.is_none());
}

#[tokio::test]
async fn delete_reports_whether_a_row_was_removed() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let record = storage
        .insert_record("notifications", json!({ "title": "hi" }))
        .await
        .expect("insert");
    assert!(storage
        .delete_record("notifications", record.id)
        .await
        .expect("delete"));
    assert!(!storage
        .delete_record("notifications", record.id)
        .await
        .expect("delete again"));
}

#[tokio::test]
async fn outbox_keeps_provider_and_recipient() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let email = OutboundEmail {
        to: "client@example.test".into(),
        subject: "Invoice".into(),
        html_body: "<p>due</p>".into(),
        from_name: None,
    };
    storage.record_email("gmail", &email).await.expect("record");

    let outbox = storage.list_outbox().await.expect("outbox");
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].provider, "gmail");
    assert_eq!(outbox[0].recipient, "client@example.test");
}

#[tokio::test]
async fn saga_run_tracks_steps_failure_and_completion() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .create_saga_run("run-1", "accept_proposal", 42, &json!({}))
        .await
        .expect("create");
    storage
        .mark_saga_step("run-1", "mark_accepted", &json!({ "proposal_id": 42 }))
        .await
        .expect("step");
    storage
        .fail_saga_run("run-1", "create_project", "502 bad gateway")
        .await
        .expect("fail");

    let run = storage
        .load_saga_run("run-1")
        .await
        .expect("load")
        .expect("present");
    assert_eq!(run.status, SAGA_FAILED);
    assert_eq!(run.failed_step.as_deref(), Some("create_project"));
    assert_eq!(run.completed_steps, vec!["mark_accepted".to_string()]);
    assert_eq!(run.context["proposal_id"], 42);

    let incomplete = storage.list_incomplete_saga_runs().await.expect("list");
    assert_eq!(incomplete.len(), 1);

    storage
        .mark_saga_step("run-1", "create_project", &json!({ "project_id": 5 }))
        .await
        .expect("resume step");
    let resumed = storage
        .load_saga_run("run-1")
        .await
        .expect("load")
        .expect("present");
    assert_eq!(resumed.status, SAGA_RUNNING);
    assert!(resumed.failed_step.is_none());

    storage.complete_saga_run("run-1").await.expect("complete");
    assert!(storage
        .list_incomplete_saga_runs()
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn marking_unknown_saga_run_fails() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .mark_saga_step("missing", "step", &json!({}))
        .await
        .is_err());
    assert!(storage.complete_saga_run("missing").await.is_err());
}
