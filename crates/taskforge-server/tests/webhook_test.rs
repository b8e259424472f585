// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end webhook tests: request in, matched integration, task
//! seeded.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use taskforge_core::config::Config;
use taskforge_core::hub::Hub;
use taskforge_core::model::{
    BodyDataType, Integration, IntegrationAlias, IntegrationExtractValue, IntegrationMatcher,
    MatchMethod, MatcherType, TaskStatus, ValueSource, VariableType,
};
use taskforge_core::persistence::MemoryRepository;
use taskforge_core::pool::{PoolEvent, TaskPool};
use taskforge_core::runner::secrets::NoKeys;
use taskforge_core::state::MemoryTaskState;
use taskforge_core::test_support;
use taskforge_server::{router, AppState};

struct Fixture {
    store: Arc<MemoryRepository>,
    app: axum::Router,
    project_id: i64,
    /// Keeps the pool event channel open; the queue loop is not run.
    _events: tokio::sync::mpsc::UnboundedReceiver<PoolEvent>,
}

async fn setup() -> Fixture {
    let store = Arc::new(MemoryRepository::new());
    let project = store.create_project(test_support::test_project(0)).await;
    let template = store
        .create_template(test_support::shell_template(project.id))
        .await;

    let integration = store
        .create_integration(Integration {
            id: 0,
            project_id: project.id,
            name: "git push".to_string(),
            template_id: template.id,
            task_params: None,
            auth_secret_id: None,
            searchable: false,
        })
        .await;

    store
        .create_integration_matcher(IntegrationMatcher {
            id: 0,
            integration_id: integration.id,
            name: "push events only".to_string(),
            match_type: MatcherType::Header,
            method: MatchMethod::Equals,
            body_data_type: BodyDataType::Json,
            key: "X-Event".to_string(),
            value: "push".to_string(),
        })
        .await;

    store
        .create_integration_extract_value(IntegrationExtractValue {
            id: 0,
            integration_id: integration.id,
            name: "branch".to_string(),
            value_source: ValueSource::Body,
            body_data_type: BodyDataType::Json,
            key: "ref".to_string(),
            variable: "BRANCH_NAME".to_string(),
            variable_type: VariableType::Environment,
        })
        .await;

    store
        .create_integration_alias(IntegrationAlias {
            id: 0,
            project_id: project.id,
            integration_id: integration.id,
            alias: "a1b2c3d4e5f60718".to_string(),
        })
        .await;

    let (pool, rx) = TaskPool::new(
        store.clone(),
        Arc::new(Config::default()),
        Arc::new(MemoryTaskState::new()),
        Hub::start(None),
        Arc::new(NoKeys),
        "test-node".to_string(),
    );

    let state = AppState {
        repo: store.clone(),
        pool: Arc::new(pool),
        hub: Hub::start(None),
    };

    Fixture {
        store,
        app: router(state),
        project_id: project.id,
        _events: rx,
    }
}

fn push_request(alias: &str, event: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/integrations/{}", alias))
        .header("X-Event", event)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_matched_webhook_seeds_task() {
    let fx = setup().await;

    let response = fx
        .app
        .clone()
        .oneshot(push_request(
            "a1b2c3d4e5f60718",
            "push",
            r#"{"ref":"main","sha":"abc123"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let tasks = fx.store.all_tasks().await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].project_id, fx.project_id);
    assert_eq!(tasks[0].status, TaskStatus::Waiting);
    assert!(tasks[0].integration_id.is_some());

    let env: std::collections::BTreeMap<String, String> =
        serde_json::from_str(tasks[0].environment.as_deref().unwrap()).unwrap();
    assert_eq!(env["BRANCH_NAME"], "main");
}

#[tokio::test]
async fn test_unmatched_request_is_404_and_seeds_nothing() {
    let fx = setup().await;

    let response = fx
        .app
        .clone()
        .oneshot(push_request(
            "a1b2c3d4e5f60718",
            "pull_request",
            r#"{"ref":"main"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(fx.store.all_tasks().await.is_empty());
}

#[tokio::test]
async fn test_unknown_alias_is_404() {
    let fx = setup().await;

    let response = fx
        .app
        .clone()
        .oneshot(push_request("ffffffffffffffff", "push", "{}"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_second_delivery_seeds_second_task() {
    let fx = setup().await;

    for _ in 0..2 {
        let response = fx
            .app
            .clone()
            .oneshot(push_request(
                "a1b2c3d4e5f60718",
                "push",
                r#"{"ref":"main"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    assert_eq!(fx.store.all_tasks().await.len(), 2);
}
