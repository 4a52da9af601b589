//! Bind and unbind pipelines against a recording service endpoint.

mod common;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{register_service, services, MockServer, Recorded};
use tsuru_core::bind::{BufferWriter, InMemoryApp, TSURU_SERVICES_ENV};
use tsuru_core::service::{BindOpts, CallMeta};
use tsuru_core::{Services, TsuruError};
use tsuru_types::{ServiceInstance, Unit};

const CREDENTIALS: &str = r#"{"DATABASE_USER":"root","DATABASE_PASSWORD":"s3cr3t"}"#;

async fn setup(server: &MockServer) -> Services {
    let services = services();
    register_service(&services, "mysql", &server.url).await;
    services
        .instances
        .create(
            ServiceInstance {
                name: "my-mysql".into(),
                service_name: "mysql".into(),
                team_owner: "tsuruteam".into(),
                ..Default::default()
            },
            &CallMeta::default(),
        )
        .await
        .unwrap();
    services
}

fn myapp() -> Arc<InMemoryApp> {
    Arc::new(InMemoryApp::new(
        "myapp",
        "10.10.10.10",
        vec![Unit::new("myapp-0", "10.10.10.1")],
    ))
}

fn credentials_on_bind_app(r: &Recorded) -> (StatusCode, String) {
    if r.method == Method::POST && r.path == "/resources/my-mysql/bind-app" {
        (StatusCode::CREATED, CREDENTIALS.to_string())
    } else {
        (StatusCode::OK, String::new())
    }
}

#[tokio::test]
async fn bind_app_injects_envs_and_binds_units() {
    let server = MockServer::start(Arc::new(credentials_on_bind_app)).await;
    let services = setup(&server).await;
    let app = myapp();

    services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();

    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.apps, vec!["myapp"]);
    assert_eq!(instance.bound_units.len(), 1);
    assert_eq!(instance.bound_units[0].ip, "10.10.10.1");

    let env = app.env();
    assert_eq!(env["DATABASE_USER"].value, "root");
    assert_eq!(env["DATABASE_PASSWORD"].value, "s3cr3t");
    assert!(app
        .service_envs()
        .iter()
        .all(|e| e.instance_name == "my-mysql" && e.service_name == "mysql"));
    let envelope: serde_json::Value =
        serde_json::from_str(&env[TSURU_SERVICES_ENV].value).unwrap();
    assert_eq!(
        envelope,
        json!({"mysql": [{"instance_name": "my-mysql", "envs": {"DATABASE_USER": "root", "DATABASE_PASSWORD": "s3cr3t"}}]})
    );
    assert_eq!(app.restarts(), 1);

    let bind_app = server.matching(Method::POST, "/resources/my-mysql/bind-app");
    assert_eq!(bind_app.len(), 1);
    assert_eq!(bind_app[0].form_value("app-name").as_deref(), Some("myapp"));
    assert_eq!(bind_app[0].form_value("app-host").as_deref(), Some("10.10.10.10"));
    let units = server.matching(Method::POST, "/resources/my-mysql/bind");
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].form_value("unit-host").as_deref(), Some("10.10.10.1"));
}

#[tokio::test]
async fn bind_app_falls_back_to_the_legacy_route() {
    let server = MockServer::start(Arc::new(|r: &Recorded| {
        match (r.method.clone(), r.path.as_str()) {
            (Method::POST, "/resources/my-mysql/bind-app") => {
                (StatusCode::NOT_FOUND, String::new())
            }
            (Method::POST, "/resources/my-mysql/bind") => {
                (StatusCode::CREATED, r#"{"DATABASE_HOST":"db.local"}"#.to_string())
            }
            _ => (StatusCode::OK, String::new()),
        }
    }))
    .await;
    let services = setup(&server).await;
    let app = myapp();

    services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();

    let legacy: Vec<_> = server
        .matching(Method::POST, "/resources/my-mysql/bind")
        .into_iter()
        .filter(|r| r.form_value("unit-host").is_none())
        .collect();
    assert_eq!(legacy.len(), 1);
    assert_eq!(legacy[0].form_value("app-host").as_deref(), Some("10.10.10.10"));
    assert_eq!(app.env()["DATABASE_HOST"].value, "db.local");
}

#[tokio::test]
async fn instance_not_ready_rolls_the_bind_back() {
    let server = MockServer::start(Arc::new(|r: &Recorded| {
        if r.path == "/resources/my-mysql/bind-app" {
            (StatusCode::PRECONDITION_FAILED, String::new())
        } else {
            (StatusCode::OK, String::new())
        }
    }))
    .await;
    let services = setup(&server).await;
    let app = myapp();

    let err = services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::InstanceNotReady), "{err}");

    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert!(instance.apps.is_empty());
    assert!(instance.bound_units.is_empty());
    assert!(app.service_envs().is_empty());
    assert!(server
        .matching(Method::POST, "/resources/my-mysql/bind")
        .is_empty());
}

#[tokio::test]
async fn failing_unit_rolls_the_whole_bind_back() {
    let server = MockServer::start(Arc::new(|r: &Recorded| {
        match (r.method.clone(), r.path.as_str()) {
            (Method::POST, "/resources/my-mysql/bind-app") => {
                (StatusCode::CREATED, CREDENTIALS.to_string())
            }
            (Method::POST, "/resources/my-mysql/bind")
                if r.form_value("unit-host").as_deref() == Some("10.10.10.3") =>
            {
                (StatusCode::INTERNAL_SERVER_ERROR, "unit rejected".to_string())
            }
            _ => (StatusCode::OK, String::new()),
        }
    }))
    .await;
    let services = setup(&server).await;
    let app = Arc::new(InMemoryApp::new(
        "myapp",
        "10.10.10.10",
        vec![
            Unit::new("myapp-0", "10.10.10.1"),
            Unit::new("myapp-1", "10.10.10.2"),
            Unit::new("myapp-2", "10.10.10.3"),
        ],
    ));

    let err = services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unit rejected"), "{err}");

    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert!(instance.apps.is_empty());
    assert!(instance.bound_units.is_empty());
    assert!(app.service_envs().is_empty());
    assert!(!app.env().contains_key("DATABASE_USER"));
    assert_eq!(
        server
            .matching(Method::DELETE, "/resources/my-mysql/bind-app")
            .len(),
        1
    );
}

#[tokio::test]
async fn binding_twice_is_refused() {
    let server = MockServer::start(Arc::new(credentials_on_bind_app)).await;
    let services = setup(&server).await;
    let app = myapp();
    services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();
    let err = services
        .instances
        .bind_app("mysql", "my-mysql", app, BindOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::AppAlreadyBound));
    assert_eq!(
        server.matching(Method::POST, "/resources/my-mysql/bind-app").len(),
        1
    );
}

#[tokio::test]
async fn unbind_app_reverses_everything() {
    let server = MockServer::start(Arc::new(credentials_on_bind_app)).await;
    let services = setup(&server).await;
    let app = myapp();
    services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();

    services
        .instances
        .unbind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();

    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert!(instance.apps.is_empty());
    assert!(instance.bound_units.is_empty());
    assert!(app.service_envs().is_empty());
    assert_eq!(
        server.matching(Method::DELETE, "/resources/my-mysql/bind").len(),
        1
    );
    assert_eq!(
        server.matching(Method::DELETE, "/resources/my-mysql/bind-app").len(),
        1
    );

    let err = services
        .instances
        .unbind_app("mysql", "my-mysql", app, BindOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::AppNotBound));
}

#[tokio::test]
async fn forced_unbind_ignores_endpoint_failures() {
    let server = MockServer::start(Arc::new(|r: &Recorded| {
        match (r.method.clone(), r.path.as_str()) {
            (Method::DELETE, "/resources/my-mysql/bind-app") => {
                (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
            }
            (Method::POST, "/resources/my-mysql/bind-app") => {
                (StatusCode::CREATED, CREDENTIALS.to_string())
            }
            _ => (StatusCode::OK, String::new()),
        }
    }))
    .await;
    let services = setup(&server).await;
    let app = myapp();
    services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();

    let err = services
        .instances
        .unbind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("boom"), "{err}");
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.apps, vec!["myapp"]);
    assert_eq!(instance.bound_units.len(), 1);

    let writer = Arc::new(BufferWriter::new());
    let opts = BindOpts {
        force_remove: true,
        writer: writer.clone(),
        ..Default::default()
    };
    services
        .instances
        .unbind_app("mysql", "my-mysql", app.clone(), opts)
        .await
        .unwrap();
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert!(instance.apps.is_empty());
    assert!(app.service_envs().is_empty());
    assert!(writer.lines().iter().any(|l| l.contains("boom")));
}

#[tokio::test]
async fn concurrent_bind_unit_calls_the_endpoint_once() {
    let server = MockServer::ok().await;
    let services = setup(&server).await;
    let app = myapp();
    let unit = Unit::new("myapp-0", "10.10.10.1");

    let instances = services.instances.clone();
    let (a, b) = tokio::join!(
        instances.bind_unit("mysql", "my-mysql", app.as_ref(), &unit),
        instances.bind_unit("mysql", "my-mysql", app.as_ref(), &unit),
    );
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(TsuruError::UnitAlreadyBound))));
    assert_eq!(
        server.matching(Method::POST, "/resources/my-mysql/bind").len(),
        1
    );
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.bound_units.len(), 1);
}

#[tokio::test]
async fn failed_bind_unit_is_compensated() {
    let server = MockServer::start(Arc::new(|r: &Recorded| {
        if r.path == "/resources/my-mysql/bind" {
            (StatusCode::INTERNAL_SERVER_ERROR, "no capacity".to_string())
        } else {
            (StatusCode::OK, String::new())
        }
    }))
    .await;
    let services = setup(&server).await;
    let app = myapp();
    let unit = Unit::new("myapp-0", "10.10.10.1");

    let err = services
        .instances
        .bind_unit("mysql", "my-mysql", app.as_ref(), &unit)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no capacity"), "{err}");
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert!(instance.bound_units.is_empty());

    let err = services
        .instances
        .unbind_unit("mysql", "my-mysql", app.as_ref(), &unit)
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::UnitNotBound));
}

#[tokio::test]
async fn bound_instances_cannot_be_destroyed() {
    let server = MockServer::start(Arc::new(credentials_on_bind_app)).await;
    let services = setup(&server).await;
    let app = myapp();
    services
        .instances
        .bind_app("mysql", "my-mysql", app.clone(), BindOpts::default())
        .await
        .unwrap();

    let writer = BufferWriter::new();
    let err = services
        .instances
        .destroy("mysql", "my-mysql", false, &writer, &CallMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::ServiceInstanceBound));

    services
        .instances
        .unbind_app("mysql", "my-mysql", app, BindOpts::default())
        .await
        .unwrap();
    services
        .instances
        .destroy("mysql", "my-mysql", false, &writer, &CallMeta::default())
        .await
        .unwrap();
    assert_eq!(
        server.matching(Method::DELETE, "/resources/my-mysql").len(),
        1
    );
    assert!(matches!(
        services.instances.get("mysql", "my-mysql").await,
        Err(TsuruError::ServiceInstanceNotFound)
    ));
}
