//! Endpoint-backed instance operations: lifecycle, queries and proxying.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};

use common::{register_service, MockServer, Recorded};
use tsuru_core::bind::BufferWriter;
use tsuru_core::config::CoreSettings;
use tsuru_core::service::{CallMeta, InstanceUpdate};
use tsuru_core::{Services, TsuruError};
use tsuru_types::ServiceInstance;

fn fake_service(r: &Recorded) -> (StatusCode, String) {
    match (r.method.clone(), r.path.as_str()) {
        (Method::POST, "/resources") if r.form_value("name").as_deref() == Some("taken") => {
            (StatusCode::CONFLICT, String::new())
        }
        (Method::GET, "/resources/my-mysql/status") => (StatusCode::NO_CONTENT, String::new()),
        (Method::GET, "/resources/slow-db/status") => (StatusCode::ACCEPTED, String::new()),
        (Method::GET, "/resources/my-mysql") => (
            StatusCode::OK,
            r#"[{"label":"Address","value":"127.0.0.1"},{"label":"Engine","value":"8.0"}]"#
                .to_string(),
        ),
        (Method::GET, "/resources/plans") => (
            StatusCode::OK,
            r#"[{"name":"small","description":"1 core"},{"name":"big","description":"8 cores"}]"#
                .to_string(),
        ),
        (Method::GET, "/resources/slow-db") => (StatusCode::NOT_FOUND, String::new()),
        (Method::PUT, "/resources/my-mysql") => (StatusCode::NOT_FOUND, String::new()),
        (Method::DELETE, "/resources/slow-db") => {
            (StatusCode::INTERNAL_SERVER_ERROR, "disk busy".to_string())
        }
        (Method::POST, "/resources/my-mysql/backups") => {
            (StatusCode::CREATED, format!("got {}", r.body))
        }
        _ => (StatusCode::OK, String::new()),
    }
}

async fn setup(settings: CoreSettings) -> (Services, MockServer) {
    let server = MockServer::start(Arc::new(fake_service)).await;
    let services = Services::in_memory(settings).unwrap();
    register_service(&services, "mysql", &server.url).await;
    for name in ["my-mysql", "slow-db"] {
        services
            .instances
            .create(
                ServiceInstance {
                    name: name.into(),
                    service_name: "mysql".into(),
                    team_owner: "tsuruteam".into(),
                    plan_name: "small".into(),
                    tags: vec![" db ".into(), "db".into(), "".into(), "prod".into()],
                    ..Default::default()
                },
                &CallMeta::default(),
            )
            .await
            .unwrap();
    }
    (services, server)
}

#[tokio::test]
async fn create_sends_the_instance_and_stores_it() {
    let (services, server) = setup(CoreSettings::default()).await;

    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.teams, vec!["tsuruteam"]);
    assert_eq!(instance.tags, vec!["db", "prod"]);

    let creates = server.matching(Method::POST, "/resources");
    let create = creates
        .iter()
        .find(|r| r.form_value("name").as_deref() == Some("my-mysql"))
        .unwrap();
    assert_eq!(create.form_value("team").as_deref(), Some("tsuruteam"));
    assert_eq!(create.form_value("plan").as_deref(), Some("small"));
    let tags: Vec<String> = create
        .form()
        .into_iter()
        .filter(|(k, _)| k == "tags")
        .map(|(_, v)| v)
        .collect();
    assert_eq!(tags, vec!["db", "prod"]);
    assert!(create.header("authorization").unwrap().starts_with("Basic "));
}

#[tokio::test]
async fn create_conflicts() {
    let (services, _server) = setup(CoreSettings::default()).await;
    let new = |name: &str| ServiceInstance {
        name: name.into(),
        service_name: "mysql".into(),
        team_owner: "tsuruteam".into(),
        ..Default::default()
    };

    let err = services
        .instances
        .create(new("taken"), &CallMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::InstanceAlreadyExistsInApi));
    assert!(services.instances.get("mysql", "taken").await.is_err());

    let err = services
        .instances
        .create(new("my-mysql"), &CallMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::InstanceNameAlreadyExists(_)));

    let err = services
        .instances
        .create(new("9lives"), &CallMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::InvalidInstanceName));

    let err = services
        .instances
        .create(
            ServiceInstance {
                team_owner: String::new(),
                ..new("ownerless")
            },
            &CallMeta::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::TeamMandatory));
}

#[tokio::test]
async fn status_info_and_plans() {
    let (services, _server) = setup(CoreSettings::default()).await;
    let meta = CallMeta::default();

    assert_eq!(
        services.instances.status("mysql", "my-mysql", &meta).await.unwrap(),
        "up"
    );
    assert_eq!(
        services.instances.status("mysql", "slow-db", &meta).await.unwrap(),
        "pending"
    );

    let info = services.instances.info("mysql", "my-mysql", &meta).await.unwrap();
    assert_eq!(info["Address"], "127.0.0.1");
    assert_eq!(info["Engine"], "8.0");
    assert!(services
        .instances
        .info("mysql", "slow-db", &meta)
        .await
        .unwrap()
        .is_empty());

    let plans = services.instances.plans("mysql", &meta).await.unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(plans[1].description, "8 cores");
}

#[tokio::test]
async fn event_and_request_ids_are_forwarded() {
    let settings = CoreSettings {
        request_id_header: Some("X-Request-ID".into()),
        ..Default::default()
    };
    let (services, server) = setup(settings).await;
    let meta = CallMeta {
        user: "admin@example.com".into(),
        event_id: Some(uuid::Uuid::nil()),
        request_id: Some("req-42".into()),
    };

    services.instances.status("mysql", "my-mysql", &meta).await.unwrap();

    let sent = server.matching(Method::GET, "/resources/my-mysql/status");
    let r = &sent[0];
    assert_eq!(r.header("x-request-id"), Some("req-42"));
    assert_eq!(r.header("x-tsuru-user"), Some("admin@example.com"));
    assert_eq!(
        r.header("x-tsuru-eventid"),
        Some("00000000000000000000000000000000")
    );
}

#[tokio::test]
async fn update_tolerates_services_without_the_route() {
    let (services, server) = setup(CoreSettings::default()).await;
    let updated = services
        .instances
        .update(
            "mysql",
            "my-mysql",
            InstanceUpdate {
                description: Some("primary".into()),
                team_owner: Some("dbteam".into()),
                tags: Some(vec!["a".into(), "a ".into()]),
                ..Default::default()
            },
            &CallMeta::default(),
        )
        .await
        .unwrap();
    assert_eq!(updated.description, "primary");
    assert_eq!(updated.team_owner, "dbteam");
    assert_eq!(updated.teams, vec!["tsuruteam", "dbteam"]);
    assert_eq!(updated.tags, vec!["a"]);
    assert_eq!(
        services.instances.get("mysql", "my-mysql").await.unwrap(),
        updated
    );
    let put = server.matching(Method::PUT, "/resources/my-mysql");
    assert_eq!(put[0].form_value("description").as_deref(), Some("primary"));
}

#[tokio::test]
async fn team_access() {
    let (services, _server) = setup(CoreSettings::default()).await;
    services.instances.grant("mysql", "my-mysql", "ops").await.unwrap();
    services.instances.grant("mysql", "my-mysql", "ops").await.unwrap();
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.teams, vec!["tsuruteam", "ops"]);

    services.instances.revoke("mysql", "my-mysql", "ops").await.unwrap();
    let err = services
        .instances
        .revoke("mysql", "my-mysql", "tsuruteam")
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::RevokeInstanceTeamOwnerAccess));
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.teams, vec!["tsuruteam"]);
}

#[tokio::test]
async fn renaming_a_team_moves_ownership_and_access() {
    let (services, _server) = setup(CoreSettings::default()).await;
    services.instances.grant("mysql", "slow-db", "ops").await.unwrap();

    let changed = services
        .instances
        .rename_team("tsuruteam", "dbas")
        .await
        .unwrap();
    assert_eq!(changed, 2);
    let instance = services.instances.get("mysql", "my-mysql").await.unwrap();
    assert_eq!(instance.team_owner, "dbas");
    assert_eq!(instance.teams, vec!["dbas"]);
    let instance = services.instances.get("mysql", "slow-db").await.unwrap();
    assert_eq!(instance.teams, vec!["ops", "dbas"]);

    assert_eq!(
        services.instances.rename_team("ops", "sre").await.unwrap(),
        1
    );
    assert!(matches!(
        services.instances.rename_team("dbas", " ").await,
        Err(TsuruError::TeamMandatory)
    ));
}

#[tokio::test]
async fn force_removal_ignores_service_errors() {
    let (services, _server) = setup(CoreSettings::default()).await;
    let writer = BufferWriter::new();
    let meta = CallMeta::default();

    let err = services
        .instances
        .destroy("mysql", "slow-db", false, &writer, &meta)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("disk busy"), "{err}");
    assert!(services.instances.get("mysql", "slow-db").await.is_ok());

    services
        .instances
        .destroy("mysql", "slow-db", true, &writer, &meta)
        .await
        .unwrap();
    assert!(services.instances.get("mysql", "slow-db").await.is_err());
    assert!(writer.lines()[0].contains("disk busy"));

    let err = services.service_store.delete("mysql").await.unwrap_err();
    assert!(matches!(err, TsuruError::ServiceHasInstances));
}

#[tokio::test]
async fn proxy_forwards_to_the_instance() {
    let (services, server) = setup(CoreSettings::default()).await;
    let request = Request::builder()
        .method("POST")
        .uri("/services/mysql/proxy/my-mysql?callback=x&keep=1")
        .header("X-Custom", "yes")
        .body(Body::from("payload"))
        .unwrap();

    let response = services
        .instances
        .proxy("mysql", "my-mysql", "//backups/", &CallMeta::default(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"got payload");

    let sent = server.matching(Method::POST, "/resources/my-mysql/backups");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].query.as_deref(), Some("keep=1"));
    assert_eq!(sent[0].header("x-custom"), Some("yes"));
    assert!(sent[0].header("authorization").is_some());
}

#[tokio::test]
async fn proxy_streams_chunked_request_bodies() {
    let (services, server) = setup(CoreSettings::default()).await;
    let chunks = futures::stream::iter(vec![
        Ok::<_, std::io::Error>("first,"),
        Ok("second,"),
        Ok("third"),
    ]);
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .body(Body::from_stream(chunks))
        .unwrap();

    let response = services
        .instances
        .proxy("mysql", "my-mysql", "backups", &CallMeta::default(), request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"got first,second,third");
    assert_eq!(
        server.matching(Method::POST, "/resources/my-mysql/backups")[0].body,
        "first,second,third"
    );
}

#[tokio::test]
async fn proxy_refuses_reserved_paths_and_traversal() {
    let (services, server) = setup(CoreSettings::default()).await;
    let post = || {
        Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap()
    };
    let meta = CallMeta::default();

    let err = services
        .instances
        .proxy("mysql", "my-mysql", "bind-app", &meta, post())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::InvalidInput(_)));
    assert_eq!(err.http_status(), 400);

    let err = services
        .instances
        .proxy("mysql", "my-mysql", "../other-db/bind", &meta, post())
        .await
        .unwrap_err();
    assert!(matches!(err, TsuruError::InvalidProxyPath));

    assert!(server
        .requests()
        .iter()
        .all(|r| !r.path.starts_with("/resources/my-mysql/")));
}
