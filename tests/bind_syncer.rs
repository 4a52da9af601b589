//! Bind syncer reconciliation against a recording endpoint.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::http::Method;
use serde_json::json;

use common::{register_service, services, MockServer};
use tsuru_core::bind::{App, InMemoryApp};
use tsuru_core::event::{EventFilter, EventJournal, NewEventOpts};
use tsuru_core::service::sync::SYNC_EVENT_KIND;
use tsuru_core::service::{CallMeta, StaticAppLister};
use tsuru_core::storage::InstanceStorage;
use tsuru_core::Services;
use tsuru_types::{BoundUnit, Kind, Owner, ServiceInstance, Target, TargetType, Unit};

async fn instance(services: &Services, name: &str) {
    services
        .instances
        .create(
            ServiceInstance {
                name: name.into(),
                service_name: "mysql".into(),
                team_owner: "tsuruteam".into(),
                ..Default::default()
            },
            &CallMeta::default(),
        )
        .await
        .unwrap();
    services
        .store
        .add_app("mysql", name, "my-app")
        .await
        .unwrap();
}

fn unit_ids(instance: &ServiceInstance) -> Vec<String> {
    instance.bound_units.iter().map(|u| u.id.clone()).collect()
}

/// `my-app` runs `u0`; instance-a knows `u0` and a stale `wrong`, instance-b
/// knows nothing.
async fn drifted() -> (Services, Arc<InMemoryApp>, MockServer) {
    let server = MockServer::ok().await;
    let services = services();
    register_service(&services, "mysql", &server.url).await;
    instance(&services, "instance-a").await;
    instance(&services, "instance-b").await;

    let u0 = Unit::new("u0", "10.0.0.1");
    let wrong = Unit::new("wrong", "10.0.0.99");
    for unit in [&u0, &wrong] {
        services
            .store
            .add_unit("mysql", "instance-a", &BoundUnit::new("my-app", unit))
            .await
            .unwrap();
    }
    let app = Arc::new(InMemoryApp::new("my-app", "10.0.0.100", vec![u0]));
    (services, app, server)
}

#[tokio::test]
async fn tick_reconciles_units_and_records_an_event() {
    let (services, app, server) = drifted().await;
    let syncer = services.bind_syncer(Arc::new(StaticAppLister::new(vec![app.clone()])));

    syncer.tick().await.unwrap();

    let a = services.instances.get("mysql", "instance-a").await.unwrap();
    let b = services.instances.get("mysql", "instance-b").await.unwrap();
    assert_eq!(unit_ids(&a), vec!["u0"]);
    assert_eq!(unit_ids(&b), vec!["u0"]);

    let binds = server.matching(Method::POST, "/resources/instance-b/bind");
    assert_eq!(binds.len(), 1);
    assert_eq!(binds[0].form_value("unit-host").as_deref(), Some("10.0.0.1"));
    let unbinds = server.matching(Method::DELETE, "/resources/instance-a/bind");
    assert_eq!(unbinds.len(), 1);
    assert_eq!(unbinds[0].form_value("unit-host").as_deref(), Some("10.0.0.99"));

    let events = services
        .journal
        .list(&EventFilter {
            kind_name: Some(SYNC_EVENT_KIND.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(!event.running);
    assert!(event.error.is_empty());
    assert_eq!(event.target, Target::new(TargetType::App, "my-app"));
    assert_eq!(
        event.end_custom_data,
        json!({"binds": {"instance-b": ["u0"]}, "unbinds": {"instance-a": ["wrong"]}})
    );

    let stats = syncer.stats();
    assert_eq!((stats.ticks, stats.binds, stats.unbinds), (1, 1, 1));
    assert_eq!((stats.bind_errors, stats.unbind_errors), (0, 0));
}

#[tokio::test]
async fn nothing_to_do_leaves_no_event() {
    let (services, app, _server) = drifted().await;
    let syncer = services.bind_syncer(Arc::new(StaticAppLister::new(vec![app.clone()])));
    syncer.sync_app(app.as_ref()).await.unwrap();

    let second = syncer.sync_app(app.as_ref()).await.unwrap().unwrap();
    assert!(second.binds.is_empty() && second.unbinds.is_empty());

    let events = services
        .journal
        .list(&EventFilter {
            kind_name: Some(SYNC_EVENT_KIND.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn locked_apps_are_skipped() {
    let (services, app, server) = drifted().await;
    let syncer = services.bind_syncer(Arc::new(StaticAppLister::new(vec![app.clone()])));
    let deploy = services
        .journal
        .new_event(NewEventOpts::new(
            Target::new(TargetType::App, app.name()),
            Kind::permission("app.deploy"),
            Owner::internal(),
        ))
        .await
        .unwrap();

    assert!(syncer.sync_app(app.as_ref()).await.unwrap().is_none());
    assert!(server.requests().iter().all(|r| r.path == "/resources"));

    services
        .journal
        .done(deploy.unique_id, None, serde_json::Value::Null)
        .await
        .unwrap();
    let outcome = syncer.sync_app(app.as_ref()).await.unwrap().unwrap();
    let expected: BTreeMap<String, Vec<String>> =
        [("instance-b".to_string(), vec!["u0".to_string()])].into();
    assert_eq!(outcome.binds, expected);
}

#[tokio::test]
async fn endpoint_failures_are_recorded_on_the_event() {
    let server = MockServer::start(Arc::new(|r: &common::Recorded| {
        if r.path.ends_with("/bind") {
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "down".to_string())
        } else {
            (axum::http::StatusCode::OK, String::new())
        }
    }))
    .await;
    let services = services();
    register_service(&services, "mysql", &server.url).await;
    instance(&services, "instance-b").await;
    let app = Arc::new(InMemoryApp::new(
        "my-app",
        "10.0.0.100",
        vec![Unit::new("u0", "10.0.0.1")],
    ));
    let syncer = services.bind_syncer(Arc::new(StaticAppLister::new(vec![app.clone()])));

    let outcome = syncer.sync_app(app.as_ref()).await.unwrap().unwrap();
    assert!(outcome.binds.is_empty());
    assert_eq!(syncer.stats().bind_errors, 1);

    let b = services.instances.get("mysql", "instance-b").await.unwrap();
    assert!(b.bound_units.is_empty());
    let events = services
        .journal
        .list(&EventFilter {
            kind_name: Some(SYNC_EVENT_KIND.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].error.contains("down"), "{}", events[0].error);
}
