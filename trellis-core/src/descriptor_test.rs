#[cfg(test)]
use crate::descriptor::{HttpVerb, OperationDescriptor, ParamType, PathTemplate, ResourceDescriptor};
#[cfg(test)]
use crate::error::Error;
#[cfg(test)]
use crate::operation::CompactionMode;
#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use std::collections::HashMap;

#[cfg(test)]
fn map_like() -> ResourceDescriptor {
    let mut d = ResourceDescriptor::new("map");
    d.push(
        OperationDescriptor::command(-67, "put")
            .verbs(&[HttpVerb::Put, HttpVerb::Post])
            .path("/put/{key}", ParamType::String)
            .arg("value", ParamType::Json)
            .query_param("ttl", ParamType::Integer)
            .compaction_if_positive("ttl", CompactionMode::Expiring, CompactionMode::Quorum),
    )
    .unwrap();
    d.push(
        OperationDescriptor::query(-69, "get")
            .path("/get/{key}", ParamType::String),
    )
    .unwrap();
    d.push(OperationDescriptor::query(-76, "size")).unwrap();
    d
}

#[test]
fn template_binds_named_segments() {
    let t = PathTemplate::parse("/put/{key}");
    assert_eq!(
        t.matches("/put/alpha"),
        Some(vec![("key".to_string(), "alpha".to_string())])
    );
    assert_eq!(t.matches("/put"), None);
    assert_eq!(t.matches("/get/alpha"), None);
    assert_eq!(t.matches("put/alpha/"), Some(vec![("key".to_string(), "alpha".to_string())]));
}

#[test]
fn route_and_extract_from_url_and_body() {
    let d = map_like();
    let (op, bound) = d.route(HttpVerb::Put, "/put/a").unwrap();
    assert_eq!(op.id, -67);

    let mut query = HashMap::new();
    query.insert("ttl".to_string(), "100".to_string());
    let args = op.extract(&bound, &query, &json!("1")).unwrap();
    assert_eq!(args, json!({"key": "a", "value": "1", "ttl": 100}));
    assert_eq!(op.compaction_for(&args), CompactionMode::Expiring);

    let args = op.extract(&bound, &HashMap::new(), &json!({"value": 7})).unwrap();
    assert_eq!(args, json!({"key": "a", "value": 7}));
    assert_eq!(op.compaction_for(&args), CompactionMode::Quorum);
}

#[test]
fn generic_form_takes_everything_from_body() {
    let d = map_like();
    let (op, bound) = d.route(HttpVerb::Post, "/put").unwrap();
    assert!(bound.is_empty());
    let args = op
        .extract(&bound, &HashMap::new(), &json!({"key": "k", "value": [1, 2], "ttl": "5"}))
        .unwrap();
    assert_eq!(args, json!({"key": "k", "value": [1, 2], "ttl": 5}));
}

#[test]
fn missing_required_parameter_is_bad_request() {
    let d = map_like();
    let (op, bound) = d.route(HttpVerb::Post, "/put").unwrap();
    let err = op.extract(&bound, &HashMap::new(), &json!({"value": 1})).unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)), "got {:?}", err);
}

#[test]
fn unknown_route_and_selector_are_unknown_operation() {
    let d = map_like();
    assert!(matches!(
        d.route(HttpVerb::Delete, "/put/a"),
        Err(Error::UnknownOperation(_))
    ));
    assert!(matches!(
        d.resolve(&json!("frobnicate")),
        Err(Error::UnknownOperation(_))
    ));
    assert_eq!(d.resolve(&json!(-76)).unwrap().name, "size");
    assert_eq!(d.resolve(&json!("get")).unwrap().id, -69);
}

#[test]
fn duplicate_operation_ids_are_rejected() {
    let mut d = map_like();
    assert!(d.push(OperationDescriptor::query(-76, "count")).is_err());
}

#[test]
fn named_routes_win_over_keyed_templates() {
    let mut d = ResourceDescriptor::new("map");
    d.push(OperationDescriptor::query(-69, "get").path("/{key}", ParamType::String))
        .unwrap();
    d.push(OperationDescriptor::query(-76, "size")).unwrap();

    let (op, bound) = d.route(HttpVerb::Get, "/size").unwrap();
    assert_eq!(op.id, -76);
    assert!(bound.is_empty());

    let (op, bound) = d.route(HttpVerb::Get, "/alpha").unwrap();
    assert_eq!(op.id, -69);
    assert_eq!(bound, vec![("key".to_string(), "alpha".to_string())]);
}
