//! Request handlers

use crate::{ApiError, AppState};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use gremlin_core::{
    AssertionChecker, Checklist, DependencyGraph, FailureGenerator, GeneratorConfig, HeaderFilter,
    RecipeId, ScenarioSet, Topology,
};
use serde_json::{json, Map, Value};

pub(crate) async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": gremlin_core::VERSION }))
}

/// Install a recipe and answer its id
pub(crate) async fn create_recipe(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let mut payload = parse_object(&body)?;
    let topology = required(&mut payload, "topology", "Topology required")?;
    let scenarios = required(&mut payload, "scenarios", "Failure scenarios required")?;
    let header_name = required_str(&mut payload, "header", "Header required")?;
    let pattern = required_str(&mut payload, "header_pattern", "Header_pattern required")?;

    let graph = DependencyGraph::from_topology(&Topology::from_value(topology)?)?;
    let scenarios = scenario_set(scenarios)?;
    let config = GeneratorConfig {
        header: Some(HeaderFilter::new(header_name, pattern)),
        ..GeneratorConfig::default()
    };

    let control = state.control();
    let recipe_id = tokio::task::spawn_blocking(move || {
        let mut generator = FailureGenerator::new(graph, control, config);
        generator.setup_failures(&scenarios.gremlins)?;
        Ok::<_, ApiError>(generator.recipe_id())
    })
    .await??;

    tracing::info!(recipe = %recipe_id, "recipe installed");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/api/v1/recipes/{recipe_id}"))],
        Json(json!({ "recipe_id": recipe_id.to_string() })),
    ))
}

/// Evaluate a checklist against the traces of one recipe
pub(crate) async fn check_recipe(
    State(state): State<AppState>,
    Path(recipe_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let recipe_id = parse_recipe_id(&recipe_id)?;
    let mut payload = parse_object(&body)?;
    let checklist = Checklist::from_value(required(&mut payload, "checklist", "Checklist required")?)?;

    let results = tokio::task::spawn_blocking(move || {
        let store = state.log_store(checklist.log_server.as_deref())?;
        let checker = AssertionChecker::builder(store).recipe(recipe_id).build()?;
        Ok::<_, ApiError>(checker.check_assertions(&checklist, true)?)
    })
    .await??;

    let passed = results.iter().filter(|r| r.success).count();
    tracing::info!(recipe = %recipe_id, passed, total = results.len(), "recipe checked");
    Ok(Json(json!({ "results": results })))
}

/// Remove every rule tagged with the recipe id
pub(crate) async fn delete_recipe(
    State(state): State<AppState>,
    Path(recipe_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let recipe_id = parse_recipe_id(&recipe_id)?;
    let control = state.control();
    tokio::task::spawn_blocking(move || control.delete_rules_by_tag(&recipe_id.to_string())).await??;
    tracing::info!(recipe = %recipe_id, "recipe rules deleted");
    Ok(StatusCode::OK)
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, ApiError> {
    match serde_json::from_slice(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::BadRequest("request body must be a JSON object".to_string())),
        Err(e) => Err(ApiError::BadRequest(format!("invalid JSON body: {e}"))),
    }
}

fn parse_recipe_id(raw: &str) -> Result<RecipeId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid recipe id '{raw}'")))
}

/// Take a field, treating null and empty values as absent
fn required(payload: &mut Map<String, Value>, key: &str, message: &str) -> Result<Value, ApiError> {
    match payload.remove(key) {
        None | Some(Value::Null | Value::Bool(false)) => Err(ApiError::BadRequest(message.to_string())),
        Some(Value::String(s)) if s.is_empty() => Err(ApiError::BadRequest(message.to_string())),
        Some(Value::Array(a)) if a.is_empty() => Err(ApiError::BadRequest(message.to_string())),
        Some(Value::Object(o)) if o.is_empty() => Err(ApiError::BadRequest(message.to_string())),
        Some(value) => Ok(value),
    }
}

fn required_str(payload: &mut Map<String, Value>, key: &str, message: &str) -> Result<String, ApiError> {
    match required(payload, key, message)? {
        Value::String(s) => Ok(s),
        _ => Err(ApiError::BadRequest(format!("'{key}' must be a string"))),
    }
}

/// Scenarios arrive either as a bare list or as a `{"gremlins": [...]}` document
fn scenario_set(value: Value) -> Result<ScenarioSet, ApiError> {
    let doc = match value {
        Value::Array(entries) => json!({ "gremlins": entries }),
        other => other,
    };
    Ok(ScenarioSet::from_value(doc)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_treats_empty_as_missing() {
        let mut payload = json!({"a": "", "b": [], "c": {}, "d": null, "e": [1]})
            .as_object()
            .cloned()
            .unwrap();
        for key in ["a", "b", "c", "d", "missing"] {
            let err = required(&mut payload, key, "gone").unwrap_err();
            assert_eq!(err.to_string(), "gone");
        }
        assert_eq!(required(&mut payload, "e", "gone").unwrap(), json!([1]));
    }

    #[test]
    fn test_scenario_set_accepts_list_or_document() {
        let entry = json!({"scenario": "crash_service", "dest": "reviews"});
        let from_list = scenario_set(json!([entry.clone()])).unwrap();
        let from_doc = scenario_set(json!({"gremlins": [entry]})).unwrap();
        assert_eq!(from_list, from_doc);
        assert_eq!(from_list.len(), 1);
    }

    #[test]
    fn test_parse_recipe_id_rejects_garbage() {
        let id = RecipeId::new();
        assert_eq!(parse_recipe_id(&id.to_string()).unwrap(), id);
        assert!(matches!(parse_recipe_id("nope"), Err(ApiError::BadRequest(_))));
    }
}
