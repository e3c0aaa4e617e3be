//! GraphQL-over-HTTP transport.
//!
//! This is a thin stand-in for the external transport collaborator: it
//! parses the document, resolves variables and fragments into the planner's
//! [`Selection`](crate::fields::Selection) input, dispatches each top-level
//! field under one `SERIALIZABLE READ ONLY` transaction, and assembles the
//! response JSON. The planner answers whole selections; there is no
//! per-field resolver tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_graphql::parser::types::{
    DocumentOperations, ExecutableDocument, FragmentDefinition, OperationType,
    Selection as GqlSelection, SelectionSet,
};
use async_graphql::parser::{parse_query, Positioned};
use async_graphql_value::{ConstValue, Name, Value as GqlValue};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map as JsonMap, Value};
use tokio_postgres::IsolationLevel;
use tower_http::cors::{Any, CorsLayer};

use crate::db::{self, PgPool, TxDatabase};
use crate::error::{QueryError, UserError};
use crate::fields::{
    connection_fields, entity_fields, fts_fields, ListArgs, Selection, SelectionItem,
};
use crate::model::Model;
use crate::planner::{ConnectionArgs, FtsArgs, Planner};

/// Fragment nesting bound; past this the document is rejected.
const MAX_DEPTH: usize = 32;

// ---------- root field table ----------

#[derive(Debug, Clone)]
pub enum RootOp {
    List(String),
    Connection(String),
    Fts(String),
}

/// The OpenCRUD root surface: `<camelPlural(entity)>`,
/// `<camelPlural(entity)>Connection`, and one field per fulltext query.
pub fn root_fields(model: &Model) -> BTreeMap<String, RootOp> {
    let mut roots = BTreeMap::new();
    for (name, _) in model.entities() {
        let plural = camel_plural(name);
        roots.insert(format!("{plural}Connection"), RootOp::Connection(name.clone()));
        roots.insert(plural, RootOp::List(name.clone()));
    }
    for (name, _) in model.fts_queries() {
        roots.insert(name.clone(), RootOp::Fts(name.clone()));
    }
    roots
}

fn camel_plural(entity: &str) -> String {
    let mut chars = entity.chars();
    let lowered = match chars.next() {
        Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
        None => String::new(),
    };
    if let Some(stem) = lowered.strip_suffix('y') {
        format!("{stem}ies")
    } else if lowered.ends_with('s')
        || lowered.ends_with('x')
        || lowered.ends_with("ch")
        || lowered.ends_with("sh")
    {
        format!("{lowered}es")
    } else {
        format!("{lowered}s")
    }
}

// ---------- state & router ----------

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<Model>,
    pub pool: PgPool,
    pub roots: Arc<BTreeMap<String, RootOp>>,
}

impl AppState {
    pub fn new(model: Arc<Model>, pool: PgPool) -> AppState {
        let roots = Arc::new(root_fields(&model));
        AppState { model, pool, roots }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/graphql", post(graphql_handler))
        .route("/healthz", get(health_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<JsonMap<String, Value>>,
    #[serde(rename = "operationName")]
    #[serde(default)]
    pub operation_name: Option<String>,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match db::health_check(&state.pool).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn graphql_handler(
    State(state): State<AppState>,
    Json(request): Json<GraphqlRequest>,
) -> Json<Value> {
    match run_request(&state, &request).await {
        Ok(data) => Json(json!({ "data": data })),
        Err(QueryError::User(e)) => Json(json!({ "errors": [{ "message": e.to_string() }] })),
        Err(QueryError::Db(msg)) => {
            tracing::error!(error = %msg, "Request failed on the database");
            Json(json!({ "errors": [{ "message": "Internal database error" }] }))
        }
    }
}

async fn run_request(
    state: &AppState,
    request: &GraphqlRequest,
) -> Result<JsonMap<String, Value>, QueryError> {
    let document = parse_query(&request.query)
        .map_err(|e| UserError::BadRequest(format!("GraphQL parse error: {e}")))?;
    let operation = pick_operation(&document, request.operation_name.as_deref())?;
    if operation.ty != OperationType::Query {
        return Err(UserError::BadRequest(
            "only queries are supported by this read-only service".to_string(),
        )
        .into());
    }

    // Effective variables: provided ones plus declared defaults.
    let mut variables = request.variables.clone().unwrap_or_default();
    for def in &operation.variable_definitions {
        let name = def.node.name.node.as_str();
        if !variables.contains_key(name) {
            if let Some(default) = &def.node.default_value {
                let value = default
                    .node
                    .clone()
                    .into_json()
                    .map_err(|e| UserError::BadRequest(format!("bad default for ${name}: {e}")))?;
                variables.insert(name.to_string(), value);
            }
        }
    }

    let items =
        lower_selection_set(&document, &variables, &operation.selection_set.node, 0)?;

    // One pooled connection, one serializable read-only transaction per
    // request; released on every exit path when the guards drop.
    let mut conn = state.pool.get().await.map_err(|e| QueryError::Db(e.to_string()))?;
    let tx = conn
        .build_transaction()
        .isolation_level(IsolationLevel::Serializable)
        .read_only(true)
        .start()
        .await
        .map_err(|e| QueryError::Db(e.to_string()))?;
    let result = {
        let tx_db = TxDatabase::new(&tx);
        let planner = Planner { model: &state.model, db: &tx_db };
        execute_roots(state, &planner, &items).await
    };
    if result.is_ok() {
        tx.commit().await.map_err(|e| QueryError::Db(e.to_string()))?;
    }
    result
}

async fn execute_roots(
    state: &AppState,
    planner: &Planner<'_>,
    items: &[SelectionItem],
) -> Result<JsonMap<String, Value>, QueryError> {
    let mut selections = Vec::new();
    collect_root_fields(items, &mut selections);

    let mut data = JsonMap::new();
    for selection in selections {
        if selection.name == "__typename" {
            data.insert(selection.alias.clone(), Value::String("Query".to_string()));
            continue;
        }
        let op = state.roots.get(&selection.name).ok_or_else(|| {
            UserError::BadRequest(format!("unknown root field '{}'", selection.name))
        })?;
        let value = match op {
            RootOp::List(entity) => {
                let args = ListArgs::from_args(&selection.args)?;
                let mut fields = entity_fields(&state.model, entity, &selection.items)?;
                Value::Array(planner.select_many(entity, &args, &mut fields).await?)
            }
            RootOp::Connection(entity) => {
                let args = ConnectionArgs::from_args(&selection.args)?;
                let mut fields = connection_fields(&state.model, entity, &selection.items)?;
                planner.connection(entity, &args, &mut fields).await?
            }
            RootOp::Fts(query_name) => {
                let sources: Vec<String> = state
                    .model
                    .fts_query(query_name)
                    .sources
                    .iter()
                    .map(|s| s.entity.clone())
                    .collect();
                let args = FtsArgs::from_args(&selection.args, &sources)?;
                let mut fields = fts_fields(&state.model, &sources, &selection.items)?;
                Value::Array(planner.fulltext_search(query_name, &args, &mut fields).await?)
            }
        };
        data.insert(selection.alias.clone(), value);
    }
    Ok(data)
}

/// Root-level fragments apply unconditionally (their condition can only be
/// the query type).
fn collect_root_fields<'a>(items: &'a [SelectionItem], out: &mut Vec<&'a Selection>) {
    for item in items {
        match item {
            SelectionItem::Field(sel) => out.push(sel),
            SelectionItem::Fragment { items, .. } => collect_root_fields(items, out),
        }
    }
}

// ---------- document lowering ----------

fn pick_operation<'a>(
    document: &'a ExecutableDocument,
    name: Option<&str>,
) -> Result<&'a async_graphql::parser::types::OperationDefinition, QueryError> {
    match &document.operations {
        DocumentOperations::Single(op) => Ok(&op.node),
        DocumentOperations::Multiple(map) => match name {
            Some(name) => map
                .iter()
                .find(|(op_name, _)| op_name.as_str() == name)
                .map(|(_, op)| &op.node)
                .ok_or_else(|| UserError::BadRequest(format!("no operation named '{name}'")).into()),
            None if map.len() == 1 => {
                Ok(&map.values().next().expect("len checked").node)
            }
            None => Err(UserError::BadRequest(
                "operationName is required for multi-operation documents".to_string(),
            )
            .into()),
        },
    }
}

fn lower_selection_set(
    document: &ExecutableDocument,
    variables: &JsonMap<String, Value>,
    selection_set: &SelectionSet,
    depth: usize,
) -> Result<Vec<SelectionItem>, QueryError> {
    if depth > MAX_DEPTH {
        return Err(UserError::BadRequest("selection set is nested too deeply".to_string()).into());
    }
    let mut items = Vec::with_capacity(selection_set.items.len());
    for item in &selection_set.items {
        match &item.node {
            GqlSelection::Field(field) => {
                let field = &field.node;
                let alias = field
                    .alias
                    .as_ref()
                    .map(|a| a.node.to_string())
                    .unwrap_or_else(|| field.name.node.to_string());
                let mut args = JsonMap::new();
                for (arg_name, arg_value) in &field.arguments {
                    let value = resolve_value(&arg_value.node, variables)?;
                    args.insert(arg_name.node.to_string(), value);
                }
                items.push(SelectionItem::Field(Selection {
                    name: field.name.node.to_string(),
                    alias,
                    args,
                    items: lower_selection_set(
                        document,
                        variables,
                        &field.selection_set.node,
                        depth + 1,
                    )?,
                }));
            }
            GqlSelection::InlineFragment(fragment) => {
                let type_name = fragment
                    .node
                    .type_condition
                    .as_ref()
                    .map(|c| c.node.on.node.to_string());
                items.push(SelectionItem::Fragment {
                    type_name,
                    items: lower_selection_set(
                        document,
                        variables,
                        &fragment.node.selection_set.node,
                        depth + 1,
                    )?,
                });
            }
            GqlSelection::FragmentSpread(spread) => {
                let name = &spread.node.fragment_name.node;
                let fragment: &Positioned<FragmentDefinition> =
                    document.fragments.get(name).ok_or_else(|| {
                        UserError::BadRequest(format!("unknown fragment '{name}'"))
                    })?;
                items.push(SelectionItem::Fragment {
                    type_name: Some(fragment.node.type_condition.node.on.node.to_string()),
                    items: lower_selection_set(
                        document,
                        variables,
                        &fragment.node.selection_set.node,
                        depth + 1,
                    )?,
                });
            }
        }
    }
    Ok(items)
}

fn resolve_value(
    value: &GqlValue,
    variables: &JsonMap<String, Value>,
) -> Result<Value, QueryError> {
    let const_value = value
        .clone()
        .into_const_with(|name: Name| {
            variables
                .get(name.as_str())
                .cloned()
                .map(|v| {
                    ConstValue::from_json(v)
                        .map_err(|e| UserError::BadRequest(format!("bad variable ${name}: {e}")))
                })
                .unwrap_or_else(|| {
                    Err(UserError::BadRequest(format!("variable ${name} is not defined")))
                })
        })?;
    const_value
        .into_json()
        .map_err(|e| UserError::BadRequest(format!("bad argument value: {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_plural() {
        assert_eq!(camel_plural("Account"), "accounts");
        assert_eq!(camel_plural("HistoricalBalance"), "historicalBalances");
        assert_eq!(camel_plural("Category"), "categories");
        assert_eq!(camel_plural("Box"), "boxes");
        assert_eq!(camel_plural("Match"), "matches");
    }

    #[test]
    fn test_root_fields_cover_lists_connections_and_fts() {
        let model = crate::model::loader::load_str(
            r#"{
                "types": {
                    "Account": {
                        "kind": "entity",
                        "properties": { "wallet": { "type": { "scalar": "String" } } }
                    },
                    "walletSearch": {
                        "kind": "ftsQuery",
                        "sources": [{ "entity": "Account", "fields": ["wallet"] }]
                    }
                }
            }"#,
        )
        .unwrap();
        let roots = root_fields(&model);
        assert!(matches!(roots.get("accounts"), Some(RootOp::List(e)) if e == "Account"));
        assert!(
            matches!(roots.get("accountsConnection"), Some(RootOp::Connection(e)) if e == "Account")
        );
        assert!(matches!(roots.get("walletSearch"), Some(RootOp::Fts(_))));
    }

    #[test]
    fn test_lowering_resolves_fragments_and_variables() {
        let document = parse_query(
            r#"
            query q($min: Int = 10) {
                accounts(where: { balance_gte: $min }) { id ...walletField }
            }
            fragment walletField on Account { wallet }
            "#,
        )
        .unwrap();
        let operation = pick_operation(&document, None).unwrap();
        let mut variables = JsonMap::new();
        variables.insert("min".to_string(), json!(25));
        let items =
            lower_selection_set(&document, &variables, &operation.selection_set.node, 0).unwrap();
        assert_eq!(items.len(), 1);
        let accounts = match &items[0] {
            SelectionItem::Field(sel) => sel,
            other => panic!("expected field, got {other:?}"),
        };
        assert_eq!(accounts.args["where"], json!({ "balance_gte": 25 }));
        assert_eq!(accounts.items.len(), 2);
        assert!(matches!(
            &accounts.items[1],
            SelectionItem::Fragment { type_name: Some(t), .. } if t == "Account"
        ));
    }
}
