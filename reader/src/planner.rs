//! The planner's public contract: compile one validated selection plus its
//! arguments into one statement, execute it, and shape the rows back.
//!
//! A [`Planner`] is bound to exactly one request and one database handle
//! (a read-only transaction); it is never shared. The model it reads is
//! process-wide and immutable.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::db::Database;
use crate::error::{QueryError, UserError};
use crate::fields::{parse_page_arg, ConnectionFields, FieldSet, FtsFields, ListArgs};
use crate::model::Model;
use crate::shape::{shape_object, shape_rows};
use crate::sql::order::parse_order_by;
use crate::sql::select::SelectVariant;
use crate::sql::SqlBuilder;

/// Connections default to this page size when `first` is absent.
const DEFAULT_FIRST: i64 = 100;

pub struct Planner<'a> {
    pub model: &'a Model,
    pub db: &'a dyn Database,
}

impl Planner<'_> {
    /// Top-level list: one statement, rows shaped into response objects.
    pub async fn select_many(
        &self,
        entity: &str,
        args: &ListArgs,
        fields: &mut FieldSet,
    ) -> Result<Vec<Value>, QueryError> {
        let mut builder = SqlBuilder::new(self.model);
        let sql = builder.build_select(entity, args, Some(fields), SelectVariant::Top)?;
        let params = builder.params.into_params();
        let rows = self.db.query(&sql, &params).await.map_err(|e| QueryError::Db(e.to_string()))?;
        Ok(shape_rows(fields, &rows))
    }

    /// `count(*)` over an entity with an optional filter.
    pub async fn select_count(
        &self,
        entity: &str,
        where_: Option<&Value>,
    ) -> Result<i64, QueryError> {
        let mut builder = SqlBuilder::new(self.model);
        let sql = builder.build_select_count(entity, where_)?;
        let params = builder.params.into_params();
        self.count(&sql, &params).await
    }

    /// Count matching rows with the full list arguments applied.
    pub async fn list_count(&self, entity: &str, args: &ListArgs) -> Result<i64, QueryError> {
        let mut builder = SqlBuilder::new(self.model);
        let sql = builder.build_list_count(entity, args)?;
        let params = builder.params.into_params();
        self.count(&sql, &params).await
    }

    async fn count(&self, sql: &str, params: &[crate::sql::SqlParam]) -> Result<i64, QueryError> {
        let rows = self.db.query(sql, params).await.map_err(|e| QueryError::Db(e.to_string()))?;
        let cell = rows.first().and_then(|r| r.first()).and_then(|v| v.as_i64());
        cell.ok_or_else(|| QueryError::Db("count query returned no rows".to_string()))
    }

    // ---------- relay connections ----------

    /// Relay-style connection over an entity list.
    pub async fn connection(
        &self,
        entity: &str,
        args: &ConnectionArgs,
        fields: &mut ConnectionFields,
    ) -> Result<Value, QueryError> {
        if args.order_by.is_empty() {
            return Err(UserError::MissingOrderBy.into());
        }
        // Validate the sort paths up front; the node-less path never builds
        // the underlying select.
        parse_order_by(self.model, entity, &args.order_by)?;

        let offset_in = match &args.after {
            None => 0,
            Some(encoded) => {
                let cursor = decode_cursor(encoded)?;
                if cursor.order_by != args.order_by {
                    return Err(UserError::InvalidCursorValue.into());
                }
                cursor.offset
            }
        };
        let first = args.first.unwrap_or(DEFAULT_FIRST);
        let list_args = ListArgs {
            where_: args.where_.clone(),
            order_by: args.order_by.clone(),
            limit: Some(first + 1),
            offset: Some(offset_in),
        };

        // Fetch one row past the page to learn whether a next page exists;
        // when no node fields were requested, a count is enough.
        let (returned, nodes) = match &mut fields.edges_node {
            Some(node_fields) => {
                let rows = self.select_many(entity, &list_args, node_fields).await?;
                (rows.len() as i64, rows)
            }
            None => (self.list_count(entity, &list_args).await?, Vec::new()),
        };

        let has_next_page = returned > first;
        let shown = returned.min(first);
        let edge_cursor =
            |i: i64| encode_cursor(&PageCursor { order_by: args.order_by.clone(), offset: offset_in + i + 1 });

        let mut out = JsonMap::new();
        if fields.total_count {
            let total = if returned <= first {
                offset_in + returned
            } else {
                self.select_count(entity, args.where_.as_ref()).await?
            };
            out.insert("totalCount".to_string(), Value::from(total));
        }
        if fields.edges_node.is_some() || fields.edges_cursor {
            let mut edges = Vec::with_capacity(shown as usize);
            for i in 0..shown {
                let mut edge = JsonMap::new();
                if let Some(node) = nodes.get(i as usize) {
                    edge.insert("node".to_string(), node.clone());
                }
                if fields.edges_cursor {
                    edge.insert("cursor".to_string(), Value::String(edge_cursor(i)));
                }
                edges.push(Value::Object(edge));
            }
            out.insert("edges".to_string(), Value::Array(edges));
        }
        if fields.page_info {
            let mut page_info = JsonMap::new();
            page_info.insert("hasNextPage".to_string(), Value::Bool(has_next_page));
            page_info.insert(
                "hasPreviousPage".to_string(),
                Value::Bool(offset_in > 0 && returned > 0),
            );
            let (start, end) = if shown > 0 {
                (Value::String(edge_cursor(0)), Value::String(edge_cursor(shown - 1)))
            } else {
                (Value::Null, Value::Null)
            };
            page_info.insert("startCursor".to_string(), start);
            page_info.insert("endCursor".to_string(), end);
            out.insert("pageInfo".to_string(), Value::Object(page_info));
        }
        Ok(Value::Object(out))
    }

    // ---------- fulltext search ----------

    pub async fn fulltext_search(
        &self,
        query_name: &str,
        args: &FtsArgs,
        fields: &mut FtsFields,
    ) -> Result<Vec<Value>, QueryError> {
        let mut builder = SqlBuilder::new(self.model);
        let sql = builder.build_fulltext(
            query_name,
            &args.text,
            args.limit,
            args.offset,
            &args.wheres,
            fields,
        )?;
        let params = builder.params.into_params();
        let rows = self.db.query(&sql, &params).await.map_err(|e| QueryError::Db(e.to_string()))?;

        let highlight_index = 2;
        let item_index = if fields.highlight { 3 } else { 2 };
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let entity = row[0].as_str().unwrap_or_default().to_string();
            let mut shaped = JsonMap::new();
            if fields.rank {
                shaped.insert("rank".to_string(), row[1].clone());
            }
            if fields.highlight {
                shaped.insert("highlight".to_string(), row[highlight_index].clone());
            }
            if fields.item {
                let item = match (fields.entity_fields.get(&entity), row[item_index].as_array()) {
                    (Some(entity_fields), Some(cells)) => {
                        Value::Object(shape_object(entity_fields, cells, Some(&entity)))
                    }
                    _ => {
                        let mut bare = JsonMap::new();
                        bare.insert("isTypeOf".to_string(), Value::String(entity.clone()));
                        Value::Object(bare)
                    }
                };
                shaped.insert("item".to_string(), item);
            }
            out.push(Value::Object(shaped));
        }
        Ok(out)
    }
}

// ---------- argument surfaces ----------

#[derive(Debug, Clone, Default)]
pub struct ConnectionArgs {
    pub order_by: Vec<String>,
    pub first: Option<i64>,
    pub after: Option<String>,
    pub where_: Option<Value>,
}

impl ConnectionArgs {
    pub fn from_args(args: &JsonMap<String, Value>) -> Result<ConnectionArgs, UserError> {
        let list = ListArgs::from_args(args)?;
        let first = parse_page_arg(args, "first")?;
        let after = match args.get("after") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(UserError::InvalidCursorValue),
        };
        Ok(ConnectionArgs { order_by: list.order_by, first, after, where_: list.where_ })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FtsArgs {
    pub text: String,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Optional per-source-entity filters (`whereAccount: {...}`).
    pub wheres: BTreeMap<String, Value>,
}

impl FtsArgs {
    pub fn from_args(
        args: &JsonMap<String, Value>,
        source_entities: &[String],
    ) -> Result<FtsArgs, UserError> {
        let text = match args.get("text") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(UserError::BadRequest("text is required".to_string())),
        };
        let mut wheres = BTreeMap::new();
        for entity in source_entities {
            if let Some(w) = args.get(&format!("where{entity}")) {
                if !w.is_null() {
                    if !w.is_object() {
                        return Err(UserError::BadRequest(format!(
                            "where{entity} must be an object"
                        )));
                    }
                    wheres.insert(entity.clone(), w.clone());
                }
            }
        }
        Ok(FtsArgs {
            text,
            limit: parse_page_arg(args, "limit")?,
            offset: parse_page_arg(args, "offset")?,
            wheres,
        })
    }
}

// ---------- pagination cursor wire format ----------

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct PageCursor {
    #[serde(rename = "orderBy")]
    order_by: Vec<String>,
    offset: i64,
}

fn encode_cursor(cursor: &PageCursor) -> String {
    BASE64.encode(serde_json::to_vec(cursor).expect("cursor serializes"))
}

fn decode_cursor(encoded: &str) -> Result<PageCursor, UserError> {
    let bytes = BASE64.decode(encoded).map_err(|_| UserError::InvalidCursorValue)?;
    let cursor: PageCursor =
        serde_json::from_slice(&bytes).map_err(|_| UserError::InvalidCursorValue)?;
    if cursor.offset < 1 || cursor.order_by.is_empty() {
        return Err(UserError::InvalidCursorValue);
    }
    Ok(cursor)
}
