//! SELECT composition: the top-level list, the embedded list subquery, the
//! fulltext-search branch, and the two count statements.
//!
//! One statement per top-level request: nested list relations are embedded
//! as correlated `array(SELECT json_build_array(...))` subqueries, never
//! separate round trips.

use serde_json::Value;

use crate::error::UserError;
use crate::fields::{FieldSet, FtsFields, ListArgs};
use crate::model::{table_name, PropType};
use crate::sql::cursor::Cursor;
use crate::sql::filter::has_conditions;
use crate::sql::order::parse_order_by;
use crate::sql::{quote, ColumnSet, JoinSet, SqlBuilder};

/// How the SELECT under construction will be used.
pub enum SelectVariant {
    /// Top-level list: `SELECT <cols> ...`.
    Top,
    /// Embedded list subquery: `SELECT json_build_array(<cols>) ...`,
    /// correlated on the child's FK against the parent row.
    Sub { parent_id: String, fk_field: String },
    /// One branch of a fulltext UNION: entity-name / rank / highlight /
    /// item prefix columns plus the tsquery match predicate.
    Fts { query: String, text_placeholder: String, highlight: bool, item: bool },
}

impl SqlBuilder<'_> {
    /// Single entry point for all three select variants.
    pub fn build_select(
        &mut self,
        entity: &str,
        args: &ListArgs,
        fields: Option<&mut FieldSet>,
        variant: SelectVariant,
    ) -> Result<String, UserError> {
        let model = self.model;
        let mut joins = JoinSet::default();
        let mut cols = ColumnSet::default();
        let cursor = Cursor::root(&mut self.aliases, entity);

        let has_fields = fields.is_some();
        if let Some(fields) = fields {
            self.populate_columns(&mut joins, &mut cols, &cursor, fields)?;
        }

        let mut where_parts: Vec<String> = Vec::new();
        if let Some(where_) = &args.where_ {
            if has_conditions(where_) {
                let expr = self.generate_where(&mut joins, &cursor, where_)?;
                if !expr.is_empty() {
                    where_parts.push(expr);
                }
            }
        }
        match &variant {
            SelectVariant::Sub { parent_id, fk_field } => {
                where_parts.push(format!("{} = {}", cursor.fk(fk_field), parent_id));
            }
            SelectVariant::Fts { query, text_placeholder, .. } => {
                where_parts.push(format!(
                    "phraseto_tsquery('english', {text_placeholder}) @@ {}",
                    cursor.tsv(query)
                ));
            }
            SelectVariant::Top => {}
        }

        // ORDER BY may register further joins, so it runs before rendering.
        let order_terms = if args.order_by.is_empty() {
            Vec::new()
        } else {
            let leaves = parse_order_by(model, entity, &args.order_by)?;
            self.populate_order_by(&mut joins, &cursor, &leaves)
        };

        let head = match &variant {
            SelectVariant::Top => format!("SELECT {}", cols.render()),
            SelectVariant::Sub { .. } => format!("SELECT json_build_array({})", cols.render()),
            SelectVariant::Fts { query, text_placeholder, highlight, item } => {
                let tsquery = format!("phraseto_tsquery('english', {text_placeholder})");
                let mut head = format!(
                    "SELECT '{entity}'::text AS {}, ts_rank({}, {tsquery}) AS {}",
                    quote("isTypeOf"),
                    cursor.tsv(query),
                    quote("rank")
                );
                if *highlight {
                    head.push_str(&format!(
                        ", ts_headline('english', {}, {tsquery}) AS {}",
                        cursor.doc(query),
                        quote("highlight")
                    ));
                }
                if *item {
                    let item_expr = if has_fields && !cols.is_empty() {
                        format!("json_build_array({})", cols.render())
                    } else {
                        "'[]'::json".to_string()
                    };
                    head.push_str(&format!(", {item_expr} AS {}", quote("item")));
                }
                head
            }
        };

        let mut sql = format!(
            "{head} FROM {} {}{}",
            quote(&table_name(entity)),
            quote(cursor.alias()),
            joins.render()
        );
        if !where_parts.is_empty() {
            sql.push_str(&format!(" WHERE {}", join_predicates(where_parts)));
        }
        if !order_terms.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order_terms.join(", ")));
        }
        if let Some(limit) = args.limit {
            let placeholder = self.params.int(limit);
            sql.push_str(&format!(" LIMIT {placeholder}"));
        }
        if let Some(offset) = args.offset {
            if offset > 0 {
                let placeholder = self.params.int(offset);
                sql.push_str(&format!(" OFFSET {placeholder}"));
            }
        }
        Ok(sql)
    }

    /// `SELECT count(*)` over an entity with an optional where filter.
    pub fn build_select_count(
        &mut self,
        entity: &str,
        where_: Option<&Value>,
    ) -> Result<String, UserError> {
        let mut joins = JoinSet::default();
        let cursor = Cursor::root(&mut self.aliases, entity);
        let mut predicate = String::new();
        if let Some(where_) = where_ {
            if has_conditions(where_) {
                predicate = self.generate_where(&mut joins, &cursor, where_)?;
            }
        }
        let mut sql = format!(
            "SELECT count(*) FROM {} {}{}",
            quote(&table_name(entity)),
            quote(cursor.alias()),
            joins.render()
        );
        if !predicate.is_empty() {
            sql.push_str(&format!(" WHERE {predicate}"));
        }
        Ok(sql)
    }

    /// Count matching rows with the full list arguments (including
    /// limit/offset) applied.
    pub fn build_list_count(&mut self, entity: &str, args: &ListArgs) -> Result<String, UserError> {
        let paged = args.limit.is_some() || args.offset.map_or(false, |o| o > 0);
        if !paged {
            return self.build_select_count(entity, args.where_.as_ref());
        }
        let mut joins = JoinSet::default();
        let cursor = Cursor::root(&mut self.aliases, entity);
        let mut predicate = String::new();
        if let Some(where_) = &args.where_ {
            if has_conditions(where_) {
                predicate = self.generate_where(&mut joins, &cursor, where_)?;
            }
        }
        let mut inner = format!(
            "SELECT true FROM {} {}{}",
            quote(&table_name(entity)),
            quote(cursor.alias()),
            joins.render()
        );
        if !predicate.is_empty() {
            inner.push_str(&format!(" WHERE {predicate}"));
        }
        if let Some(limit) = args.limit {
            let placeholder = self.params.int(limit);
            inner.push_str(&format!(" LIMIT {placeholder}"));
        }
        if let Some(offset) = args.offset {
            if offset > 0 {
                let placeholder = self.params.int(offset);
                inner.push_str(&format!(" OFFSET {placeholder}"));
            }
        }
        let wrapper = quote(&self.aliases.alloc("page"));
        Ok(format!("SELECT count(*) FROM ({inner}) AS {wrapper}"))
    }

    /// The fulltext statement: one branch per source entity, UNION ALL,
    /// ranked descending, paged as a whole.
    pub fn build_fulltext(
        &mut self,
        query_name: &str,
        text: &str,
        limit: Option<i64>,
        offset: Option<i64>,
        wheres: &std::collections::BTreeMap<String, Value>,
        fields: &mut FtsFields,
    ) -> Result<String, UserError> {
        let model = self.model;
        let sources = model.fts_query(query_name).sources.clone();
        let text_placeholder = self.params.text(text.to_string());

        let mut branches = Vec::with_capacity(sources.len());
        for source in &sources {
            let args = ListArgs {
                where_: wheres.get(&source.entity).cloned(),
                ..ListArgs::default()
            };
            let branch = self.build_select(
                &source.entity,
                &args,
                fields.entity_fields.get_mut(&source.entity),
                SelectVariant::Fts {
                    query: query_name.to_string(),
                    text_placeholder: text_placeholder.clone(),
                    highlight: fields.highlight,
                    item: fields.item,
                },
            )?;
            branches.push(branch);
        }

        let wrapper = quote(&self.aliases.alloc("search"));
        let mut sql = format!(
            "SELECT * FROM ({}) AS {wrapper} ORDER BY {} DESC",
            branches.join(" UNION ALL "),
            quote("rank")
        );
        if let Some(limit) = limit {
            let placeholder = self.params.int(limit);
            sql.push_str(&format!(" LIMIT {placeholder}"));
        }
        if let Some(offset) = offset {
            if offset > 0 {
                let placeholder = self.params.int(offset);
                sql.push_str(&format!(" OFFSET {placeholder}"));
            }
        }
        Ok(sql)
    }

    /// Walk the requested-field tree, adding deduplicated column
    /// expressions and recording each request's result-row index.
    fn populate_columns(
        &mut self,
        joins: &mut JoinSet,
        cols: &mut ColumnSet,
        cursor: &Cursor,
        fields: &mut FieldSet,
    ) -> Result<(), UserError> {
        let model = self.model;
        for request in &mut fields.requests {
            let prop_type = request.prop_type.clone();
            match prop_type {
                PropType::Scalar(_) | PropType::Enum(_) | PropType::List(_) => {
                    request.index = cols.add(cursor.transport(model, &request.prop));
                }
                PropType::Object(_) => {
                    // Presence sentinel first, for null-object reconstruction.
                    request.index = cols.add(format!("({}) IS NULL", cursor.field(&request.prop)));
                    let child = cursor.child(model, &mut self.aliases, joins, &request.prop);
                    let children =
                        request.children.as_mut().expect("object request carries children");
                    self.populate_columns(joins, cols, &child, children)?;
                }
                PropType::Union(_) => {
                    let child = cursor.child(model, &mut self.aliases, joins, &request.prop);
                    request.index = cols.add(child.transport(model, "isTypeOf"));
                    let children =
                        request.children.as_mut().expect("union request carries children");
                    self.populate_columns(joins, cols, &child, children)?;
                }
                PropType::Fk { .. } => {
                    let child = cursor.child(model, &mut self.aliases, joins, &request.prop);
                    request.index = cols.add(child.transport(model, "id"));
                    let children =
                        request.children.as_mut().expect("fk request carries children");
                    self.populate_columns(joins, cols, &child, children)?;
                }
                PropType::ListRelation { entity, field } => {
                    let args = request.args.clone().unwrap_or_default();
                    let parent_id = cursor.native(model, "id");
                    let sub = self.build_select(
                        &entity,
                        &args,
                        request.children.as_mut(),
                        SelectVariant::Sub { parent_id, fk_field: field },
                    )?;
                    request.index = cols.add(format!("array({sub})"));
                }
            }
        }
        Ok(())
    }
}

fn join_predicates(parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().expect("non-empty")
    } else {
        parts.iter().map(|p| format!("({p})")).collect::<Vec<_>>().join(" AND ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{entity_fields, Selection, SelectionItem};
    use crate::model::loader::load_str;
    use crate::model::Model;
    use serde_json::json;

    fn model() -> Model {
        load_str(
            r#"{
                "types": {
                    "Account": {
                        "kind": "entity",
                        "properties": {
                            "wallet": { "type": { "scalar": "String" } },
                            "balance": { "type": { "scalar": "Int" } },
                            "history": {
                                "type": { "listRelation": { "entity": "HistoricalBalance", "field": "account" } }
                            }
                        }
                    },
                    "HistoricalBalance": {
                        "kind": "entity",
                        "properties": {
                            "account": { "type": { "fk": "Account" } },
                            "balance": { "type": { "scalar": "Int" } }
                        }
                    }
                }
            }"#,
        )
        .unwrap()
    }

    fn field(name: &str) -> SelectionItem {
        SelectionItem::Field(Selection {
            name: name.to_string(),
            alias: name.to_string(),
            ..Selection::default()
        })
    }

    fn nested(name: &str, items: Vec<SelectionItem>) -> SelectionItem {
        SelectionItem::Field(Selection {
            name: name.to_string(),
            alias: name.to_string(),
            items,
            ..Selection::default()
        })
    }

    #[test]
    fn test_top_level_list_is_one_statement_with_embedded_subquery() {
        let model = model();
        let mut fields = entity_fields(
            &model,
            "Account",
            &[
                field("id"),
                field("wallet"),
                field("balance"),
                nested("history", vec![field("balance")]),
            ],
        )
        .unwrap();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select("Account", &ListArgs::default(), Some(&mut fields), SelectVariant::Top)
            .unwrap();
        assert!(sql.starts_with("SELECT \"account\".\"id\", \"account\".\"wallet\""), "got: {sql}");
        assert!(sql.contains("array(SELECT json_build_array(\"historical_balance\".\"balance\")"), "got: {sql}");
        assert!(
            sql.contains("\"historical_balance\".\"account_id\" = \"account\".\"id\""),
            "correlation predicate, got: {sql}"
        );
        assert!(sql.contains("FROM \"account\" \"account\""), "got: {sql}");
        assert_eq!(sql.matches("FROM \"account\"").count(), 1, "single outer statement");
    }

    #[test]
    fn test_where_some_renders_truthy_subquery() {
        let model = model();
        let args = ListArgs {
            where_: Some(json!({ "history_some": { "balance_lt": 50 } })),
            ..ListArgs::default()
        };
        let mut fields = entity_fields(&model, "Account", &[field("id")]).unwrap();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select("Account", &args, Some(&mut fields), SelectVariant::Top)
            .unwrap();
        assert!(
            sql.contains("(SELECT true FROM \"historical_balance\" \"historical_balance\" WHERE \"historical_balance\".\"account_id\" = \"account\".\"id\" AND (\"historical_balance\".\"balance\" < ($1::text)::int) LIMIT 1)"),
            "got: {sql}"
        );
    }

    #[test]
    fn test_where_every_compares_counts() {
        let model = model();
        let args = ListArgs {
            where_: Some(json!({ "history_every": { "balance_gt": 20 } })),
            ..ListArgs::default()
        };
        let mut builder = SqlBuilder::new(&model);
        let sql = builder.build_select_count("Account", args.where_.as_ref()).unwrap();
        assert!(sql.contains(") = (SELECT count(*) FROM \"historical_balance\""), "got: {sql}");
    }

    #[test]
    fn test_where_none_wraps_limit_one_subquery() {
        let model = model();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select_count("Account", Some(&json!({ "history_none": { "balance_lt": 60 } })))
            .unwrap();
        assert!(sql.contains("LIMIT 1) AS \"matched\") = 0"), "got: {sql}");
    }

    #[test]
    fn test_empty_where_yields_no_where_clause() {
        let model = model();
        let args = ListArgs { where_: Some(json!({})), ..ListArgs::default() };
        let mut fields = entity_fields(&model, "Account", &[field("id")]).unwrap();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select("Account", &args, Some(&mut fields), SelectVariant::Top)
            .unwrap();
        assert!(!sql.contains("WHERE"), "where: {{}} must not emit WHERE, got: {sql}");
    }

    #[test]
    fn test_offset_zero_emits_no_offset() {
        let model = model();
        let args = ListArgs { offset: Some(0), limit: Some(10), ..ListArgs::default() };
        let mut fields = entity_fields(&model, "Account", &[field("id")]).unwrap();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select("Account", &args, Some(&mut fields), SelectVariant::Top)
            .unwrap();
        assert!(sql.contains("LIMIT $1"), "got: {sql}");
        assert!(!sql.contains("OFFSET"), "got: {sql}");
    }

    #[test]
    fn test_order_by_foreign_column_joins_once() {
        let model = model();
        let args = ListArgs {
            order_by: vec!["account_wallet_ASC".to_string(), "balance_DESC".to_string()],
            ..ListArgs::default()
        };
        let mut fields =
            entity_fields(&model, "HistoricalBalance", &[field("balance")]).unwrap();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select("HistoricalBalance", &args, Some(&mut fields), SelectVariant::Top)
            .unwrap();
        assert!(
            sql.contains("ORDER BY \"account\".\"wallet\" ASC, \"historical_balance\".\"balance\" DESC"),
            "got: {sql}"
        );
        assert_eq!(sql.matches("LEFT OUTER JOIN").count(), 1, "got: {sql}");
    }

    #[test]
    fn test_fk_id_selection_merges_with_head_column() {
        let model = model();
        let mut fields = entity_fields(
            &model,
            "HistoricalBalance",
            &[nested("account", vec![field("id"), field("wallet")])],
        )
        .unwrap();
        let mut builder = SqlBuilder::new(&model);
        let sql = builder
            .build_select(
                "HistoricalBalance",
                &ListArgs::default(),
                Some(&mut fields),
                SelectVariant::Top,
            )
            .unwrap();
        let head = sql.split(" FROM ").next().unwrap();
        assert_eq!(
            head.matches("\"account\".\"id\"").count(),
            1,
            "fk head column and id sub-selection share one column, got: {sql}"
        );
        let account_request = &fields.requests[0];
        let id_request = account_request
            .children
            .as_ref()
            .unwrap()
            .requests
            .iter()
            .find(|r| r.prop == "id")
            .unwrap();
        assert_eq!(account_request.index, id_request.index);
    }

    #[test]
    fn test_list_count_applies_paging() {
        let model = model();
        let args = ListArgs { limit: Some(6), offset: Some(3), ..ListArgs::default() };
        let mut builder = SqlBuilder::new(&model);
        let sql = builder.build_list_count("Account", &args).unwrap();
        assert!(sql.starts_with("SELECT count(*) FROM (SELECT true FROM \"account\""), "got: {sql}");
        assert!(sql.contains("LIMIT $1"), "got: {sql}");
        assert!(sql.contains("OFFSET $2"), "got: {sql}");
    }
}
