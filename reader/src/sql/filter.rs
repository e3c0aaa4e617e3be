//! Where-input parsing and WHERE clause generation.

use serde_json::Value;

use crate::error::UserError;
use crate::model::{table_name, PropType};
use crate::scalar::Scalar;
use crate::sql::cursor::Cursor;
use crate::sql::{quote, JoinSet, SqlBuilder};

// ---------- key parsing ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereOp {
    Eq,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Some,
    Every,
    None,
}

impl WhereOp {
    pub fn name(self) -> &'static str {
        match self {
            WhereOp::Eq => "eq",
            WhereOp::NotEq => "not_eq",
            WhereOp::Gt => "gt",
            WhereOp::Gte => "gte",
            WhereOp::Lt => "lt",
            WhereOp::Lte => "lte",
            WhereOp::In => "in",
            WhereOp::NotIn => "not_in",
            WhereOp::Contains => "contains",
            WhereOp::NotContains => "not_contains",
            WhereOp::StartsWith => "startsWith",
            WhereOp::NotStartsWith => "not_startsWith",
            WhereOp::EndsWith => "endsWith",
            WhereOp::NotEndsWith => "not_endsWith",
            WhereOp::Some => "some",
            WhereOp::Every => "every",
            WhereOp::None => "none",
        }
    }
}

/// Suffixes sorted by descending length. Longest-first matching is load
/// bearing: a naive scan would classify `not_in` as `in` and
/// `not_startsWith` as `not`.
const SUFFIXES: &[(&str, WhereOp)] = &[
    ("not_startsWith", WhereOp::NotStartsWith),
    ("not_contains", WhereOp::NotContains),
    ("not_endsWith", WhereOp::NotEndsWith),
    ("startsWith", WhereOp::StartsWith),
    ("contains", WhereOp::Contains),
    ("endsWith", WhereOp::EndsWith),
    ("not_eq", WhereOp::NotEq),
    ("not_in", WhereOp::NotIn),
    ("every", WhereOp::Every),
    ("some", WhereOp::Some),
    ("none", WhereOp::None),
    ("gte", WhereOp::Gte),
    ("lte", WhereOp::Lte),
    ("not", WhereOp::NotEq),
    ("eq", WhereOp::Eq),
    ("gt", WhereOp::Gt),
    ("lt", WhereOp::Lt),
    ("in", WhereOp::In),
];

/// Split a where-input key into `(operator, field)`. A key without a known
/// suffix is an equality condition on the whole key.
pub fn parse_where_key(key: &str) -> (WhereOp, &str) {
    for (suffix, op) in SUFFIXES {
        if let Some(field) = key.strip_suffix(suffix) {
            if let Some(field) = field.strip_suffix('_') {
                if !field.is_empty() {
                    return (*op, field);
                }
            }
        }
    }
    (WhereOp::Eq, key)
}

/// True iff the input holds any condition besides empty AND/OR nesting.
pub fn has_conditions(where_: &Value) -> bool {
    let obj = match where_.as_object() {
        Some(o) => o,
        None => return false,
    };
    for (key, value) in obj {
        if key == "AND" || key == "OR" {
            if lenient_branches(value).any(|branch| has_conditions(branch)) {
                return true;
            }
        } else {
            return true;
        }
    }
    false
}

/// AND/OR accept both a single object and an array of objects.
fn lenient_branches(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Value::Array(items) => Box::new(items.iter()),
        other => Box::new(std::iter::once(other)),
    }
}

// ---------- clause generation ----------

impl SqlBuilder<'_> {
    /// Translate a where-input into a SQL boolean expression against
    /// `cursor`. Returns the empty string iff the input has no conditions.
    pub fn generate_where(
        &mut self,
        joins: &mut JoinSet,
        cursor: &Cursor,
        where_: &Value,
    ) -> Result<String, UserError> {
        let obj = match where_.as_object() {
            Some(o) => o,
            None => {
                return Err(UserError::BadRequest("where must be an object".to_string()))
            }
        };

        let mut conjuncts: Vec<String> = Vec::new();
        for (key, value) in obj {
            if key == "AND" || key == "OR" {
                continue;
            }
            let (op, field) = parse_where_key(key);
            let condition = match op {
                WhereOp::Some | WhereOp::Every | WhereOp::None => {
                    self.relation_condition(cursor, field, op, value)?
                }
                _ => self.prop_condition(joins, cursor, field, op, value)?,
            };
            if let Some(c) = condition {
                conjuncts.push(c);
            }
        }

        if let Some(and) = obj.get("AND") {
            for branch in lenient_branches(and) {
                let sub = self.generate_where(joins, cursor, branch)?;
                if !sub.is_empty() {
                    conjuncts.push(sub);
                }
            }
        }

        let mut alternatives: Vec<String> = Vec::new();
        if let Some(or) = obj.get("OR") {
            for branch in lenient_branches(or) {
                let sub = self.generate_where(joins, cursor, branch)?;
                if !sub.is_empty() {
                    alternatives.push(sub);
                }
            }
        }

        let base = conjuncts.join(" AND ");
        if alternatives.is_empty() {
            return Ok(base);
        }
        let mut parts = Vec::new();
        if !base.is_empty() {
            parts.push(format!("({base})"));
        }
        for alt in alternatives {
            parts.push(format!("({alt})"));
        }
        Ok(parts.join(" OR "))
    }

    fn prop_condition(
        &mut self,
        joins: &mut JoinSet,
        cursor: &Cursor,
        field: &str,
        op: WhereOp,
        value: &Value,
    ) -> Result<Option<String>, UserError> {
        let model = self.model;
        let prop = cursor.prop(model, field).ok_or_else(|| UserError::UnknownProperty {
            object: cursor.object_name().to_string(),
            property: field.to_string(),
        })?;
        match &prop.prop_type {
            PropType::Scalar(scalar) => {
                self.scalar_condition(cursor, field, *scalar, op, value).map(Some)
            }
            PropType::Enum(name) => {
                self.enum_condition(cursor, field, name.clone(), op, value).map(Some)
            }
            PropType::Object(_) | PropType::Union(_) => {
                if op != WhereOp::Eq {
                    return Err(UserError::UnsupportedOperator {
                        property: field.to_string(),
                        op: op.name(),
                    });
                }
                if !has_conditions(value) {
                    return Ok(None);
                }
                let child = cursor.child(model, &mut self.aliases, joins, field);
                let sub = self.generate_where(joins, &child, value)?;
                Ok(if sub.is_empty() { None } else { Some(sub) })
            }
            PropType::Fk { .. } => {
                if op != WhereOp::Eq {
                    return Err(UserError::UnsupportedOperator {
                        property: field.to_string(),
                        op: op.name(),
                    });
                }
                if !has_conditions(value) {
                    return Ok(None);
                }
                let child = cursor.child(model, &mut self.aliases, joins, field);
                let sub = self.generate_where(joins, &child, value)?;
                Ok(if sub.is_empty() { None } else { Some(sub) })
            }
            PropType::List(_) | PropType::ListRelation { .. } => {
                Err(UserError::UnsupportedOperator { property: field.to_string(), op: op.name() })
            }
        }
    }

    fn scalar_condition(
        &mut self,
        cursor: &Cursor,
        field: &str,
        scalar: Scalar,
        op: WhereOp,
        value: &Value,
    ) -> Result<String, UserError> {
        let lhs = cursor.native(self.model, field);
        let literal = |v: &Value| -> Result<String, UserError> {
            scalar.validate_literal(v).map_err(|detail| UserError::InvalidLiteral {
                scalar: scalar.name(),
                detail,
            })
        };
        match op {
            WhereOp::Eq | WhereOp::NotEq | WhereOp::Gt | WhereOp::Gte | WhereOp::Lt
            | WhereOp::Lte => {
                let placeholder = self.params.text(literal(value)?);
                let rhs = scalar.from_transport_cast(&placeholder);
                Ok(format!("{lhs} {} {rhs}", comparison_operator(op)))
            }
            WhereOp::In | WhereOp::NotIn => {
                let items = value.as_array().ok_or_else(|| UserError::BadRequest(format!(
                    "{}_{} expects a list",
                    field,
                    op.name()
                )))?;
                if items.is_empty() {
                    // IN over the empty list matches nothing.
                    return Ok(if op == WhereOp::In { "false".into() } else { "true".into() });
                }
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    let placeholder = self.params.text(literal(item)?);
                    rendered.push(scalar.from_transport_cast(&placeholder));
                }
                let keyword = if op == WhereOp::In { "IN" } else { "NOT IN" };
                Ok(format!("{lhs} {keyword} ({})", rendered.join(", ")))
            }
            WhereOp::Contains | WhereOp::NotContains => {
                let placeholder = self.params.text(literal(value)?);
                let relation = if op == WhereOp::Contains { "> 0" } else { "= 0" };
                Ok(format!("position({placeholder} in {lhs}) {relation}"))
            }
            WhereOp::StartsWith => {
                let placeholder = self.params.text(literal(value)?);
                Ok(format!("starts_with({lhs}, {placeholder})"))
            }
            WhereOp::NotStartsWith => {
                let placeholder = self.params.text(literal(value)?);
                Ok(format!("NOT starts_with({lhs}, {placeholder})"))
            }
            WhereOp::EndsWith | WhereOp::NotEndsWith => {
                let placeholder = self.params.text(literal(value)?);
                let cmp = if op == WhereOp::EndsWith { "=" } else { "<>" };
                Ok(format!("right({lhs}, length({placeholder})) {cmp} {placeholder}"))
            }
            WhereOp::Some | WhereOp::Every | WhereOp::None => {
                Err(UserError::NotAListRelation { property: field.to_string() })
            }
        }
    }

    fn enum_condition(
        &mut self,
        cursor: &Cursor,
        field: &str,
        enum_name: String,
        op: WhereOp,
        value: &Value,
    ) -> Result<String, UserError> {
        let lhs = cursor.native(self.model, field);
        let literal = |b: &mut Self, v: &Value| -> Result<String, UserError> {
            let s = v.as_str().ok_or_else(|| UserError::BadRequest(format!(
                "expected an enum value for '{field}'"
            )))?;
            if !b.model.enum_type(&enum_name).values.iter().any(|val| val == s) {
                return Err(UserError::UnknownEnumValue {
                    enum_name: enum_name.clone(),
                    value: s.to_string(),
                });
            }
            Ok(s.to_string())
        };
        match op {
            WhereOp::Eq | WhereOp::NotEq => {
                let text = literal(self, value)?;
                let placeholder = self.params.text(text);
                let cmp = comparison_operator(op);
                Ok(format!("{lhs} {cmp} {placeholder}"))
            }
            WhereOp::In | WhereOp::NotIn => {
                let items = value.as_array().ok_or_else(|| UserError::BadRequest(format!(
                    "{}_{} expects a list",
                    field,
                    op.name()
                )))?;
                if items.is_empty() {
                    return Ok(if op == WhereOp::In { "false".into() } else { "true".into() });
                }
                let mut rendered = Vec::with_capacity(items.len());
                for item in items {
                    let text = literal(self, item)?;
                    rendered.push(self.params.text(text));
                }
                let keyword = if op == WhereOp::In { "IN" } else { "NOT IN" };
                Ok(format!("{lhs} {keyword} ({})", rendered.join(", ")))
            }
            _ => Err(UserError::UnsupportedOperator {
                property: field.to_string(),
                op: op.name(),
            }),
        }
    }

    /// `some` / `every` / `none` over a list relation, rendered as
    /// correlated subqueries against the related entity's table.
    fn relation_condition(
        &mut self,
        cursor: &Cursor,
        field: &str,
        op: WhereOp,
        value: &Value,
    ) -> Result<Option<String>, UserError> {
        let model = self.model;
        let prop = cursor.prop(model, field).ok_or_else(|| UserError::UnknownProperty {
            object: cursor.object_name().to_string(),
            property: field.to_string(),
        })?;
        let (entity, fk_field) = match &prop.prop_type {
            PropType::ListRelation { entity, field } => (entity.clone(), field.clone()),
            _ => return Err(UserError::NotAListRelation { property: field.to_string() }),
        };
        let outer_id = cursor.native(model, "id");
        let table = quote(&table_name(&entity));

        let mut sub_joins = JoinSet::default();
        let sub_cursor = Cursor::root(&mut self.aliases, &entity);
        let correlation = format!("{} = {}", sub_cursor.fk(&fk_field), outer_id);
        let inner = self.generate_where(&mut sub_joins, &sub_cursor, value)?;
        let sub_alias = quote(sub_cursor.alias());
        let sub_from = format!("{table} {sub_alias}{}", sub_joins.render());
        let filtered = if inner.is_empty() {
            correlation
        } else {
            format!("{correlation} AND ({inner})")
        };

        match op {
            WhereOp::Some => {
                Ok(Some(format!("(SELECT true FROM {sub_from} WHERE {filtered} LIMIT 1)")))
            }
            WhereOp::None => {
                let wrapper = quote(&self.aliases.alloc("matched"));
                Ok(Some(format!(
                    "(SELECT count(*) FROM (SELECT true FROM {sub_from} WHERE {filtered} LIMIT 1) AS {wrapper}) = 0"
                )))
            }
            WhereOp::Every => {
                // `every` with no inner conditions holds trivially.
                if inner.is_empty() {
                    return Ok(None);
                }
                let all_cursor = Cursor::root(&mut self.aliases, &entity);
                let all_correlation = format!("{} = {}", all_cursor.fk(&fk_field), outer_id);
                let all_alias = quote(all_cursor.alias());
                Ok(Some(format!(
                    "(SELECT count(*) FROM {sub_from} WHERE {filtered}) = (SELECT count(*) FROM {table} {all_alias} WHERE {all_correlation})"
                )))
            }
            _ => unreachable!("relation_condition called with {op:?}"),
        }
    }
}

fn comparison_operator(op: WhereOp) -> &'static str {
    match op {
        WhereOp::Eq => "=",
        WhereOp::NotEq => "<>",
        WhereOp::Gt => ">",
        WhereOp::Gte => ">=",
        WhereOp::Lt => "<",
        WhereOp::Lte => "<=",
        other => unreachable!("{other:?} is not a comparison"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_suffix_parsing_matches_longest_first() {
        assert_eq!(parse_where_key("balance_gt"), (WhereOp::Gt, "balance"));
        assert_eq!(parse_where_key("id_in"), (WhereOp::In, "id"));
        assert_eq!(parse_where_key("id_not_in"), (WhereOp::NotIn, "id"));
        assert_eq!(parse_where_key("name_not_startsWith"), (WhereOp::NotStartsWith, "name"));
        assert_eq!(parse_where_key("name_startsWith"), (WhereOp::StartsWith, "name"));
        assert_eq!(parse_where_key("name_not_contains"), (WhereOp::NotContains, "name"));
        assert_eq!(parse_where_key("wallet_not"), (WhereOp::NotEq, "wallet"));
        assert_eq!(parse_where_key("history_some"), (WhereOp::Some, "history"));
        assert_eq!(parse_where_key("history_every"), (WhereOp::Every, "history"));
        assert_eq!(parse_where_key("history_none"), (WhereOp::None, "history"));
    }

    #[test]
    fn test_bare_field_defaults_to_eq() {
        assert_eq!(parse_where_key("wallet"), (WhereOp::Eq, "wallet"));
        // A key that IS a suffix is still a field name.
        assert_eq!(parse_where_key("some"), (WhereOp::Eq, "some"));
        assert_eq!(parse_where_key("in"), (WhereOp::Eq, "in"));
    }

    #[test]
    fn test_has_conditions_ignores_empty_nesting() {
        assert!(!has_conditions(&json!({})));
        assert!(!has_conditions(&json!({ "AND": [] })));
        assert!(!has_conditions(&json!({ "OR": [{}, { "AND": [] }] })));
        assert!(has_conditions(&json!({ "wallet_eq": "a" })));
        assert!(has_conditions(&json!({ "OR": [{ "wallet_eq": "a" }] })));
        assert!(has_conditions(&json!({ "AND": { "wallet_eq": "a" } })), "single-object AND");
    }
}
