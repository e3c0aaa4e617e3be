//! SQL assembly: identifier quoting, alias allocation, join/column
//! deduplication and positional parameter collection.
//!
//! Everything here is owned by a single planning pass, created at request
//! start and dropped once rows are shaped; nothing is shared across
//! requests.

use crate::model::Model;

pub mod cursor;
pub mod filter;
pub mod order;
pub mod select;

// ---------- identifiers ----------

/// Quote a SQL identifier: double-quoted, internal quotes doubled.
/// Every identifier derived from user-visible names goes through here.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

// ---------- bound parameters ----------

/// A positional statement parameter. User literals always travel as text
/// (the scalar casts re-type them inside the statement); only LIMIT/OFFSET
/// and other planner-generated numbers bind natively.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

#[derive(Debug, Default)]
pub struct ParamSink {
    params: Vec<SqlParam>,
}

impl ParamSink {
    /// Bind a text parameter and return its placeholder expression.
    /// The `::text` keeps the inferred parameter type textual so the scalar
    /// casts control the real conversion.
    pub fn text(&mut self, value: String) -> String {
        self.params.push(SqlParam::Text(value));
        format!("${}::text", self.params.len())
    }

    pub fn int(&mut self, value: i64) -> String {
        self.params.push(SqlParam::Int(value));
        format!("${}", self.params.len())
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

// ---------- aliases ----------

/// Allocates plan-unique table aliases: `name`, `name_1`, `name_2`, ...
#[derive(Debug, Default)]
pub struct AliasSet {
    counters: std::collections::HashMap<String, usize>,
}

impl AliasSet {
    pub fn alloc(&mut self, base: &str) -> String {
        let n = self.counters.entry(base.to_string()).or_insert(0);
        let alias = if *n == 0 { base.to_string() } else { format!("{base}_{n}") };
        *n += 1;
        alias
    }
}

// ---------- joins ----------

#[derive(Debug)]
struct Join {
    table: String,
    alias: String,
    on: String,
}

/// LEFT OUTER JOINs keyed by `(table, on-expression)`; identical joins are
/// emitted once and share an alias.
#[derive(Debug, Default)]
pub struct JoinSet {
    joins: Vec<Join>,
}

impl JoinSet {
    /// Register a join of `table` on `<alias>.id = on_expr`, returning the
    /// alias to reference it by.
    pub fn join(&mut self, aliases: &mut AliasSet, table: &str, on_expr: &str) -> String {
        if let Some(existing) = self.joins.iter().find(|j| j.table == table && j.on == on_expr) {
            return existing.alias.clone();
        }
        let alias = aliases.alloc(table);
        self.joins.push(Join {
            table: table.to_string(),
            alias: alias.clone(),
            on: on_expr.to_string(),
        });
        alias
    }

    /// Render the join clauses (leading space included; empty when none).
    pub fn render(&self) -> String {
        let mut out = String::new();
        for join in &self.joins {
            out.push_str(&format!(
                " LEFT OUTER JOIN {} {} ON {}.{} = {}",
                quote(&join.table),
                quote(&join.alias),
                quote(&join.alias),
                quote("id"),
                join.on
            ));
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }
}

// ---------- columns ----------

/// Deduplicated SELECT expressions; adding an expression twice returns the
/// original index, which is how an FK's `id` sub-selection merges with the
/// column the planner already emits for the FK target.
#[derive(Debug, Default)]
pub struct ColumnSet {
    exprs: Vec<String>,
}

impl ColumnSet {
    pub fn add(&mut self, expr: String) -> usize {
        if let Some(pos) = self.exprs.iter().position(|e| *e == expr) {
            return pos;
        }
        self.exprs.push(expr);
        self.exprs.len() - 1
    }

    pub fn render(&self) -> String {
        self.exprs.join(", ")
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

// ---------- builder context ----------

/// Mutable state shared by one planning pass: the immutable model plus the
/// plan-wide alias allocator and parameter vector. Join and column sets are
/// per-(sub)statement and live on the stack of the walk.
pub struct SqlBuilder<'m> {
    pub model: &'m Model,
    pub aliases: AliasSet,
    pub params: ParamSink,
}

impl<'m> SqlBuilder<'m> {
    pub fn new(model: &'m Model) -> SqlBuilder<'m> {
        SqlBuilder { model, aliases: AliasSet::default(), params: ParamSink::default() }
    }
}

/// A finished statement with its bound parameters.
#[derive(Debug)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_doubles_internal_quotes() {
        assert_eq!(quote("account"), "\"account\"");
        assert_eq!(quote("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_alias_allocation_is_unique() {
        let mut aliases = AliasSet::default();
        assert_eq!(aliases.alloc("account"), "account");
        assert_eq!(aliases.alloc("account"), "account_1");
        assert_eq!(aliases.alloc("account"), "account_2");
        assert_eq!(aliases.alloc("historical_balance"), "historical_balance");
    }

    #[test]
    fn test_join_set_dedupes_identical_joins() {
        let mut aliases = AliasSet::default();
        let mut joins = JoinSet::default();
        let a = joins.join(&mut aliases, "account", "\"hb\".\"account_id\"");
        let b = joins.join(&mut aliases, "account", "\"hb\".\"account_id\"");
        assert_eq!(a, b, "identical joins share an alias");
        let c = joins.join(&mut aliases, "account", "\"other\".\"account_id\"");
        assert_ne!(a, c, "different on-expressions join separately");
        assert_eq!(joins.render().matches("LEFT OUTER JOIN").count(), 2);
    }

    #[test]
    fn test_column_set_dedupes_expressions() {
        let mut cols = ColumnSet::default();
        let a = cols.add("\"account\".\"id\"".to_string());
        let b = cols.add("\"account\".\"wallet\"".to_string());
        let again = cols.add("\"account\".\"id\"".to_string());
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(cols.render(), "\"account\".\"id\", \"account\".\"wallet\"");
    }

    #[test]
    fn test_param_sink_numbers_placeholders() {
        let mut params = ParamSink::default();
        assert_eq!(params.text("a".to_string()), "$1::text");
        assert_eq!(params.int(5), "$2");
        assert_eq!(params.text("b".to_string()), "$3::text");
        assert_eq!(
            params.into_params(),
            vec![
                SqlParam::Text("a".to_string()),
                SqlParam::Int(5),
                SqlParam::Text("b".to_string())
            ]
        );
    }
}
