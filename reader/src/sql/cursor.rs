//! The positional walker used during SQL assembly.
//!
//! A [`Cursor`] bundles the object we are on (an entity, an embedded JSON
//! object, or a union's merged properties) with where that object lives in
//! SQL space: a table alias, a JSON-path prefix, or both. Descending into a
//! foreign key registers a LEFT OUTER JOIN and re-roots the cursor on the
//! joined table; descending into an embedded object grows the JSON prefix.

use std::collections::BTreeMap;

use crate::model::{column_name, fk_column_name, snake_case, table_name, Model, PropType, Property};
use crate::sql::{quote, AliasSet, JoinSet};

#[derive(Debug, Clone)]
enum CursorObject {
    Entity(String),
    Object(String),
    Union(String),
}

#[derive(Debug, Clone)]
pub struct Cursor {
    object: CursorObject,
    alias: String,
    /// JSON extraction expression for the current embedded object; `None`
    /// when the cursor sits directly on an entity row.
    prefix: Option<String>,
}

impl Cursor {
    /// Open a root cursor on an entity with a fresh alias.
    pub fn root(aliases: &mut AliasSet, entity: &str) -> Cursor {
        let alias = aliases.alloc(&table_name(entity));
        Cursor { object: CursorObject::Entity(entity.to_string()), alias, prefix: None }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The entity name when entity-rooted.
    pub fn entity(&self) -> Option<&str> {
        match &self.object {
            CursorObject::Entity(name) => Some(name),
            _ => None,
        }
    }

    /// Name of the type the cursor walks, for error messages.
    pub fn object_name(&self) -> &str {
        match &self.object {
            CursorObject::Entity(name)
            | CursorObject::Object(name)
            | CursorObject::Union(name) => name,
        }
    }

    /// Properties of the current object (merged set for unions).
    pub fn props<'m>(&self, model: &'m Model) -> &'m BTreeMap<String, Property> {
        match &self.object {
            CursorObject::Entity(name) => &model.entity(name).properties,
            CursorObject::Object(name) => &model.object(name).properties,
            CursorObject::Union(name) => model.union_props(name),
        }
    }

    pub fn prop<'m>(&self, model: &'m Model, name: &str) -> Option<&'m Property> {
        self.props(model).get(name)
    }

    fn column(&self, prop: &str) -> String {
        format!("{}.{}", quote(&self.alias), quote(&column_name(prop)))
    }

    fn expect_prop<'m>(&self, model: &'m Model, name: &str) -> &'m Property {
        self.prop(model, name)
            .unwrap_or_else(|| panic!("{} has no property {name}", self.object_name()))
    }

    /// SQL expression yielding the property as its native SQL type.
    /// Only valid for scalar and enum properties.
    pub fn native(&self, model: &Model, prop: &str) -> String {
        let property = self.expect_prop(model, prop);
        match (&property.prop_type, &self.prefix) {
            (PropType::Scalar(_) | PropType::Enum(_), None) => self.column(prop),
            (PropType::Scalar(s), Some(prefix)) => s.from_json_cast(prefix, prop),
            (PropType::Enum(_), Some(prefix)) => format!("{prefix}->>'{prop}'"),
            (other, _) => panic!("native() on non-scalar property {prop}: {other:?}"),
        }
    }

    /// SQL expression yielding the property in transport representation.
    /// Valid for scalar, enum and list properties.
    pub fn transport(&self, model: &Model, prop: &str) -> String {
        let property = self.expect_prop(model, prop);
        match (&property.prop_type, &self.prefix) {
            (PropType::Scalar(s), None) => s.to_transport_cast(&self.column(prop)),
            (PropType::Enum(_), None) => self.column(prop),
            (PropType::List(item), None) => {
                if PropType::list_stored_as_array(item) {
                    match &item.prop_type {
                        PropType::Scalar(s) => s.to_transport_array_cast(&self.column(prop)),
                        PropType::Enum(_) => self.column(prop),
                        _ => unreachable!("array-capable items are scalar or enum"),
                    }
                } else {
                    // JSON-stored lists are kept in transport form already.
                    self.column(prop)
                }
            }
            (PropType::Scalar(s), Some(prefix)) => s.from_json_to_transport_cast(prefix, prop),
            (PropType::Enum(_), Some(prefix)) => format!("{prefix}->>'{prop}'"),
            (PropType::List(_), Some(prefix)) => format!("{prefix}->'{prop}'"),
            (other, _) => panic!("transport() on structured property {prop}: {other:?}"),
        }
    }

    /// Raw column reference or JSON extraction, without casts. Used for the
    /// object presence sentinel and as the prefix of child cursors.
    pub fn field(&self, prop: &str) -> String {
        match &self.prefix {
            None => self.column(prop),
            Some(prefix) => format!("{prefix}->'{prop}'"),
        }
    }

    /// The referencing expression of an `fk` property: its column for
    /// entities, a JSON-extracted id for embedded objects.
    pub fn fk(&self, prop: &str) -> String {
        match &self.prefix {
            None => format!("{}.{}", quote(&self.alias), quote(&fk_column_name(prop))),
            Some(prefix) => format!("{prefix}->>'{prop}'"),
        }
    }

    /// The tsvector column of a fulltext query. Entity root only.
    pub fn tsv(&self, query: &str) -> String {
        assert!(self.prefix.is_none(), "tsv() outside an entity root");
        format!("{}.{}", quote(&self.alias), quote(&format!("{}_tsv", snake_case(query))))
    }

    /// The concatenated-document column of a fulltext query. Entity root only.
    pub fn doc(&self, query: &str) -> String {
        assert!(self.prefix.is_none(), "doc() outside an entity root");
        format!("{}.{}", quote(&self.alias), quote(&format!("{}_doc", snake_case(query))))
    }

    /// Descend into a property, producing joins as needed.
    pub fn child(
        &self,
        model: &Model,
        aliases: &mut AliasSet,
        joins: &mut JoinSet,
        prop: &str,
    ) -> Cursor {
        let property = self.expect_prop(model, prop);
        match &property.prop_type {
            PropType::Object(name) => Cursor {
                object: CursorObject::Object(name.clone()),
                alias: self.alias.clone(),
                prefix: Some(self.field(prop)),
            },
            PropType::Union(name) => Cursor {
                object: CursorObject::Union(name.clone()),
                alias: self.alias.clone(),
                prefix: Some(self.field(prop)),
            },
            PropType::Fk { entity } => {
                let alias = joins.join(aliases, &table_name(entity), &self.fk(prop));
                Cursor { object: CursorObject::Entity(entity.clone()), alias, prefix: None }
            }
            other => panic!("child() on non-composite property {prop}: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, JsonObject, TypeDef};
    use crate::scalar::Scalar;

    fn model() -> Model {
        let mut model = Model::default();
        let mut account = BTreeMap::new();
        account.insert("id".to_string(), Property::new(PropType::Scalar(Scalar::Id), false));
        account
            .insert("wallet".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        account.insert(
            "createdAt".to_string(),
            Property::new(PropType::Scalar(Scalar::DateTime), false),
        );
        account.insert(
            "profile".to_string(),
            Property::new(PropType::Object("Profile".to_string()), true),
        );
        let mut profile = BTreeMap::new();
        profile.insert("bio".to_string(), Property::new(PropType::Scalar(Scalar::String), true));
        profile.insert("age".to_string(), Property::new(PropType::Scalar(Scalar::Int), true));
        let mut hb = BTreeMap::new();
        hb.insert("id".to_string(), Property::new(PropType::Scalar(Scalar::Id), false));
        hb.insert(
            "account".to_string(),
            Property::new(PropType::Fk { entity: "Account".to_string() }, false),
        );
        model.types.insert(
            "Account".to_string(),
            TypeDef::Entity(Entity { properties: account, implements: vec![] }),
        );
        model
            .types
            .insert("Profile".to_string(), TypeDef::Object(JsonObject { properties: profile }));
        model.types.insert(
            "HistoricalBalance".to_string(),
            TypeDef::Entity(Entity { properties: hb, implements: vec![] }),
        );
        model
    }

    #[test]
    fn test_entity_column_references() {
        let model = model();
        let mut aliases = AliasSet::default();
        let cursor = Cursor::root(&mut aliases, "Account");
        assert_eq!(cursor.native(&model, "wallet"), "\"account\".\"wallet\"");
        assert_eq!(cursor.field("createdAt"), "\"account\".\"created_at\"");
        assert_eq!(
            cursor.transport(&model, "createdAt"),
            "to_char((\"account\".\"created_at\") at time zone 'UTC', 'YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"')"
        );
    }

    #[test]
    fn test_object_child_grows_json_prefix() {
        let model = model();
        let mut aliases = AliasSet::default();
        let mut joins = JoinSet::default();
        let root = Cursor::root(&mut aliases, "Account");
        let profile = root.child(&model, &mut aliases, &mut joins, "profile");
        assert_eq!(profile.native(&model, "age"), "(\"account\".\"profile\"->'age')::int");
        assert_eq!(profile.transport(&model, "bio"), "\"account\".\"profile\"->>'bio'");
        assert!(joins.is_empty(), "embedded objects never join");
    }

    #[test]
    fn test_fk_child_registers_one_join() {
        let model = model();
        let mut aliases = AliasSet::default();
        let mut joins = JoinSet::default();
        let root = Cursor::root(&mut aliases, "HistoricalBalance");
        let account = root.child(&model, &mut aliases, &mut joins, "account");
        let again = root.child(&model, &mut aliases, &mut joins, "account");
        assert_eq!(account.alias(), again.alias(), "same fk joins once");
        assert_eq!(account.native(&model, "wallet"), "\"account\".\"wallet\"");
        assert!(joins
            .render()
            .contains("LEFT OUTER JOIN \"account\" \"account\" ON \"account\".\"id\" = \"historical_balance\".\"account_id\""));
    }

    #[test]
    fn test_fts_columns_snake_case_the_query_name() {
        let mut aliases = AliasSet::default();
        let cursor = Cursor::root(&mut aliases, "Account");
        assert_eq!(cursor.tsv("walletSearch"), "\"account\".\"wallet_search_tsv\"");
        assert_eq!(cursor.doc("walletSearch"), "\"account\".\"wallet_search_doc\"");
    }
}
