//! In-memory typed description of the user schema.
//!
//! Built once at startup (see [`loader`]), immutable afterwards and shared
//! across requests. The planner only reads it; traversal is by name, never
//! by structural reference, so cyclic entity graphs need no special casing.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::scalar::Scalar;

pub mod loader;

// ---------- properties ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub prop_type: PropType,
    pub nullable: bool,
    pub description: Option<String>,
}

impl Property {
    pub fn new(prop_type: PropType, nullable: bool) -> Property {
        Property { prop_type, nullable, description: None }
    }
}

/// The closed union of property kinds. Every dispatch over this type must be
/// exhaustive; an unexpected variant in a context that cannot handle it is a
/// programmer error, not a user error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropType {
    Scalar(Scalar),
    Enum(String),
    List(Box<Property>),
    /// Embedded JsonObject, stored inline as JSON on the owning entity.
    Object(String),
    Union(String),
    /// Single-valued reference, stored as `<prop>_id` on the owning table.
    Fk { entity: String },
    /// Inverse of an `fk`: all rows of `entity` whose `field` FK points here.
    ListRelation { entity: String, field: String },
}

impl PropType {
    /// True when a list of this item type is stored as a native SQL array
    /// column rather than JSON.
    pub fn list_stored_as_array(item: &Property) -> bool {
        match &item.prop_type {
            PropType::Scalar(s) => s.array_capable(),
            PropType::Enum(_) => true,
            _ => false,
        }
    }
}

// ---------- type definitions ----------

#[derive(Debug, Clone)]
pub struct Entity {
    pub properties: BTreeMap<String, Property>,
    /// Interfaces the entity implements; only flavors the API surface.
    pub implements: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct JsonObject {
    pub properties: BTreeMap<String, Property>,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub properties: BTreeMap<String, Property>,
}

#[derive(Debug)]
pub struct UnionType {
    /// Ordered JsonObject variant names.
    pub variants: Vec<String>,
    /// Merged variant properties plus the `isTypeOf` discriminator,
    /// computed on first use (the model is immutable and single-lived).
    merged: OnceLock<BTreeMap<String, Property>>,
}

impl UnionType {
    pub fn new(variants: Vec<String>) -> UnionType {
        UnionType { variants, merged: OnceLock::new() }
    }
}

#[derive(Debug, Clone)]
pub struct EnumType {
    pub values: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FtsSource {
    pub entity: String,
    pub fields: Vec<String>,
}

/// A named full-text search over one or more entity sources. The backing
/// `<query>_tsv` / `<query>_doc` columns are maintained by the database
/// schema; the planner only reads them.
#[derive(Debug, Clone)]
pub struct FtsQuery {
    pub sources: Vec<FtsSource>,
}

#[derive(Debug)]
pub enum TypeDef {
    Entity(Entity),
    Object(JsonObject),
    Interface(Interface),
    Union(UnionType),
    Enum(EnumType),
    Fts(FtsQuery),
}

// ---------- model ----------

#[derive(Debug, Default)]
pub struct Model {
    pub types: BTreeMap<String, TypeDef>,
}

impl Model {
    /// Look up an entity. Missing names are a broken model invariant.
    pub fn entity(&self, name: &str) -> &Entity {
        match self.types.get(name) {
            Some(TypeDef::Entity(e)) => e,
            _ => panic!("model has no entity named {name}"),
        }
    }

    pub fn object(&self, name: &str) -> &JsonObject {
        match self.types.get(name) {
            Some(TypeDef::Object(o)) => o,
            _ => panic!("model has no json object named {name}"),
        }
    }

    pub fn union(&self, name: &str) -> &UnionType {
        match self.types.get(name) {
            Some(TypeDef::Union(u)) => u,
            _ => panic!("model has no union named {name}"),
        }
    }

    pub fn enum_type(&self, name: &str) -> &EnumType {
        match self.types.get(name) {
            Some(TypeDef::Enum(e)) => e,
            _ => panic!("model has no enum named {name}"),
        }
    }

    pub fn fts_query(&self, name: &str) -> &FtsQuery {
        match self.types.get(name) {
            Some(TypeDef::Fts(q)) => q,
            _ => panic!("model has no fulltext query named {name}"),
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = (&String, &Entity)> {
        self.types.iter().filter_map(|(name, def)| match def {
            TypeDef::Entity(e) => Some((name, e)),
            _ => None,
        })
    }

    pub fn fts_queries(&self) -> impl Iterator<Item = (&String, &FtsQuery)> {
        self.types.iter().filter_map(|(name, def)| match def {
            TypeDef::Fts(q) => Some((name, q)),
            _ => None,
        })
    }

    /// The merged property set of a union's variants plus the synthetic
    /// non-null `isTypeOf: String` discriminator. Variants must agree on the
    /// type of any shared property name (validated at load time).
    pub fn union_props(&self, name: &str) -> &BTreeMap<String, Property> {
        let union = self.union(name);
        union.merged.get_or_init(|| {
            let mut merged: BTreeMap<String, Property> = BTreeMap::new();
            for variant in &union.variants {
                for (prop_name, prop) in &self.object(variant).properties {
                    merged.entry(prop_name.clone()).or_insert_with(|| prop.clone());
                }
            }
            merged.insert(
                "isTypeOf".to_string(),
                Property::new(PropType::Scalar(Scalar::String), false),
            );
            merged
        })
    }

    /// True when `type_name` satisfies a fragment condition `cond` for the
    /// purposes of selection flattening.
    pub fn type_condition_matches(&self, type_name: &str, cond: &str) -> bool {
        if type_name == cond {
            return true;
        }
        match self.types.get(type_name) {
            Some(TypeDef::Entity(e)) => e.implements.iter().any(|i| i == cond),
            Some(TypeDef::Object(_)) => match self.types.get(cond) {
                Some(TypeDef::Union(u)) => u.variants.iter().any(|v| v == type_name),
                _ => false,
            },
            _ => false,
        }
    }
}

// ---------- naming ----------

/// snake_case a camelCase / UpperCamelCase name the way the store lays out
/// tables and columns (`HistoricalBalance` -> `historical_balance`).
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Table backing an entity.
pub fn table_name(entity: &str) -> String {
    snake_case(entity)
}

/// Column backing a plain property.
pub fn column_name(prop: &str) -> String {
    snake_case(prop)
}

/// Column backing an `fk` property.
pub fn fk_column_name(prop: &str) -> String {
    format!("{}_id", snake_case(prop))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_variant_model() -> Model {
        let mut types = BTreeMap::new();
        let mut a = BTreeMap::new();
        a.insert("kind".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        a.insert("a".to_string(), Property::new(PropType::Scalar(Scalar::Int), true));
        let mut b = BTreeMap::new();
        b.insert("kind".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        b.insert("b".to_string(), Property::new(PropType::Scalar(Scalar::BigInt), true));
        types.insert("VariantA".to_string(), TypeDef::Object(JsonObject { properties: a }));
        types.insert("VariantB".to_string(), TypeDef::Object(JsonObject { properties: b }));
        types.insert(
            "Either".to_string(),
            TypeDef::Union(UnionType::new(vec!["VariantA".to_string(), "VariantB".to_string()])),
        );
        Model { types }
    }

    #[test]
    fn test_union_props_merges_and_adds_discriminator() {
        let model = two_variant_model();
        let props = model.union_props("Either");
        assert!(props.contains_key("kind"));
        assert!(props.contains_key("a"));
        assert!(props.contains_key("b"));
        let is_type_of = &props["isTypeOf"];
        assert_eq!(is_type_of.prop_type, PropType::Scalar(Scalar::String));
        assert!(!is_type_of.nullable);
    }

    #[test]
    fn test_union_props_is_memoized() {
        let model = two_variant_model();
        let first = model.union_props("Either") as *const _;
        let second = model.union_props("Either") as *const _;
        assert_eq!(first, second, "merged props should be computed once");
    }

    #[test]
    fn test_snake_case_naming() {
        assert_eq!(table_name("HistoricalBalance"), "historical_balance");
        assert_eq!(table_name("Account"), "account");
        assert_eq!(column_name("wallet"), "wallet");
        assert_eq!(column_name("createdAt"), "created_at");
        assert_eq!(fk_column_name("account"), "account_id");
        assert_eq!(fk_column_name("parentAccount"), "parent_account_id");
    }

    #[test]
    fn test_union_variant_matches_union_condition() {
        let model = two_variant_model();
        assert!(model.type_condition_matches("VariantA", "Either"));
        assert!(model.type_condition_matches("VariantA", "VariantA"));
        assert!(!model.type_condition_matches("VariantA", "VariantB"));
    }
}
