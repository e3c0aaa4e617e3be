//! Schema-file loading.
//!
//! The real schema pipeline (SDL parsing, API schema generation) lives
//! outside this service; what arrives here is the already-lowered type map
//! as JSON. The loader deserializes it, injects the implicit `id` primary
//! key, and refuses to start on the invariants it can check cheaply.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::model::{
    Entity, EnumType, FtsQuery, FtsSource, Interface, JsonObject, Model, PropType, Property,
    TypeDef, UnionType,
};
use crate::scalar::Scalar;

// ---------- errors ----------

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "Schema file error: {e}"),
            LoadError::Json(e) => write!(f, "Schema JSON error: {e}"),
            LoadError::Invalid(msg) => write!(f, "Invalid schema: {msg}"),
        }
    }
}

impl std::error::Error for LoadError {}

// ---------- wire format ----------

#[derive(Debug, Deserialize)]
struct SchemaFile {
    types: BTreeMap<String, TypeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum TypeSpec {
    Entity {
        properties: BTreeMap<String, PropertySpec>,
        #[serde(default)]
        implements: Vec<String>,
    },
    Object {
        properties: BTreeMap<String, PropertySpec>,
    },
    Interface {
        properties: BTreeMap<String, PropertySpec>,
    },
    Union {
        variants: Vec<String>,
    },
    Enum {
        values: Vec<String>,
    },
    FtsQuery {
        sources: Vec<FtsSourceSpec>,
    },
}

#[derive(Debug, Deserialize)]
struct PropertySpec {
    #[serde(rename = "type")]
    prop_type: PropTypeSpec,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum PropTypeSpec {
    Scalar(String),
    Enum(String),
    List(Box<PropertySpec>),
    Object(String),
    Union(String),
    Fk(String),
    ListRelation { entity: String, field: String },
}

#[derive(Debug, Deserialize)]
struct FtsSourceSpec {
    entity: String,
    fields: Vec<String>,
}

// ---------- loading ----------

pub fn load_file(path: &Path) -> Result<Model, LoadError> {
    let text = std::fs::read_to_string(path).map_err(LoadError::Io)?;
    load_str(&text)
}

pub fn load_str(text: &str) -> Result<Model, LoadError> {
    let file: SchemaFile = serde_json::from_str(text).map_err(LoadError::Json)?;
    let mut model = Model::default();
    for (name, spec) in file.types {
        let def = match spec {
            TypeSpec::Entity { properties, implements } => {
                let mut props = lower_properties(&name, properties)?;
                // Implicit primary key: every entity has `id: ID!`.
                props.entry("id".to_string()).or_insert_with(|| {
                    Property::new(PropType::Scalar(Scalar::Id), false)
                });
                TypeDef::Entity(Entity { properties: props, implements })
            }
            TypeSpec::Object { properties } => {
                TypeDef::Object(JsonObject { properties: lower_properties(&name, properties)? })
            }
            TypeSpec::Interface { properties } => {
                TypeDef::Interface(Interface { properties: lower_properties(&name, properties)? })
            }
            TypeSpec::Union { variants } => TypeDef::Union(UnionType::new(variants)),
            TypeSpec::Enum { values } => TypeDef::Enum(EnumType { values }),
            TypeSpec::FtsQuery { sources } => TypeDef::Fts(FtsQuery {
                sources: sources
                    .into_iter()
                    .map(|s| FtsSource { entity: s.entity, fields: s.fields })
                    .collect(),
            }),
        };
        model.types.insert(name, def);
    }
    validate(&model)?;
    Ok(model)
}

fn lower_properties(
    owner: &str,
    specs: BTreeMap<String, PropertySpec>,
) -> Result<BTreeMap<String, Property>, LoadError> {
    specs
        .into_iter()
        .map(|(name, spec)| {
            let prop = lower_property(owner, &name, spec)?;
            Ok((name, prop))
        })
        .collect()
}

fn lower_property(owner: &str, name: &str, spec: PropertySpec) -> Result<Property, LoadError> {
    let prop_type = match spec.prop_type {
        PropTypeSpec::Scalar(s) => PropType::Scalar(Scalar::from_name(&s).ok_or_else(|| {
            LoadError::Invalid(format!("{owner}.{name}: unknown scalar '{s}'"))
        })?),
        PropTypeSpec::Enum(e) => PropType::Enum(e),
        PropTypeSpec::List(item) => {
            PropType::List(Box::new(lower_property(owner, name, *item)?))
        }
        PropTypeSpec::Object(o) => PropType::Object(o),
        PropTypeSpec::Union(u) => PropType::Union(u),
        PropTypeSpec::Fk(entity) => PropType::Fk { entity },
        PropTypeSpec::ListRelation { entity, field } => {
            if spec.nullable {
                return Err(LoadError::Invalid(format!(
                    "{owner}.{name}: list relations are never nullable"
                )));
            }
            PropType::ListRelation { entity, field }
        }
    };
    Ok(Property { prop_type, nullable: spec.nullable, description: spec.description })
}

// ---------- validation ----------

fn validate(model: &Model) -> Result<(), LoadError> {
    for (name, def) in &model.types {
        match def {
            TypeDef::Entity(entity) => validate_properties(model, name, &entity.properties)?,
            TypeDef::Object(obj) => validate_properties(model, name, &obj.properties)?,
            TypeDef::Union(union) => validate_union(model, name, union)?,
            TypeDef::Fts(query) => validate_fts(model, name, query)?,
            TypeDef::Interface(_) | TypeDef::Enum(_) => {}
        }
    }
    Ok(())
}

fn validate_properties(
    model: &Model,
    owner: &str,
    props: &BTreeMap<String, Property>,
) -> Result<(), LoadError> {
    for (name, prop) in props {
        validate_prop_type(model, owner, name, &prop.prop_type)?;
    }
    Ok(())
}

fn validate_prop_type(
    model: &Model,
    owner: &str,
    name: &str,
    prop_type: &PropType,
) -> Result<(), LoadError> {
    let missing = |kind: &str, target: &str| {
        LoadError::Invalid(format!("{owner}.{name}: {kind} '{target}' is not defined"))
    };
    match prop_type {
        PropType::Scalar(_) => Ok(()),
        PropType::Enum(e) => match model.types.get(e) {
            Some(TypeDef::Enum(_)) => Ok(()),
            _ => Err(missing("enum", e)),
        },
        PropType::List(item) => validate_prop_type(model, owner, name, &item.prop_type),
        PropType::Object(o) => match model.types.get(o) {
            Some(TypeDef::Object(_)) => Ok(()),
            _ => Err(missing("json object", o)),
        },
        PropType::Union(u) => match model.types.get(u) {
            Some(TypeDef::Union(_)) => Ok(()),
            _ => Err(missing("union", u)),
        },
        PropType::Fk { entity } => match model.types.get(entity) {
            Some(TypeDef::Entity(_)) => Ok(()),
            _ => Err(missing("entity", entity)),
        },
        PropType::ListRelation { entity, field } => {
            let target = match model.types.get(entity) {
                Some(TypeDef::Entity(e)) => e,
                _ => return Err(missing("entity", entity)),
            };
            match target.properties.get(field) {
                Some(Property { prop_type: PropType::Fk { entity: back }, .. })
                    if back == owner =>
                {
                    Ok(())
                }
                _ => Err(LoadError::Invalid(format!(
                    "{owner}.{name}: {entity}.{field} is not a foreign key back to {owner}"
                ))),
            }
        }
    }
}

fn validate_union(model: &Model, name: &str, union: &UnionType) -> Result<(), LoadError> {
    let mut seen: BTreeMap<&String, &Property> = BTreeMap::new();
    for variant in &union.variants {
        let obj = match model.types.get(variant) {
            Some(TypeDef::Object(o)) => o,
            _ => {
                return Err(LoadError::Invalid(format!(
                    "union {name}: variant '{variant}' is not a json object"
                )))
            }
        };
        for (prop_name, prop) in &obj.properties {
            if let Some(prev) = seen.get(prop_name) {
                if prev.prop_type != prop.prop_type {
                    return Err(LoadError::Invalid(format!(
                        "union {name}: variants disagree on the type of '{prop_name}'"
                    )));
                }
            } else {
                seen.insert(prop_name, prop);
            }
        }
    }
    Ok(())
}

fn validate_fts(model: &Model, name: &str, query: &FtsQuery) -> Result<(), LoadError> {
    for source in &query.sources {
        let entity = match model.types.get(&source.entity) {
            Some(TypeDef::Entity(e)) => e,
            _ => {
                return Err(LoadError::Invalid(format!(
                    "fulltext query {name}: '{}' is not an entity",
                    source.entity
                )))
            }
        };
        for field in &source.fields {
            match entity.properties.get(field) {
                Some(Property { prop_type: PropType::Scalar(Scalar::String), .. }) => {}
                _ => {
                    return Err(LoadError::Invalid(format!(
                        "fulltext query {name}: {}.{field} is not a String property",
                        source.entity
                    )))
                }
            }
        }
    }
    Ok(())
}
