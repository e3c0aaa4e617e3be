//! Requested-field trees: the reshape plan built from a GraphQL selection.
//!
//! The transport hands the planner a lowered selection ([`Selection`] /
//! [`SelectionItem`], argument literals already coerced to JSON). The
//! builders here resolve each output field against the model and produce
//! [`FieldRequest`]s carrying everything the SQL walk and the row shaper
//! need: the backing property, the output alias, the union discriminator the
//! request is conditional on, list arguments, and (once columns have been
//! populated) the index the value will occupy in a flat result row.

use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value};

use crate::error::UserError;
use crate::model::{Model, PropType, Property};
use crate::scalar::Scalar;

// ---------- transport input ----------

/// One selected field, as lowered by the transport.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub name: String,
    pub alias: String,
    pub args: JsonMap<String, Value>,
    pub items: Vec<SelectionItem>,
}

/// A selection-set entry: a field, or a type-conditioned fragment group.
#[derive(Debug, Clone)]
pub enum SelectionItem {
    Field(Selection),
    Fragment { type_name: Option<String>, items: Vec<SelectionItem> },
}

// ---------- list arguments ----------

#[derive(Debug, Clone, Default)]
pub struct ListArgs {
    pub where_: Option<Value>,
    pub order_by: Vec<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListArgs {
    pub fn from_args(args: &JsonMap<String, Value>) -> Result<ListArgs, UserError> {
        let mut out = ListArgs::default();
        if let Some(w) = args.get("where") {
            if !w.is_object() {
                return Err(UserError::BadRequest("where must be an object".to_string()));
            }
            out.where_ = Some(w.clone());
        }
        match args.get("orderBy") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => out.order_by.push(s.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    match item.as_str() {
                        Some(s) => out.order_by.push(s.to_string()),
                        None => {
                            return Err(UserError::BadRequest(
                                "orderBy must be a list of enum values".to_string(),
                            ))
                        }
                    }
                }
            }
            Some(_) => {
                return Err(UserError::BadRequest(
                    "orderBy must be a list of enum values".to_string(),
                ))
            }
        }
        out.limit = parse_page_arg(args, "limit")?;
        out.offset = parse_page_arg(args, "offset")?;
        Ok(out)
    }
}

pub(crate) fn parse_page_arg(
    args: &JsonMap<String, Value>,
    name: &str,
) -> Result<Option<i64>, UserError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(Some(n)),
            _ => Err(UserError::BadRequest(format!("{name} must be a non-negative integer"))),
        },
    }
}

// ---------- plan tree ----------

/// Sentinel for a request whose column index has not been assigned yet.
pub const INDEX_UNSET: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct FieldRequest {
    /// Output key in the response object.
    pub alias: String,
    /// Property name on the backing type.
    pub prop: String,
    pub prop_type: PropType,
    /// When set, the request only applies to rows whose union discriminator
    /// matches this variant name.
    pub if_type: Option<String>,
    /// List arguments; present on list-relation requests only.
    pub args: Option<ListArgs>,
    pub children: Option<FieldSet>,
    /// Position of this request's value in a flat result row, assigned
    /// while columns are populated.
    pub index: usize,
}

impl FieldRequest {
    fn leaf(alias: &str, prop: &str, prop_type: &PropType, if_type: Option<String>) -> FieldRequest {
        FieldRequest {
            alias: alias.to_string(),
            prop: prop.to_string(),
            prop_type: prop_type.clone(),
            if_type,
            args: None,
            children: None,
            index: INDEX_UNSET,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldSet {
    pub requests: Vec<FieldRequest>,
}

// ---------- flattening ----------

/// Collect the fields visible for `type_name`: top-level fields plus the
/// contents of fragments whose type condition matches.
fn flatten<'a>(
    model: &Model,
    type_name: &str,
    items: &'a [SelectionItem],
    out: &mut Vec<&'a Selection>,
) {
    for item in items {
        match item {
            SelectionItem::Field(sel) => out.push(sel),
            SelectionItem::Fragment { type_name: cond, items } => {
                let matches = match cond {
                    None => true,
                    Some(cond) => model.type_condition_matches(type_name, cond),
                };
                if matches {
                    flatten(model, type_name, items, out);
                }
            }
        }
    }
}

/// Flatten ignoring type conditions; used for synthetic wrapper types
/// (connections, pageInfo) whose names the planner does not track.
fn flatten_any<'a>(items: &'a [SelectionItem], out: &mut Vec<&'a Selection>) {
    for item in items {
        match item {
            SelectionItem::Field(sel) => out.push(sel),
            SelectionItem::Fragment { items, .. } => flatten_any(items, out),
        }
    }
}

// ---------- entity / object field trees ----------

pub fn entity_fields(
    model: &Model,
    entity: &str,
    items: &[SelectionItem],
) -> Result<FieldSet, UserError> {
    build_fields(model, entity, &model.entity(entity).properties, items)
}

fn object_fields(
    model: &Model,
    object: &str,
    items: &[SelectionItem],
) -> Result<FieldSet, UserError> {
    build_fields(model, object, &model.object(object).properties, items)
}

fn build_fields(
    model: &Model,
    type_name: &str,
    props: &BTreeMap<String, Property>,
    items: &[SelectionItem],
) -> Result<FieldSet, UserError> {
    let mut selections = Vec::new();
    flatten(model, type_name, items, &mut selections);

    let mut set = FieldSet::default();
    for sel in selections {
        if sel.name == "__typename" {
            continue;
        }
        let prop = props.get(&sel.name).ok_or_else(|| UserError::UnknownProperty {
            object: type_name.to_string(),
            property: sel.name.clone(),
        })?;
        let request = build_request(model, sel, &sel.name, prop, None)?;
        set.requests.push(request);
    }
    Ok(set)
}

fn build_request(
    model: &Model,
    sel: &Selection,
    prop_name: &str,
    prop: &Property,
    if_type: Option<String>,
) -> Result<FieldRequest, UserError> {
    let mut request = FieldRequest::leaf(&sel.alias, prop_name, &prop.prop_type, if_type);
    match &prop.prop_type {
        PropType::Scalar(_) | PropType::Enum(_) | PropType::List(_) => {}
        PropType::Object(name) => {
            request.children = Some(object_fields(model, name, &sel.items)?);
        }
        PropType::Union(name) => {
            request.children = Some(union_fields(model, name, &sel.items)?);
        }
        PropType::Fk { entity } => {
            request.children = Some(entity_fields(model, entity, &sel.items)?);
        }
        PropType::ListRelation { entity, .. } => {
            request.children = Some(entity_fields(model, entity, &sel.items)?);
            request.args = Some(ListArgs::from_args(&sel.args)?);
        }
    }
    Ok(request)
}

// ---------- union field trees ----------

/// Build the merged request set for a union-typed field: one pass per
/// variant over the same selection, then shared scalar/enum requests that
/// every variant produced identically collapse into a single unconditional
/// request.
fn union_fields(
    model: &Model,
    union_name: &str,
    items: &[SelectionItem],
) -> Result<FieldSet, UserError> {
    let union = model.union(union_name);
    let variant_count = union.variants.len();

    // Preserve first-seen output order across variants.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<FieldRequest>> = BTreeMap::new();

    for variant in &union.variants {
        let mut props = model.object(variant).properties.clone();
        props.insert(
            "isTypeOf".to_string(),
            Property::new(PropType::Scalar(Scalar::String), false),
        );

        let mut selections = Vec::new();
        flatten(model, variant, items, &mut selections);

        let mut seen_aliases: Vec<&str> = Vec::new();
        for sel in selections {
            if sel.name == "__typename" {
                continue;
            }
            if seen_aliases.contains(&sel.alias.as_str()) {
                continue;
            }
            seen_aliases.push(sel.alias.as_str());
            let prop = props.get(&sel.name).ok_or_else(|| UserError::UnknownProperty {
                object: variant.clone(),
                property: sel.name.clone(),
            })?;
            let request = build_request(model, sel, &sel.name, prop, Some(variant.clone()))?;
            if !groups.contains_key(&sel.alias) {
                order.push(sel.alias.clone());
            }
            groups.entry(sel.alias.clone()).or_default().push(request);
        }
    }

    let mut set = FieldSet::default();
    for alias in order {
        let requests = groups.remove(&alias).expect("group exists for ordered alias");
        if collapses(&requests, variant_count) {
            let mut shared = requests.into_iter().next().expect("non-empty group");
            shared.if_type = None;
            set.requests.push(shared);
        } else {
            set.requests.extend(requests);
        }
    }
    Ok(set)
}

/// A group collapses when every variant requested the same scalar/enum
/// property the same way.
fn collapses(requests: &[FieldRequest], variant_count: usize) -> bool {
    if requests.len() != variant_count {
        return false;
    }
    let first = &requests[0];
    if !matches!(first.prop_type, PropType::Scalar(_) | PropType::Enum(_)) {
        return false;
    }
    requests
        .iter()
        .all(|r| r.prop == first.prop && r.prop_type == first.prop_type)
}

// ---------- connection field trees ----------

#[derive(Debug, Clone, Default)]
pub struct ConnectionFields {
    pub total_count: bool,
    pub page_info: bool,
    pub edges_cursor: bool,
    pub edges_node: Option<FieldSet>,
}

pub fn connection_fields(
    model: &Model,
    entity: &str,
    items: &[SelectionItem],
) -> Result<ConnectionFields, UserError> {
    let mut out = ConnectionFields::default();
    let mut selections = Vec::new();
    flatten_any(items, &mut selections);
    for sel in selections {
        match sel.name.as_str() {
            "__typename" => {}
            "totalCount" => out.total_count = true,
            "pageInfo" => out.page_info = true,
            "edges" => {
                let mut edge_fields = Vec::new();
                flatten_any(&sel.items, &mut edge_fields);
                for edge_sel in edge_fields {
                    match edge_sel.name.as_str() {
                        "__typename" => {}
                        "cursor" => out.edges_cursor = true,
                        "node" => {
                            out.edges_node =
                                Some(entity_fields(model, entity, &edge_sel.items)?);
                        }
                        other => {
                            return Err(UserError::BadRequest(format!(
                                "unknown edge field '{other}'"
                            )))
                        }
                    }
                }
            }
            other => {
                return Err(UserError::BadRequest(format!("unknown connection field '{other}'")))
            }
        }
    }
    Ok(out)
}

// ---------- fulltext-search field trees ----------

#[derive(Debug, Clone, Default)]
pub struct FtsFields {
    pub rank: bool,
    pub highlight: bool,
    pub item: bool,
    /// Per source entity, the fields requested under `item { ... on E }`.
    pub entity_fields: BTreeMap<String, FieldSet>,
}

pub fn fts_fields(
    model: &Model,
    source_entities: &[String],
    items: &[SelectionItem],
) -> Result<FtsFields, UserError> {
    let mut out = FtsFields::default();
    let mut selections = Vec::new();
    flatten_any(items, &mut selections);
    for sel in selections {
        match sel.name.as_str() {
            "__typename" => {}
            "rank" => out.rank = true,
            "highlight" => out.highlight = true,
            "item" => {
                out.item = true;
                collect_fts_item_fields(model, source_entities, &sel.items, &mut out)?;
            }
            other => {
                return Err(UserError::BadRequest(format!("unknown search field '{other}'")))
            }
        }
    }
    Ok(out)
}

fn collect_fts_item_fields(
    model: &Model,
    source_entities: &[String],
    items: &[SelectionItem],
    out: &mut FtsFields,
) -> Result<(), UserError> {
    for item in items {
        match item {
            // The item union only answers per-entity fragments (plus
            // __typename, which the transport owns).
            SelectionItem::Field(sel) if sel.name == "__typename" => {}
            SelectionItem::Field(sel) => {
                return Err(UserError::BadRequest(format!(
                    "'{}' must be selected through an entity fragment",
                    sel.name
                )))
            }
            SelectionItem::Fragment { type_name: None, items } => {
                collect_fts_item_fields(model, source_entities, items, out)?;
            }
            SelectionItem::Fragment { type_name: Some(cond), items } => {
                if !source_entities.iter().any(|e| e == cond) {
                    return Err(UserError::BadRequest(format!(
                        "'{cond}' is not a source of this search"
                    )));
                }
                let fields = entity_fields(model, cond, items)?;
                out.entity_fields.insert(cond.clone(), fields);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, JsonObject, TypeDef, UnionType};

    fn sel(name: &str, items: Vec<SelectionItem>) -> Selection {
        Selection { name: name.to_string(), alias: name.to_string(), args: JsonMap::new(), items }
    }

    fn field(name: &str) -> SelectionItem {
        SelectionItem::Field(sel(name, vec![]))
    }

    fn test_model() -> Model {
        let mut model = Model::default();
        let mut account = BTreeMap::new();
        account.insert("id".to_string(), Property::new(PropType::Scalar(Scalar::Id), false));
        account
            .insert("wallet".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        account.insert(
            "history".to_string(),
            Property::new(
                PropType::ListRelation {
                    entity: "HistoricalBalance".to_string(),
                    field: "account".to_string(),
                },
                false,
            ),
        );
        let mut hb = BTreeMap::new();
        hb.insert("id".to_string(), Property::new(PropType::Scalar(Scalar::Id), false));
        hb.insert(
            "account".to_string(),
            Property::new(PropType::Fk { entity: "Account".to_string() }, false),
        );
        hb.insert("balance".to_string(), Property::new(PropType::Scalar(Scalar::Int), false));
        model.types.insert(
            "Account".to_string(),
            TypeDef::Entity(Entity { properties: account, implements: vec![] }),
        );
        model.types.insert(
            "HistoricalBalance".to_string(),
            TypeDef::Entity(Entity { properties: hb, implements: vec![] }),
        );

        let mut a = BTreeMap::new();
        a.insert("shared".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        a.insert("onlyA".to_string(), Property::new(PropType::Scalar(Scalar::Int), true));
        let mut b = BTreeMap::new();
        b.insert("shared".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        b.insert("onlyB".to_string(), Property::new(PropType::Scalar(Scalar::Int), true));
        model.types.insert("SideA".to_string(), TypeDef::Object(JsonObject { properties: a }));
        model.types.insert("SideB".to_string(), TypeDef::Object(JsonObject { properties: b }));
        model.types.insert(
            "Side".to_string(),
            TypeDef::Union(UnionType::new(vec!["SideA".to_string(), "SideB".to_string()])),
        );
        model
    }

    #[test]
    fn test_unknown_property_is_a_user_error() {
        let model = test_model();
        let err = entity_fields(&model, "Account", &[field("walet")]).unwrap_err();
        assert!(matches!(err, UserError::UnknownProperty { .. }), "got {err:?}");
    }

    #[test]
    fn test_list_relation_captures_args() {
        let model = test_model();
        let mut history = sel("history", vec![field("balance")]);
        history.args.insert("limit".to_string(), serde_json::json!(5));
        let set = entity_fields(&model, "Account", &[SelectionItem::Field(history)]).unwrap();
        let req = &set.requests[0];
        assert_eq!(req.args.as_ref().unwrap().limit, Some(5));
        assert!(req.children.as_ref().unwrap().requests.iter().any(|r| r.prop == "balance"));
    }

    #[test]
    fn test_union_shared_scalar_collapses() {
        let model = test_model();
        let items = vec![field("shared")];
        let set = union_fields(&model, "Side", &items).unwrap();
        assert_eq!(set.requests.len(), 1, "shared scalar collapses to one request");
        assert_eq!(set.requests[0].if_type, None);
    }

    #[test]
    fn test_union_variant_only_field_stays_conditional() {
        let model = test_model();
        let items = vec![SelectionItem::Fragment {
            type_name: Some("SideA".to_string()),
            items: vec![field("onlyA")],
        }];
        let set = union_fields(&model, "Side", &items).unwrap();
        assert_eq!(set.requests.len(), 1);
        assert_eq!(set.requests[0].if_type.as_deref(), Some("SideA"));
    }

    #[test]
    fn test_connection_fields_extraction() {
        let model = test_model();
        let items = vec![
            field("totalCount"),
            SelectionItem::Field(sel(
                "edges",
                vec![SelectionItem::Field(sel("node", vec![field("id")])), field("cursor")],
            )),
            SelectionItem::Field(sel("pageInfo", vec![field("hasNextPage")])),
        ];
        let conn = connection_fields(&model, "Account", &items).unwrap();
        assert!(conn.total_count && conn.page_info && conn.edges_cursor);
        assert!(conn.edges_node.is_some());
    }

    #[test]
    fn test_negative_limit_rejected() {
        let mut args = JsonMap::new();
        args.insert("limit".to_string(), serde_json::json!(-1));
        assert!(ListArgs::from_args(&args).is_err());
    }

    #[test]
    fn test_order_by_accepts_string_or_list() {
        let mut args = JsonMap::new();
        args.insert("orderBy".to_string(), serde_json::json!("id_ASC"));
        assert_eq!(ListArgs::from_args(&args).unwrap().order_by, vec!["id_ASC"]);
        args.insert("orderBy".to_string(), serde_json::json!(["id_ASC", "wallet_DESC"]));
        assert_eq!(ListArgs::from_args(&args).unwrap().order_by.len(), 2);
    }
}
