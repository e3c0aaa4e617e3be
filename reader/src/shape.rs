//! Row shaping: walking the requested-field tree in parallel with each flat
//! result row and reconstructing the nested response objects.
//!
//! Shaping is total over well-formed rows: every cell was projected by the
//! same tree walk that assigned the indices, so a missing or mistyped cell
//! is a programmer error, not a user error.

use serde_json::{Map as JsonMap, Value};

use crate::fields::{FieldRequest, FieldSet};
use crate::model::PropType;

/// Shape a batch of flat rows into response objects.
pub fn shape_rows(fields: &FieldSet, rows: &[Vec<Value>]) -> Vec<Value> {
    rows.iter().map(|row| Value::Object(shape_object(fields, row, None))).collect()
}

/// Shape one row. `discriminator` carries the union variant name when
/// shaping merged union children.
pub fn shape_object(
    fields: &FieldSet,
    cells: &[Value],
    discriminator: Option<&str>,
) -> JsonMap<String, Value> {
    let mut out = JsonMap::new();
    for request in &fields.requests {
        if let (Some(expected), Some(actual)) = (&request.if_type, discriminator) {
            if expected != actual {
                continue;
            }
        }
        let value = shape_request(request, cells);
        out.insert(request.alias.clone(), value);
    }
    if let Some(actual) = discriminator {
        out.insert("isTypeOf".to_string(), Value::String(actual.to_string()));
    }
    out
}

fn shape_request(request: &FieldRequest, cells: &[Value]) -> Value {
    let cell = &cells[request.index];
    match &request.prop_type {
        PropType::Scalar(_) | PropType::Enum(_) | PropType::List(_) => cell.clone(),
        PropType::Object(_) => {
            // The cell is the `IS NULL` presence sentinel.
            if cell.as_bool().unwrap_or(true) {
                Value::Null
            } else {
                let children = request.children.as_ref().expect("object request carries children");
                Value::Object(shape_object(children, cells, None))
            }
        }
        PropType::Union(_) => match cell.as_str() {
            None => Value::Null,
            Some(variant) => {
                let children = request.children.as_ref().expect("union request carries children");
                Value::Object(shape_object(children, cells, Some(variant)))
            }
        },
        PropType::Fk { .. } => {
            if cell.is_null() {
                Value::Null
            } else {
                let children = request.children.as_ref().expect("fk request carries children");
                Value::Object(shape_object(children, cells, None))
            }
        }
        PropType::ListRelation { .. } => {
            let children =
                request.children.as_ref().expect("list relation request carries children");
            let elements = match cell.as_array() {
                Some(rows) => rows,
                None => return Value::Array(Vec::new()),
            };
            Value::Array(
                elements
                    .iter()
                    .map(|element| {
                        let row = element
                            .as_array()
                            .expect("list relation rows are json_build_array results");
                        Value::Object(shape_object(children, row, None))
                    })
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldRequest, FieldSet};
    use crate::model::PropType;
    use crate::scalar::Scalar;
    use serde_json::json;

    fn request(alias: &str, prop_type: PropType, index: usize) -> FieldRequest {
        FieldRequest {
            alias: alias.to_string(),
            prop: alias.to_string(),
            prop_type,
            if_type: None,
            args: None,
            children: None,
            index,
        }
    }

    #[test]
    fn test_scalar_cells_pass_through_by_index() {
        let fields = FieldSet {
            requests: vec![
                request("id", PropType::Scalar(Scalar::Id), 0),
                request("balance", PropType::Scalar(Scalar::Int), 1),
            ],
        };
        let shaped = shape_rows(&fields, &[vec![json!("1"), json!(100)]]);
        assert_eq!(shaped, vec![json!({ "id": "1", "balance": 100 })]);
    }

    #[test]
    fn test_null_fk_yields_null_not_empty_object() {
        let mut fk = request("account", PropType::Fk { entity: "Account".to_string() }, 0);
        fk.children = Some(FieldSet {
            requests: vec![request("id", PropType::Scalar(Scalar::Id), 0)],
        });
        let fields = FieldSet { requests: vec![fk] };
        let shaped = shape_rows(&fields, &[vec![Value::Null]]);
        assert_eq!(shaped, vec![json!({ "account": null })]);
    }

    #[test]
    fn test_object_presence_sentinel() {
        let mut profile = request("profile", PropType::Object("Profile".to_string()), 0);
        profile.children = Some(FieldSet {
            requests: vec![request("bio", PropType::Scalar(Scalar::String), 1)],
        });
        let fields = FieldSet { requests: vec![profile] };
        let shaped = shape_rows(
            &fields,
            &[vec![json!(true), Value::Null], vec![json!(false), json!("hello")]],
        );
        assert_eq!(
            shaped,
            vec![json!({ "profile": null }), json!({ "profile": { "bio": "hello" } })]
        );
    }

    #[test]
    fn test_union_dispatches_on_discriminator() {
        let mut side = request("side", PropType::Union("Side".to_string()), 0);
        let mut only_a = request("onlyA", PropType::Scalar(Scalar::Int), 1);
        only_a.if_type = Some("SideA".to_string());
        let mut only_b = request("onlyB", PropType::Scalar(Scalar::Int), 2);
        only_b.if_type = Some("SideB".to_string());
        let shared = request("shared", PropType::Scalar(Scalar::String), 3);
        side.children = Some(FieldSet { requests: vec![only_a, only_b, shared] });
        let fields = FieldSet { requests: vec![side] };

        let shaped = shape_rows(
            &fields,
            &[
                vec![json!("SideA"), json!(1), Value::Null, json!("x")],
                vec![json!("SideB"), Value::Null, json!(2), json!("y")],
                vec![Value::Null, Value::Null, Value::Null, Value::Null],
            ],
        );
        assert_eq!(
            shaped,
            vec![
                json!({ "side": { "onlyA": 1, "shared": "x", "isTypeOf": "SideA" } }),
                json!({ "side": { "onlyB": 2, "shared": "y", "isTypeOf": "SideB" } }),
                json!({ "side": null }),
            ]
        );
    }

    #[test]
    fn test_list_relation_shapes_nested_row_arrays() {
        let mut history = request(
            "history",
            PropType::ListRelation { entity: "HistoricalBalance".to_string(), field: "account".to_string() },
            0,
        );
        history.children = Some(FieldSet {
            requests: vec![request("balance", PropType::Scalar(Scalar::Int), 0)],
        });
        let fields = FieldSet { requests: vec![history] };
        let shaped = shape_rows(&fields, &[vec![json!([[20], [80]])], vec![json!([])]]);
        assert_eq!(
            shaped,
            vec![
                json!({ "history": [{ "balance": 20 }, { "balance": 80 }] }),
                json!({ "history": [] }),
            ]
        );
    }
}
