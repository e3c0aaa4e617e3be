//! OpenCRUD orderBy parsing (`field_ASC`, `nested_field_DESC`) and ORDER BY
//! clause population.

use crate::error::UserError;
use crate::model::{Model, PropType, Property};
use crate::sql::cursor::Cursor;
use crate::sql::{JoinSet, SqlBuilder};

/// One parsed orderBy entry: a property chain ending on a scalar or enum,
/// paired with a direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLeaf {
    pub path: Vec<String>,
    pub desc: bool,
}

/// Parse and validate orderBy values against an entity. The path walks
/// through object, union and fk properties; the terminal step must be a
/// scalar or enum.
pub fn parse_order_by(
    model: &Model,
    entity: &str,
    raw: &[String],
) -> Result<Vec<OrderLeaf>, UserError> {
    raw.iter().map(|value| parse_one(model, entity, value)).collect()
}

fn parse_one(model: &Model, entity: &str, value: &str) -> Result<OrderLeaf, UserError> {
    let (rest, desc) = if let Some(rest) = value.strip_suffix("_DESC") {
        (rest, true)
    } else if let Some(rest) = value.strip_suffix("_ASC") {
        (rest, false)
    } else {
        return Err(UserError::InvalidOrderBy {
            detail: format!("'{value}' must end in _ASC or _DESC"),
        });
    };

    let path: Vec<String> = rest.split('_').map(|s| s.to_string()).collect();
    if path.iter().any(|segment| segment.is_empty()) {
        return Err(UserError::InvalidOrderBy { detail: format!("'{value}' is malformed") });
    }

    // Validate the chain through the model.
    let mut owner = entity.to_string();
    let mut props = &model.entity(entity).properties;
    for (i, segment) in path.iter().enumerate() {
        let prop: &Property = props.get(segment).ok_or_else(|| UserError::InvalidOrderBy {
            detail: format!("'{owner}' has no property '{segment}'"),
        })?;
        let last = i == path.len() - 1;
        match &prop.prop_type {
            PropType::Scalar(_) | PropType::Enum(_) if last => {}
            PropType::Scalar(_) | PropType::Enum(_) => {
                return Err(UserError::InvalidOrderBy {
                    detail: format!("'{segment}' has no sub-properties to sort by"),
                })
            }
            PropType::Object(name) if !last => {
                owner = name.clone();
                props = &model.object(name).properties;
            }
            PropType::Union(name) if !last => {
                owner = name.clone();
                props = model.union_props(name);
            }
            PropType::Fk { entity } if !last => {
                owner = entity.clone();
                props = &model.entity(entity).properties;
            }
            _ => {
                return Err(UserError::InvalidOrderBy {
                    detail: format!("cannot sort by '{value}': '{segment}' does not terminate on a scalar"),
                })
            }
        }
    }
    Ok(OrderLeaf { path, desc })
}

impl SqlBuilder<'_> {
    /// Emit `ORDER BY` terms for parsed leaves, descending through the
    /// cursor (joins register as needed).
    pub fn populate_order_by(
        &mut self,
        joins: &mut JoinSet,
        cursor: &Cursor,
        leaves: &[OrderLeaf],
    ) -> Vec<String> {
        let model = self.model;
        leaves
            .iter()
            .map(|leaf| {
                let mut cur = cursor.clone();
                for segment in &leaf.path[..leaf.path.len() - 1] {
                    cur = cur.child(model, &mut self.aliases, joins, segment);
                }
                let terminal = leaf.path.last().expect("validated non-empty path");
                let direction = if leaf.desc { "DESC" } else { "ASC" };
                format!("{} {direction}", cur.native(model, terminal))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, TypeDef};
    use crate::scalar::Scalar;
    use std::collections::BTreeMap;

    fn model() -> Model {
        let mut model = Model::default();
        let mut account = BTreeMap::new();
        account.insert("id".to_string(), Property::new(PropType::Scalar(Scalar::Id), false));
        account
            .insert("wallet".to_string(), Property::new(PropType::Scalar(Scalar::String), false));
        let mut hb = BTreeMap::new();
        hb.insert("id".to_string(), Property::new(PropType::Scalar(Scalar::Id), false));
        hb.insert("balance".to_string(), Property::new(PropType::Scalar(Scalar::Int), false));
        hb.insert(
            "account".to_string(),
            Property::new(PropType::Fk { entity: "Account".to_string() }, false),
        );
        model.types.insert(
            "Account".to_string(),
            TypeDef::Entity(Entity { properties: account, implements: vec![] }),
        );
        model.types.insert(
            "HistoricalBalance".to_string(),
            TypeDef::Entity(Entity { properties: hb, implements: vec![] }),
        );
        model
    }

    #[test]
    fn test_parse_simple_and_nested_paths() {
        let model = model();
        let leaves = parse_order_by(
            &model,
            "HistoricalBalance",
            &["account_wallet_ASC".to_string(), "balance_DESC".to_string()],
        )
        .unwrap();
        assert_eq!(
            leaves,
            vec![
                OrderLeaf { path: vec!["account".to_string(), "wallet".to_string()], desc: false },
                OrderLeaf { path: vec!["balance".to_string()], desc: true },
            ]
        );
    }

    #[test]
    fn test_missing_direction_is_rejected() {
        let model = model();
        let err = parse_order_by(&model, "Account", &["wallet".to_string()]).unwrap_err();
        assert!(matches!(err, UserError::InvalidOrderBy { .. }));
    }

    #[test]
    fn test_non_terminal_scalar_is_rejected() {
        let model = model();
        let err =
            parse_order_by(&model, "HistoricalBalance", &["balance_nope_ASC".to_string()])
                .unwrap_err();
        assert!(matches!(err, UserError::InvalidOrderBy { .. }));
    }

    #[test]
    fn test_unknown_property_is_rejected() {
        let model = model();
        let err = parse_order_by(&model, "Account", &["missing_ASC".to_string()]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing"), "got: {msg}");
    }

    #[test]
    fn test_order_by_fk_emits_joined_column() {
        let model = model();
        let mut builder = SqlBuilder::new(&model);
        let mut joins = JoinSet::default();
        let cursor = Cursor::root(&mut builder.aliases, "HistoricalBalance");
        let leaves = parse_order_by(
            &model,
            "HistoricalBalance",
            &["account_wallet_ASC".to_string(), "balance_DESC".to_string()],
        )
        .unwrap();
        let terms = builder.populate_order_by(&mut joins, &cursor, &leaves);
        assert_eq!(terms[0], "\"account\".\"wallet\" ASC");
        assert_eq!(terms[1], "\"historical_balance\".\"balance\" DESC");
        assert!(joins.render().contains("LEFT OUTER JOIN \"account\""));
    }
}
