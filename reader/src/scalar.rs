//! Scalar codec registry: per-scalar wire validation and SQL cast snippets.
//!
//! Values travel as canonical transport strings end to end (wire, SQL
//! parameters, intermediate materialization); the casts here move between
//! that form and each scalar's native SQL type. Arbitrary-precision and
//! temporal values are never interpreted in process.

use serde_json::Value;

/// The closed set of built-in scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    Id,
    String,
    Int,
    Float,
    Boolean,
    BigInt,
    DateTime,
    Bytes,
}

/// Postgres `to_char` pattern producing RFC 3339 with milliseconds.
const TIMESTAMP_FORMAT: &str = "YYYY-MM-DD\"T\"HH24:MI:SS.MS\"Z\"";

impl Scalar {
    pub fn from_name(name: &str) -> Option<Scalar> {
        match name {
            "ID" => Some(Scalar::Id),
            "String" => Some(Scalar::String),
            "Int" => Some(Scalar::Int),
            "Float" => Some(Scalar::Float),
            "Boolean" => Some(Scalar::Boolean),
            "BigInt" => Some(Scalar::BigInt),
            "DateTime" => Some(Scalar::DateTime),
            "Bytes" => Some(Scalar::Bytes),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scalar::Id => "ID",
            Scalar::String => "String",
            Scalar::Int => "Int",
            Scalar::Float => "Float",
            Scalar::Boolean => "Boolean",
            Scalar::BigInt => "BigInt",
            Scalar::DateTime => "DateTime",
            Scalar::Bytes => "Bytes",
        }
    }

    /// True for scalars whose lists are stored as native SQL array columns.
    /// Lists of anything else live in JSON.
    pub fn array_capable(self) -> bool {
        matches!(
            self,
            Scalar::Id
                | Scalar::String
                | Scalar::Int
                | Scalar::BigInt
                | Scalar::DateTime
                | Scalar::Bytes
        )
    }

    // ---------- wire validation ----------

    /// Validate a JSON literal and return its canonical transport string.
    ///
    /// The transport string is what gets bound as a text parameter; the
    /// corresponding `from_transport_cast` turns it back into the native
    /// SQL type inside the statement.
    pub fn validate_literal(self, value: &Value) -> Result<String, String> {
        match self {
            Scalar::Id | Scalar::String => value
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| format!("expected a string, got {value}")),
            Scalar::Int => match value.as_i64() {
                Some(n) => Ok(n.to_string()),
                None => Err(format!("expected an integer, got {value}")),
            },
            Scalar::Float => match value {
                Value::Number(n) => Ok(n.to_string()),
                other => Err(format!("expected a number, got {other}")),
            },
            Scalar::Boolean => match value.as_bool() {
                Some(b) => Ok(b.to_string()),
                None => Err(format!("expected a boolean, got {value}")),
            },
            Scalar::BigInt => match value {
                Value::String(s) => {
                    let digits = s.strip_prefix('-').or_else(|| s.strip_prefix('+')).unwrap_or(s);
                    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                        Ok(s.clone())
                    } else {
                        Err(format!("'{s}' is not a decimal integer string"))
                    }
                }
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
                other => Err(format!("expected a decimal integer string, got {other}")),
            },
            Scalar::DateTime => match value.as_str() {
                Some(s) => match chrono::DateTime::parse_from_rfc3339(s) {
                    Ok(_) => Ok(s.to_string()),
                    Err(e) => Err(format!("'{s}' is not RFC 3339: {e}")),
                },
                None => Err(format!("expected an RFC 3339 string, got {value}")),
            },
            Scalar::Bytes => match value.as_str() {
                Some(s) => {
                    let hex = s.strip_prefix("0x").ok_or_else(|| {
                        format!("'{s}' must start with 0x")
                    })?;
                    if hex.len() % 2 == 0
                        && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
                    {
                        Ok(s.to_string())
                    } else {
                        Err(format!("'{s}' is not lower-case hex"))
                    }
                }
                None => Err(format!("expected a 0x-prefixed hex string, got {value}")),
            },
        }
    }

    // ---------- SQL casts: transport string <-> native column ----------

    /// Cast a transport-string expression to the scalar's native SQL type.
    pub fn from_transport_cast(self, expr: &str) -> String {
        match self {
            Scalar::Id | Scalar::String => expr.to_string(),
            Scalar::Int => format!("({expr})::int"),
            Scalar::Float => format!("({expr})::float8"),
            Scalar::Boolean => format!("({expr})::boolean"),
            Scalar::BigInt => format!("({expr})::numeric"),
            Scalar::DateTime => format!("({expr})::timestamptz"),
            Scalar::Bytes => format!("decode(substr({expr}, 3), 'hex')"),
        }
    }

    /// Cast a native column expression to its transport representation.
    ///
    /// Identity scalars stay in their native type; the database driver
    /// already materializes them as the right JSON value.
    pub fn to_transport_cast(self, expr: &str) -> String {
        match self {
            Scalar::Id
            | Scalar::String
            | Scalar::Int
            | Scalar::Float
            | Scalar::Boolean => expr.to_string(),
            Scalar::BigInt => format!("({expr})::text"),
            Scalar::DateTime => {
                format!("to_char(({expr}) at time zone 'UTC', '{TIMESTAMP_FORMAT}')")
            }
            Scalar::Bytes => format!("'0x' || encode({expr}, 'hex')"),
        }
    }

    /// `from_transport_cast` for a whole array column.
    pub fn from_transport_array_cast(self, expr: &str) -> String {
        match self {
            Scalar::Id | Scalar::String => format!("({expr})::text[]"),
            Scalar::Int => format!("({expr})::int[]"),
            Scalar::BigInt => format!("({expr})::numeric[]"),
            Scalar::DateTime => format!("({expr})::timestamptz[]"),
            Scalar::Bytes => {
                format!("array(SELECT decode(substr(b, 3), 'hex') FROM unnest(({expr})::text[]) AS b)")
            }
            Scalar::Float | Scalar::Boolean => {
                unreachable!("{} lists are stored as JSON", self.name())
            }
        }
    }

    /// `to_transport_cast` for a whole array column.
    pub fn to_transport_array_cast(self, expr: &str) -> String {
        match self {
            Scalar::Id | Scalar::String | Scalar::Int => expr.to_string(),
            Scalar::BigInt => format!("({expr})::text[]"),
            Scalar::DateTime => format!(
                "array(SELECT to_char(t at time zone 'UTC', '{TIMESTAMP_FORMAT}') FROM unnest({expr}) AS t)"
            ),
            Scalar::Bytes => {
                format!("array(SELECT '0x' || encode(b, 'hex') FROM unnest({expr}) AS b)")
            }
            Scalar::Float | Scalar::Boolean => {
                unreachable!("{} lists are stored as JSON", self.name())
            }
        }
    }

    // ---------- SQL casts: embedded JSON ----------

    /// Extract a property from an embedded JSON object as the native SQL
    /// type. Int and Float go through `->` so numeric JSON stays numeric.
    pub fn from_json_cast(self, obj: &str, prop: &str) -> String {
        match self {
            Scalar::Id | Scalar::String => format!("{obj}->>'{prop}'"),
            Scalar::Int => format!("({obj}->'{prop}')::int"),
            Scalar::Float => format!("({obj}->'{prop}')::float8"),
            Scalar::Boolean => format!("({obj}->>'{prop}')::boolean"),
            Scalar::BigInt => format!("({obj}->>'{prop}')::numeric"),
            Scalar::DateTime => format!("({obj}->>'{prop}')::timestamptz"),
            Scalar::Bytes => format!("decode(substr({obj}->>'{prop}', 3), 'hex')"),
        }
    }

    /// Extract a property from an embedded JSON object in transport form.
    /// Embedded objects are stored in transport form already, so this is a
    /// plain text extraction except for the numeric scalars.
    pub fn from_json_to_transport_cast(self, obj: &str, prop: &str) -> String {
        match self {
            Scalar::Int => format!("({obj}->'{prop}')::int"),
            Scalar::Float => format!("({obj}->'{prop}')::float8"),
            Scalar::Boolean => format!("({obj}->>'{prop}')::boolean"),
            Scalar::Id
            | Scalar::String
            | Scalar::BigInt
            | Scalar::DateTime
            | Scalar::Bytes => format!("{obj}->>'{prop}'"),
        }
    }
}
