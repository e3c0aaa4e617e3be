use std::fmt;

/// Client-caused errors, surfaced as GraphQL errors on the response.
///
/// Everything else the planner can hit is either a database error
/// ([`QueryError::Db`]) or a programmer error, which panics: the property-kind
/// dispatch is a closed union and the model is validated before the service
/// accepts traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserError {
    /// A where/orderBy key names a property the object does not have.
    UnknownProperty { object: String, property: String },
    /// A literal failed scalar validation (bad DateTime/BigInt/Bytes/...).
    InvalidLiteral { scalar: &'static str, detail: String },
    /// An unknown value for an enum type.
    UnknownEnumValue { enum_name: String, value: String },
    /// `some`/`every`/`none` applied to a property that is not a list relation.
    NotAListRelation { property: String },
    /// A non-`eq` operator applied to an object, union or relation field.
    UnsupportedOperator { property: String, op: &'static str },
    /// An orderBy path that does not terminate on a scalar or enum.
    InvalidOrderBy { detail: String },
    /// Connections require a non-empty `orderBy`.
    MissingOrderBy,
    /// A Relay cursor that failed to decode or validate.
    InvalidCursorValue,
    /// Anything else the transport or argument parsing rejects.
    BadRequest(String),
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserError::UnknownProperty { object, property } => {
                write!(f, "Unknown property '{property}' on '{object}'")
            }
            UserError::InvalidLiteral { scalar, detail } => {
                write!(f, "Invalid {scalar} literal: {detail}")
            }
            UserError::UnknownEnumValue { enum_name, value } => {
                write!(f, "'{value}' is not a value of enum {enum_name}")
            }
            UserError::NotAListRelation { property } => {
                write!(f, "'{property}' is not a list relation")
            }
            UserError::UnsupportedOperator { property, op } => {
                write!(f, "Operator '{op}' is not supported on '{property}'")
            }
            UserError::InvalidOrderBy { detail } => write!(f, "Invalid orderBy: {detail}"),
            UserError::MissingOrderBy => write!(f, "Connection queries require orderBy"),
            UserError::InvalidCursorValue => write!(f, "InvalidCursorValue"),
            UserError::BadRequest(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for UserError {}

/// Errors a planning/execution pass can surface to the transport.
#[derive(Debug)]
pub enum QueryError {
    /// 4xx-class: the client sent something invalid.
    User(UserError),
    /// 5xx-class: database connectivity or execution failure.
    Db(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::User(e) => write!(f, "{e}"),
            QueryError::Db(msg) => write!(f, "Database error: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<UserError> for QueryError {
    fn from(e: UserError) -> Self {
        QueryError::User(e)
    }
}
