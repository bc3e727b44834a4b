//! # Record
//!
//! Inbound records and the `Schema` every record of a pipeline shares.
use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

/// Supported types for record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    /// A string that already holds a serialized JSON document.
    Json,
    Int,
    Float,
    Bool,
}

impl FromStr for FieldType {
    type Err = SchemaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_ref() {
            "string" => Ok(FieldType::String),
            "json" => Ok(FieldType::Json),
            "int" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "bool" => Ok(FieldType::Bool),
            invalid => Err(SchemaParseError::UnknownType(invalid.to_owned())),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Json => write!(f, "json"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// The fixed shape of the records flowing through one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<Field>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaParseError {
    #[error("schema must declare at least one field")]
    Empty,
    #[error("invalid field declaration {0:?}, expected name:type")]
    InvalidField(String),
    #[error("unknown field type {0:?}")]
    UnknownType(String),
    #[error("field {0:?} is declared more than once")]
    DuplicateField(String),
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field. A field with the same name replaces the previous declaration.
    pub fn with_field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.retain(|field| field.name != name);
        self.fields.push(Field {
            name: name.to_owned(),
            field_type,
        });
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Parse a schema from its compact form: `message:string,username:string`.
impl FromStr for Schema {
    type Err = SchemaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields: Vec<Field> = Vec::new();

        for declaration in s.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (name, field_type) = declaration
                .split_once(':')
                .ok_or_else(|| SchemaParseError::InvalidField(declaration.to_owned()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(SchemaParseError::InvalidField(declaration.to_owned()));
            }
            if fields.iter().any(|field| field.name == name) {
                return Err(SchemaParseError::DuplicateField(name.to_owned()));
            }

            fields.push(Field {
                name: name.to_owned(),
                field_type: field_type.parse()?,
            });
        }

        if fields.is_empty() {
            return Err(SchemaParseError::Empty);
        }

        Ok(Schema { fields })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// A single inbound record: named field values. Fields without a value are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(String, FieldValue)>,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("record must be a JSON object")]
    NotAnObject,
    #[error("field {field:?} should be of type {expected}")]
    TypeMismatch { field: String, expected: FieldType },
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field value, replacing any previous value for the same field.
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = value,
            None => self.values.push((name.to_owned(), value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build a record from a flat JSON object, keeping only the fields declared in `schema`.
    /// Missing and `null` fields are left absent; keys not in the schema are ignored.
    pub fn from_json(json: &str, schema: &Schema) -> Result<Record, RecordError> {
        let object = match serde_json::from_str::<Value>(json)? {
            Value::Object(object) => object,
            _ => return Err(RecordError::NotAnObject),
        };

        let mut record = Record::new();
        for field in schema.fields() {
            let value = match object.get(&field.name) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };

            let mismatch = || RecordError::TypeMismatch {
                field: field.name.clone(),
                expected: field.field_type,
            };
            let value = match field.field_type {
                FieldType::String | FieldType::Json => {
                    FieldValue::String(value.as_str().ok_or_else(mismatch)?.to_owned())
                }
                FieldType::Int => FieldValue::Int(value.as_i64().ok_or_else(mismatch)?),
                FieldType::Float => FieldValue::Float(value.as_f64().ok_or_else(mismatch)?),
                FieldType::Bool => FieldValue::Bool(value.as_bool().ok_or_else(mismatch)?),
            };
            record.values.push((field.name.clone(), value));
        }

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema() {
        let schema: Schema = "message:string, username:string,count:int"
            .parse()
            .expect("failed to parse schema");

        assert_eq!(schema.len(), 3);
        assert_eq!(
            schema.field("username").map(|f| f.field_type),
            Some(FieldType::String)
        );
        assert_eq!(
            schema.field("count").map(|f| f.field_type),
            Some(FieldType::Int)
        );
        assert_eq!(schema.fields()[0].name, "message");
    }

    #[test]
    fn test_parse_schema_errors() {
        assert_eq!("".parse::<Schema>(), Err(SchemaParseError::Empty));
        assert_eq!(
            "message".parse::<Schema>(),
            Err(SchemaParseError::InvalidField("message".to_owned()))
        );
        assert_eq!(
            "message:blob".parse::<Schema>(),
            Err(SchemaParseError::UnknownType("blob".to_owned()))
        );
        assert_eq!(
            "a:string,a:int".parse::<Schema>(),
            Err(SchemaParseError::DuplicateField("a".to_owned()))
        );
    }

    #[test]
    fn test_record_from_json() {
        let schema = Schema::new()
            .with_field("message", FieldType::String)
            .with_field("username", FieldType::String)
            .with_field("count", FieldType::Int);

        let record = Record::from_json(
            r#"{"message": "hello", "username": null, "count": 3, "ignored": true}"#,
            &schema,
        )
        .expect("failed to parse record");

        assert_eq!(record.get_str("message"), Some("hello"));
        assert_eq!(record.get("username"), None);
        assert_eq!(record.get("count"), Some(&FieldValue::Int(3)));
        assert_eq!(record.get("ignored"), None);
        assert_eq!(record.len(), 2);
    }

    #[test]
    fn test_record_from_json_type_mismatch() {
        let schema = Schema::new().with_field("message", FieldType::String);

        let err = Record::from_json(r#"{"message": 42}"#, &schema)
            .expect_err("number accepted for a string field");
        assert!(matches!(err, RecordError::TypeMismatch { .. }));

        let err = Record::from_json(r#"["message"]"#, &schema)
            .expect_err("array accepted as a record");
        assert!(matches!(err, RecordError::NotAnObject));
    }

    #[test]
    fn test_record_with_replaces_value() {
        let record = Record::new().with("message", "a").with("message", "b");

        assert_eq!(record.get_str("message"), Some("b"));
        assert_eq!(record.len(), 1);
    }
}
