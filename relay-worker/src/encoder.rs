//! Turn records into webhook payloads.
use relay_common::config_source::{first_value, Snapshot};
use relay_common::record::{FieldType, Record, Schema};
use relay_common::webhook::{MessageOverrides, WebhookMessage};

use crate::error::{ConfigurationError, EncodeError};

/// Configuration keys that override `FieldMapping` entries.
pub const MESSAGE_FIELD_KEY: &str = "messageField";
pub const USERNAME_FIELD_KEY: &str = "usernameField";
pub const ICON_URL_FIELD_KEY: &str = "iconUrlField";
pub const ICON_EMOJI_FIELD_KEY: &str = "iconEmojiField";

/// Older names of the keys above, still honoured when the newer name is not set.
pub const MESSAGE_ATTRIBUTE_KEY: &str = "messageAttribute";
pub const USERNAME_ATTRIBUTE_KEY: &str = "usernameAttribute";
pub const ICON_URL_ATTRIBUTE_KEY: &str = "iconUrlAttribute";
pub const ICON_EMOJI_ATTRIBUTE_KEY: &str = "iconEmojiAttribute";

/// Names of the record fields that provide each payload key, when not the default.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub text: Option<String>,
    pub username: Option<String>,
    pub icon_url: Option<String>,
    pub icon_emoji: Option<String>,
}

impl FieldMapping {
    /// Return a copy of this mapping where entries present in `snapshot` take precedence.
    pub fn overridden_by(&self, snapshot: &Snapshot) -> FieldMapping {
        let pick = |keys: &[&str], current: &Option<String>| {
            first_value(snapshot, keys)
                .map(str::to_owned)
                .or_else(|| current.clone())
        };

        FieldMapping {
            text: pick(&[MESSAGE_FIELD_KEY, MESSAGE_ATTRIBUTE_KEY], &self.text),
            username: pick(&[USERNAME_FIELD_KEY, USERNAME_ATTRIBUTE_KEY], &self.username),
            icon_url: pick(&[ICON_URL_FIELD_KEY, ICON_URL_ATTRIBUTE_KEY], &self.icon_url),
            icon_emoji: pick(
                &[ICON_EMOJI_FIELD_KEY, ICON_EMOJI_ATTRIBUTE_KEY],
                &self.icon_emoji,
            ),
        }
    }
}

/// Record fields resolved against a schema for structured encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFields {
    pub text: String,
    pub username: Option<String>,
    pub icon_url: Option<String>,
    pub icon_emoji: Option<String>,
}

/// How records are encoded. Decided once from the schema and fixed for the pipeline's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingMode {
    /// The only field already holds a JSON payload, sent as is.
    RawJson { field: String },
    /// The only field is the message text.
    SingleText { field: String },
    /// Fields map onto payload keys.
    Structured(ResolvedFields),
}

impl EncodingMode {
    pub fn name(&self) -> &'static str {
        match self {
            EncodingMode::RawJson { .. } => "raw_json",
            EncodingMode::SingleText { .. } => "single_text",
            EncodingMode::Structured(_) => "structured",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    mode: EncodingMode,
}

impl PayloadEncoder {
    /// Select the encoding mode for records of `schema`, failing if they cannot be encoded.
    pub fn for_schema(
        schema: &Schema,
        mapping: &FieldMapping,
    ) -> Result<PayloadEncoder, ConfigurationError> {
        let mode = match schema.fields() {
            [] => return Err(ConfigurationError::EmptySchema),
            [only] if only.field_type == FieldType::Json && maps_only(mapping, &only.name) => {
                EncodingMode::RawJson {
                    field: only.name.clone(),
                }
            }
            [only]
                if only.field_type == FieldType::String
                    && only.name != "text"
                    && maps_only(mapping, &only.name) =>
            {
                EncodingMode::SingleText {
                    field: only.name.clone(),
                }
            }
            _ => EncodingMode::Structured(resolve_fields(schema, mapping)?),
        };

        Ok(PayloadEncoder { mode })
    }

    pub fn mode(&self) -> &EncodingMode {
        &self.mode
    }

    /// Encode `record` into a request body. Destination overrides fill in whatever the record
    /// does not provide, except in raw JSON mode where the payload is never modified.
    pub fn encode(
        &self,
        record: &Record,
        overrides: &MessageOverrides,
    ) -> Result<String, EncodeError> {
        let mut message = match &self.mode {
            EncodingMode::RawJson { field } => {
                let payload = required_text(record, "text", field)?;
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(payload)
                    .map_err(EncodeError::InvalidJson)?;

                return Ok(payload.to_owned());
            }
            EncodingMode::SingleText { field } => {
                WebhookMessage::new(required_text(record, "text", field)?)
            }
            EncodingMode::Structured(fields) => WebhookMessage {
                text: required_text(record, "text", &fields.text)?.to_owned(),
                username: optional_text(record, "username", &fields.username)?,
                icon_url: optional_text(record, "icon_url", &fields.icon_url)?,
                icon_emoji: optional_text(record, "icon_emoji", &fields.icon_emoji)?,
            },
        };

        message.apply_overrides(overrides);
        message.to_body().map_err(EncodeError::Serialize)
    }
}

/// Whether `mapping` maps nothing but, at most, the text to `field`.
fn maps_only(mapping: &FieldMapping, field: &str) -> bool {
    mapping.username.is_none()
        && mapping.icon_url.is_none()
        && mapping.icon_emoji.is_none()
        && mapping.text.as_deref().map_or(true, |text| text == field)
}

fn resolve_fields(
    schema: &Schema,
    mapping: &FieldMapping,
) -> Result<ResolvedFields, ConfigurationError> {
    let text = resolve_field(schema, "text", mapping.text.as_deref(), &["text", "message"])?
        .ok_or(ConfigurationError::NoTextField)?;

    Ok(ResolvedFields {
        text,
        username: resolve_field(schema, "username", mapping.username.as_deref(), &["username"])?,
        icon_url: resolve_field(schema, "icon_url", mapping.icon_url.as_deref(), &["icon_url"])?,
        icon_emoji: resolve_field(
            schema,
            "icon_emoji",
            mapping.icon_emoji.as_deref(),
            &["icon_emoji"],
        )?,
    })
}

/// Find the field that provides `key`: the configured field if any, else the first default
/// name present in the schema.
fn resolve_field(
    schema: &Schema,
    key: &'static str,
    configured: Option<&str>,
    defaults: &[&str],
) -> Result<Option<String>, ConfigurationError> {
    let field = match configured {
        Some(name) => schema
            .field(name)
            .ok_or_else(|| ConfigurationError::UnknownField {
                key,
                field: name.to_owned(),
            })?,
        None => match defaults.iter().find_map(|name| schema.field(name)) {
            Some(field) => field,
            None => return Ok(None),
        },
    };

    if field.field_type != FieldType::String {
        return Err(ConfigurationError::FieldNotText {
            key,
            field: field.name.clone(),
            found: field.field_type,
        });
    }

    Ok(Some(field.name.clone()))
}

fn required_text<'r>(
    record: &'r Record,
    key: &'static str,
    field: &str,
) -> Result<&'r str, EncodeError> {
    match record.get(field) {
        None => Err(EncodeError::MissingValue {
            key,
            field: field.to_owned(),
        }),
        Some(value) => value.as_str().ok_or_else(|| EncodeError::NotText {
            key,
            field: field.to_owned(),
        }),
    }
}

fn optional_text(
    record: &Record,
    key: &'static str,
    field: &Option<String>,
) -> Result<Option<String>, EncodeError> {
    let Some(field) = field else {
        return Ok(None);
    };

    match record.get(field) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(|text| Some(text.to_owned()))
            .ok_or_else(|| EncodeError::NotText {
                key,
                field: field.to_owned(),
            }),
    }
}
