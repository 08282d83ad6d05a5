//! Header contract for adaptation requests.
//!
//! All request state travels in AMQP headers; bodies are empty. Required keys
//! are lifted into typed fields, everything else is carried through untouched,
//! including the original wire encoding of the required keys themselves.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;
use thiserror::Error;

pub const FILE_ID: &str = "file-id";
pub const SOURCE_FILE_LOCATION: &str = "source-file-location";
pub const REBUILT_FILE_LOCATION: &str = "rebuilt-file-location";
pub const SOURCE_PRESIGNED_URL: &str = "source-presigned-url";
pub const REPLY_TO: &str = "reply-to";

/// Why an envelope was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Missing required header {0}")]
    MissingField(&'static str),

    #[error("Malformed header {field}: {reason}")]
    MalformedField { field: &'static str, reason: String },
}

impl EnvelopeError {
    /// Name of the offending header
    pub fn field(&self) -> &'static str {
        match self {
            EnvelopeError::MissingField(field) => field,
            EnvelopeError::MalformedField { field, .. } => field,
        }
    }
}

/// A required text header, keeping the value exactly as it arrived
#[derive(Debug, Clone, PartialEq)]
struct TextHeader {
    text: String,
    wire: AMQPValue,
}

/// A validated adaptation request
#[derive(Debug, Clone, PartialEq)]
pub struct WorkRequest {
    file_id: TextHeader,
    source_file_location: TextHeader,
    rebuilt_file_location: TextHeader,
    reply_to: Option<String>,
    source_presigned_url: Option<String>,
    passthrough: BTreeMap<ShortString, AMQPValue>,
}

impl WorkRequest {
    /// Check the required headers and split off the pass-through ones.
    ///
    /// Absent or void values are `MissingField`; non-text, non-UTF-8 or empty
    /// values are `MalformedField`.
    pub fn validate(headers: &FieldTable) -> Result<Self, EnvelopeError> {
        let fields = headers.inner();

        let file_id = required_text(fields, FILE_ID)?;
        let source_file_location = required_text(fields, SOURCE_FILE_LOCATION)?;
        let rebuilt_file_location = required_text(fields, REBUILT_FILE_LOCATION)?;

        let passthrough = fields
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    FILE_ID | SOURCE_FILE_LOCATION | REBUILT_FILE_LOCATION
                )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            file_id,
            source_file_location,
            rebuilt_file_location,
            reply_to: None,
            source_presigned_url: None,
            passthrough,
        })
    }

    /// Attach the staged URL and the reply-to token.
    ///
    /// The only mutation this stage performs on a request.
    pub fn enrich(&mut self, presigned_url: impl Into<String>, reply_to: impl Into<String>) {
        self.source_presigned_url = Some(presigned_url.into());
        self.reply_to = Some(reply_to.into());
    }

    pub fn file_id(&self) -> &str {
        &self.file_id.text
    }

    pub fn source_file_location(&self) -> &str {
        &self.source_file_location.text
    }

    pub fn rebuilt_file_location(&self) -> &str {
        &self.rebuilt_file_location.text
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn source_presigned_url(&self) -> Option<&str> {
        self.source_presigned_url.as_deref()
    }

    pub fn is_enriched(&self) -> bool {
        self.source_presigned_url.is_some()
    }

    /// Encode back into an AMQP header table
    pub fn to_headers(&self) -> FieldTable {
        let mut fields = self.passthrough.clone();

        fields.insert(FILE_ID.into(), self.file_id.wire.clone());
        fields.insert(
            SOURCE_FILE_LOCATION.into(),
            self.source_file_location.wire.clone(),
        );
        fields.insert(
            REBUILT_FILE_LOCATION.into(),
            self.rebuilt_file_location.wire.clone(),
        );

        if let Some(ref url) = self.source_presigned_url {
            fields.insert(SOURCE_PRESIGNED_URL.into(), long_string(url));
        }
        if let Some(ref reply_to) = self.reply_to {
            fields.insert(REPLY_TO.into(), long_string(reply_to));
        }

        FieldTable::from(fields)
    }
}

fn required_text(
    fields: &BTreeMap<ShortString, AMQPValue>,
    name: &'static str,
) -> Result<TextHeader, EnvelopeError> {
    let wire = match fields.get(&ShortString::from(name)) {
        None | Some(AMQPValue::Void) => return Err(EnvelopeError::MissingField(name)),
        Some(value) => value,
    };

    let text = header_text(wire).map_err(|reason| EnvelopeError::MalformedField {
        field: name,
        reason,
    })?;

    if text.is_empty() {
        return Err(EnvelopeError::MalformedField {
            field: name,
            reason: "empty value".to_string(),
        });
    }

    Ok(TextHeader {
        text,
        wire: wire.clone(),
    })
}

fn header_text(value: &AMQPValue) -> Result<String, String> {
    match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .map(str::to_owned)
            .map_err(|e| format!("not valid UTF-8: {e}")),
        AMQPValue::ShortString(s) => Ok(s.as_str().to_owned()),
        other => Err(format!("expected a string, got {}", type_name(other))),
    }
}

fn type_name(value: &AMQPValue) -> &'static str {
    match value {
        AMQPValue::Boolean(_) => "boolean",
        AMQPValue::ShortShortInt(_)
        | AMQPValue::ShortShortUInt(_)
        | AMQPValue::ShortInt(_)
        | AMQPValue::ShortUInt(_)
        | AMQPValue::LongInt(_)
        | AMQPValue::LongUInt(_)
        | AMQPValue::LongLongInt(_) => "integer",
        AMQPValue::Float(_) | AMQPValue::Double(_) | AMQPValue::DecimalValue(_) => "number",
        AMQPValue::Timestamp(_) => "timestamp",
        AMQPValue::FieldArray(_) => "array",
        AMQPValue::FieldTable(_) => "table",
        AMQPValue::ByteArray(_) => "byte array",
        AMQPValue::ShortString(_) | AMQPValue::LongString(_) => "string",
        AMQPValue::Void => "void",
    }
}

fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value.to_string()))
}
