//! Compact tokens for inline keyboard callback payloads.
//!
//! A token is `prefix` followed by one value per declared field, joined by a
//! separator (`:` unless configured otherwise). Telegram caps callback data at
//! 64 bytes, so encoding fails past that length.

use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;

/// Maximum encoded size accepted by Telegram for `callback_data`.
pub const MAX_CALLBACK_DATA_BYTES: usize = 64;
pub const DEFAULT_SEPARATOR: char = ':';
/// Key under which [`CallbackData::parse`] reports the prefix.
pub const PREFIX_KEY: &str = "@";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallbackDataError {
    #[error("callback data prefix can't be empty")]
    EmptyPrefix,
    #[error("separator {separator:?} can't be used in prefix or field names")]
    SeparatorInDefinition { separator: char },
    #[error("field {0:?} is declared twice")]
    DuplicateField(String),
    #[error("value for {0:?} was not passed")]
    MissingValue(String),
    #[error("value for {0:?} was passed more than once")]
    RepeatedValue(String),
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("value for {field:?} contains the separator {separator:?}")]
    SeparatorInValue { field: String, separator: char },
    #[error("encoded callback data is {0} bytes, limit is 64")]
    TooLong(usize),
    #[error("callback data {0:?} has a different prefix")]
    PrefixMismatch(String),
    #[error("callback data has {found} fields, expected {expected}")]
    FieldCount { expected: usize, found: usize },
}

/// Token schema: a prefix plus ordered field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackData {
    prefix: String,
    separator: char,
    fields: Arc<[String]>,
}

impl CallbackData {
    pub fn new<I, S>(prefix: impl Into<String>, fields: I) -> Result<Self, CallbackDataError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_separator(prefix, fields, DEFAULT_SEPARATOR)
    }

    pub fn with_separator<I, S>(
        prefix: impl Into<String>,
        fields: I,
        separator: char,
    ) -> Result<Self, CallbackDataError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(CallbackDataError::EmptyPrefix);
        }
        if prefix.contains(separator) {
            return Err(CallbackDataError::SeparatorInDefinition { separator });
        }
        let mut declared: Vec<String> = Vec::new();
        for field in fields {
            let field = field.into();
            if field.contains(separator) {
                return Err(CallbackDataError::SeparatorInDefinition { separator });
            }
            if declared.contains(&field) {
                return Err(CallbackDataError::DuplicateField(field));
            }
            declared.push(field);
        }
        Ok(Self {
            prefix,
            separator,
            fields: declared.into(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Builds a token from named values. Every declared field must be given
    /// exactly once; values are stringified with `ToString`.
    pub fn encode<I, K, V>(&self, values: I) -> Result<String, CallbackDataError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: ToString,
    {
        let mut supplied: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in values {
            let name = name.as_ref();
            if !self.fields.iter().any(|field| field == name) {
                return Err(CallbackDataError::UnknownField(name.to_string()));
            }
            if supplied.insert(name.to_string(), value.to_string()).is_some() {
                return Err(CallbackDataError::RepeatedValue(name.to_string()));
            }
        }

        let mut token = self.prefix.clone();
        for field in self.fields.iter() {
            let value = supplied
                .remove(field)
                .ok_or_else(|| CallbackDataError::MissingValue(field.clone()))?;
            if value.contains(self.separator) {
                return Err(CallbackDataError::SeparatorInValue {
                    field: field.clone(),
                    separator: self.separator,
                });
            }
            token.push(self.separator);
            token.push_str(&value);
        }

        if token.len() > MAX_CALLBACK_DATA_BYTES {
            return Err(CallbackDataError::TooLong(token.len()));
        }
        Ok(token)
    }

    /// Splits a token back into its fields, plus `"@"` mapped to the prefix.
    pub fn parse(&self, token: &str) -> Result<BTreeMap<String, String>, CallbackDataError> {
        let mut parts = token.split(self.separator);
        let prefix = parts.next().unwrap_or_default();
        if prefix != self.prefix {
            return Err(CallbackDataError::PrefixMismatch(token.to_string()));
        }
        let values: Vec<&str> = parts.collect();
        if values.len() != self.fields.len() {
            return Err(CallbackDataError::FieldCount {
                expected: self.fields.len(),
                found: values.len(),
            });
        }

        let mut parsed = BTreeMap::new();
        parsed.insert(PREFIX_KEY.to_string(), prefix.to_string());
        for (field, value) in self.fields.iter().zip(values) {
            parsed.insert(field.clone(), value.to_string());
        }
        Ok(parsed)
    }

    /// Starts a filter that accepts any token of this schema.
    pub fn filter(&self) -> CallbackDataFilter {
        CallbackDataFilter {
            schema: self.clone(),
            constraints: BTreeMap::new(),
        }
    }
}

/// Matches tokens that parse under a schema and satisfy every constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackDataFilter {
    schema: CallbackData,
    constraints: BTreeMap<String, Vec<String>>,
}

impl CallbackDataFilter {
    /// Requires `field` to equal `value`.
    pub fn with(self, field: &str, value: impl ToString) -> Result<Self, CallbackDataError> {
        self.with_any(field, [value])
    }

    /// Requires `field` to be one of `values`.
    pub fn with_any<I, V>(mut self, field: &str, values: I) -> Result<Self, CallbackDataError>
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        if !self.schema.fields.iter().any(|declared| declared == field) {
            return Err(CallbackDataError::UnknownField(field.to_string()));
        }
        self.constraints.insert(
            field.to_string(),
            values.into_iter().map(|value| value.to_string()).collect(),
        );
        Ok(self)
    }

    pub fn check(&self, token: &str) -> bool {
        let Ok(parsed) = self.schema.parse(token) else {
            return false;
        };
        self.constraints.iter().all(|(field, allowed)| {
            parsed
                .get(field)
                .is_some_and(|value| allowed.iter().any(|candidate| candidate == value))
        })
    }
}
