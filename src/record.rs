//! Single-customer input records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Feature columns of the Telco customer schema, in the order the source CSV lists them.
pub const TELCO_FEATURE_COLUMNS: [&str; 19] = [
    "gender",
    "SeniorCitizen",
    "Partner",
    "Dependents",
    "tenure",
    "PhoneService",
    "MultipleLines",
    "InternetService",
    "OnlineSecurity",
    "OnlineBackup",
    "DeviceProtection",
    "TechSupport",
    "StreamingTV",
    "StreamingMovies",
    "Contract",
    "PaperlessBilling",
    "PaymentMethod",
    "MonthlyCharges",
    "TotalCharges",
];

/// Default name of the label column.
pub const DEFAULT_TARGET: &str = "Churn";

/// One raw attribute value as supplied by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
    Missing,
}

impl FieldValue {
    /// Numeric view; text is parsed after trimming, anything unparseable is missing.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) if v.is_finite() => Some(*v),
            FieldValue::Number(_) => None,
            FieldValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            FieldValue::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Missing => None,
        }
    }

    /// Numeric view for scoring. Missing, blank and non-finite values are
    /// `Ok(None)`; text that does not parse is returned as the error.
    pub fn try_number(&self) -> Result<Option<f64>, String> {
        match self {
            FieldValue::Text(s) if !s.trim().is_empty() && self.as_number().is_none() => {
                Err(s.clone())
            }
            _ => Ok(self.as_number()),
        }
    }

    /// Category view. Whole numbers render without a fractional part so that
    /// `1` and `"1"` land on the same category.
    pub fn as_category(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(v) if v.is_finite() && v.fract() == 0.0 => {
                Some(format!("{}", *v as i64))
            }
            FieldValue::Number(v) if v.is_finite() => Some(v.to_string()),
            FieldValue::Number(_) => None,
            FieldValue::Flag(b) => Some(b.to_string()),
            FieldValue::Missing => None,
        }
    }

    /// Parse a command-line token: numbers become `Number`, an empty token is `Missing`.
    pub fn parse_token(token: &str) -> Self {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return FieldValue::Missing;
        }
        match trimmed.parse::<f64>() {
            Ok(v) => FieldValue::Number(v),
            Err(_) => FieldValue::Text(token.to_string()),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Number(v as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Flag(b) => write!(f, "{}", b),
            FieldValue::Number(v) => write!(f, "{}", v),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Missing => write!(f, "<missing>"),
        }
    }
}

/// One customer's attributes keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerRecord {
    fields: BTreeMap<String, FieldValue>,
}

impl CustomerRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parse a JSON object of `field -> value`.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let record: CustomerRecord = serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("Invalid record JSON: {}", e))?;
        Ok(record)
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for CustomerRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = CustomerRecord::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}
