//! Value Set - Bindings Supplied For One Render
//!
//! Scalars fill scalar slots. Fragment lists fill block slots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::templates::{PlaceholderSchema, PlaceholderSpec, ScalarKind};

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("Invalid {expected} literal for {name}: {raw:?}")]
    InvalidLiteral {
        name: String,
        expected: String,
        raw: String,
    },

    #[error("Invalid fragment list for {name}: {source}")]
    InvalidFragments {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Value set parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid override {raw:?}: expected NAME=VALUE")]
    InvalidOverride { raw: String },

    #[error("Invalid override {raw:?}: {name} is not a declared placeholder")]
    UndeclaredOverride { raw: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Boolean(bool),
    Number(serde_json::Number),
    String(String),
}

impl Scalar {
    pub fn kind(&self) -> ScalarKind {
        match self {
            Scalar::Boolean(_) => ScalarKind::Boolean,
            Scalar::Number(_) => ScalarKind::Number,
            Scalar::String(_) => ScalarKind::String,
        }
    }

    /// Finite floats only; NaN and infinities have no literal form.
    pub fn from_f64(value: f64) -> Option<Self> {
        serde_json::Number::from_f64(value).map(Scalar::Number)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Boolean(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value.into())
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Scalar::Number(value.into())
    }
}

/// One element destined for a block slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Fragment {
    /// Pre-rendered element text
    Literal(String),
    /// Inputs for the block's element template
    Bindings(BTreeMap<String, Scalar>),
}

impl Fragment {
    pub fn literal(text: impl Into<String>) -> Self {
        Fragment::Literal(text.into())
    }

    pub fn bindings<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Scalar>,
    {
        Fragment::Bindings(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(Scalar),
    Fragments(Vec<Fragment>),
}

impl Value {
    pub fn describe(&self) -> String {
        match self {
            Value::Scalar(s) => s.kind().to_string(),
            Value::Fragments(_) => "fragment list".to_string(),
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Scalar(value.into())
    }
}

impl From<Vec<Fragment>> for Value {
    fn from(fragments: Vec<Fragment>) -> Self {
        Value::Fragments(fragments)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueSet {
    values: BTreeMap<String, Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ValueError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse `NAME=text` style bindings (environment, `--set`) against a schema.
    ///
    /// Names the schema does not declare are skipped, so a whole process
    /// environment can be passed in.
    pub fn from_text_bindings<I, K, V>(
        pairs: I,
        schema: &PlaceholderSchema,
    ) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut set = Self::new();
        for (name, raw) in pairs {
            let (name, raw) = (name.as_ref(), raw.as_ref());
            let Some(spec) = schema.placeholders.get(name) else {
                continue;
            };
            let value = match spec {
                PlaceholderSpec::Scalar(scalar) => {
                    Value::Scalar(parse_scalar(name, scalar.kind, raw)?)
                }
                PlaceholderSpec::Block(_) => Value::Fragments(parse_fragments(name, raw)?),
            };
            set.values.insert(name.to_string(), value);
        }
        Ok(set)
    }

    /// Declared placeholders from a process environment.
    ///
    /// Variables whose name is not UTF-8 cannot be placeholders and are
    /// skipped. A declared variable whose value is not UTF-8 is an error.
    pub fn from_env_vars<I>(vars: I, schema: &PlaceholderSchema) -> Result<Self, ValueError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut pairs = vec![];
        for (name, raw) in vars {
            let Ok(name) = name.into_string() else {
                continue;
            };
            if !schema.placeholders.contains_key(&name) {
                continue;
            }
            let raw = raw.into_string().map_err(|raw| ValueError::InvalidLiteral {
                name: name.clone(),
                expected: "UTF-8".to_string(),
                raw: raw.to_string_lossy().into_owned(),
            })?;
            pairs.push((name, raw));
        }
        Self::from_text_bindings(pairs, schema)
    }

    /// `NAME=VALUE` overrides. Unlike the environment, every name must be declared.
    pub fn from_overrides<S: AsRef<str>>(
        overrides: &[S],
        schema: &PlaceholderSchema,
    ) -> Result<Self, ValueError> {
        let mut pairs = vec![];
        for raw in overrides {
            let raw = raw.as_ref();
            let (name, value) = raw
                .split_once('=')
                .ok_or_else(|| ValueError::InvalidOverride { raw: raw.to_string() })?;
            if !schema.placeholders.contains_key(name) {
                return Err(ValueError::UndeclaredOverride {
                    raw: raw.to_string(),
                    name: name.to_string(),
                });
            }
            pairs.push((name, value));
        }
        Self::from_text_bindings(pairs, schema)
    }

    /// Merge value sources in order: JSON file, environment, overrides.
    /// Later sources win.
    pub fn collect<E, S>(
        schema: &PlaceholderSchema,
        values_file: Option<&Path>,
        env: Option<E>,
        overrides: &[S],
    ) -> Result<Self, ValueError>
    where
        E: IntoIterator<Item = (OsString, OsString)>,
        S: AsRef<str>,
    {
        let mut values = Self::new();

        if let Some(path) = values_file {
            let json = fs::read_to_string(path).map_err(|source| ValueError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            values.merge(Self::from_json_str(&json)?);
        }
        if let Some(vars) = env {
            values.merge(Self::from_env_vars(vars, schema)?);
        }
        values.merge(Self::from_overrides(overrides, schema)?);

        Ok(values)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Overlay `other`; its bindings win.
    pub fn merge(&mut self, other: ValueSet) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

fn parse_scalar(name: &str, kind: ScalarKind, raw: &str) -> Result<Scalar, ValueError> {
    let invalid = || ValueError::InvalidLiteral {
        name: name.to_string(),
        expected: kind.to_string(),
        raw: raw.to_string(),
    };

    match kind {
        ScalarKind::String => Ok(Scalar::String(raw.to_string())),
        ScalarKind::Number => serde_json::from_str::<serde_json::Number>(raw.trim())
            .map(Scalar::Number)
            .map_err(|_| invalid()),
        ScalarKind::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Scalar::Boolean(true)),
            "false" | "no" | "n" | "0" => Ok(Scalar::Boolean(false)),
            _ => Err(invalid()),
        },
    }
}

fn parse_fragments(name: &str, raw: &str) -> Result<Vec<Fragment>, ValueError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(vec![]);
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(|source| ValueError::InvalidFragments {
            name: name.to_string(),
            source,
        });
    }
    Ok(vec![Fragment::Literal(raw.to_string())])
}
