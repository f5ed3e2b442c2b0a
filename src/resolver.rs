//! Placeholder Resolver - Scalar Slots To Literals
//!
//! The expected kind of every slot comes from the schema; values are
//! never coerced between kinds.

use std::collections::BTreeMap;
use thiserror::Error;

use crate::templates::ScalarSpec;
use crate::values::{Scalar, Value, ValueSet};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no value for {name}")]
    Missing { name: String },

    #[error("{name} expects {expected}, got {found}")]
    Mismatch {
        name: String,
        expected: String,
        found: String,
    },
}

pub struct PlaceholderResolver<'a> {
    values: &'a ValueSet,
    bindings: Option<&'a BTreeMap<String, Scalar>>,
}

impl<'a> PlaceholderResolver<'a> {
    pub fn new(values: &'a ValueSet) -> Self {
        Self { values, bindings: None }
    }

    /// Resolver for one fragment: its own bindings shadow the value set.
    pub fn scoped(values: &'a ValueSet, bindings: &'a BTreeMap<String, Scalar>) -> Self {
        Self {
            values,
            bindings: Some(bindings),
        }
    }

    /// Literal text for `name`, quoted for its kind.
    pub fn resolve(&self, name: &str, spec: &ScalarSpec) -> Result<String, ResolveError> {
        let scalar = self.lookup(name, spec)?;
        check_kind(name, scalar, spec)?;
        Ok(literal(scalar))
    }

    fn lookup<'s>(&'s self, name: &str, spec: &'s ScalarSpec) -> Result<&'s Scalar, ResolveError> {
        if let Some(scalar) = self.bindings.and_then(|b| b.get(name)) {
            return Ok(scalar);
        }
        match self.values.get(name) {
            Some(Value::Scalar(scalar)) => Ok(scalar),
            Some(other @ Value::Fragments(_)) => Err(ResolveError::Mismatch {
                name: name.to_string(),
                expected: spec.kind.to_string(),
                found: other.describe(),
            }),
            None => spec.default.as_ref().ok_or_else(|| ResolveError::Missing {
                name: name.to_string(),
            }),
        }
    }
}

fn check_kind(name: &str, scalar: &Scalar, spec: &ScalarSpec) -> Result<(), ResolveError> {
    if scalar.kind() != spec.kind {
        return Err(ResolveError::Mismatch {
            name: name.to_string(),
            expected: spec.kind.to_string(),
            found: scalar.kind().to_string(),
        });
    }
    if let Scalar::String(s) = scalar {
        if !spec.one_of.is_empty() && !spec.one_of.iter().any(|allowed| allowed == s) {
            let allowed: Vec<String> = spec.one_of.iter().map(|a| format!("{:?}", a)).collect();
            return Err(ResolveError::Mismatch {
                name: name.to_string(),
                expected: format!("one of {}", allowed.join(", ")),
                found: format!("{:?}", s),
            });
        }
    }
    Ok(())
}

/// Document literal for a scalar.
pub fn literal(scalar: &Scalar) -> String {
    match scalar {
        Scalar::String(s) => quote_string(s),
        Scalar::Number(n) => n.to_string(),
        Scalar::Boolean(b) => b.to_string(),
    }
}

/// Double-quoted string literal safe to splice into the document.
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // U+2028/U+2029 are line terminators inside JS string literals
            c if c.is_control() || c == '\u{2028}' || c == '\u{2029}' => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::ScalarKind;
    use crate::validation::parse_element;
    use crate::values::Fragment;
    use serde_json::json;

    fn spec(kind: ScalarKind) -> ScalarSpec {
        ScalarSpec::new(kind)
    }

    #[test]
    fn test_kinds_render_unquoted_or_quoted() {
        let values = ValueSet::new()
            .with("PORT", 8080i64)
            .with("ADDRESS", "localhost")
            .with("HTTPS", false);
        let resolver = PlaceholderResolver::new(&values);

        assert_eq!(resolver.resolve("PORT", &spec(ScalarKind::Number)).unwrap(), "8080");
        assert_eq!(
            resolver.resolve("ADDRESS", &spec(ScalarKind::String)).unwrap(),
            "\"localhost\""
        );
        assert_eq!(resolver.resolve("HTTPS", &spec(ScalarKind::Boolean)).unwrap(), "false");
    }

    #[test]
    fn test_missing_value() {
        let values = ValueSet::new();
        let err = PlaceholderResolver::new(&values)
            .resolve("PORT", &spec(ScalarKind::Number))
            .unwrap_err();
        assert_eq!(err, ResolveError::Missing { name: "PORT".to_string() });
    }

    #[test]
    fn test_no_coercion_between_kinds() {
        let values = ValueSet::new().with("PORT", "8080");
        let err = PlaceholderResolver::new(&values)
            .resolve("PORT", &spec(ScalarKind::Number))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Mismatch { ref found, .. } if found == "string"));
    }

    #[test]
    fn test_fragment_list_in_scalar_slot() {
        let values = ValueSet::new().with("ADDRESS", Vec::<Fragment>::new());
        let err = PlaceholderResolver::new(&values)
            .resolve("ADDRESS", &spec(ScalarKind::String))
            .unwrap_err();
        assert!(matches!(err, ResolveError::Mismatch { ref found, .. } if found == "fragment list"));
    }

    #[test]
    fn test_one_of_enforced() {
        let mut mode = spec(ScalarKind::String);
        mode.one_of = vec!["currentMonth".to_string(), "fourWeeks".to_string()];

        let ok = ValueSet::new().with("MODE", "fourWeeks");
        assert_eq!(PlaceholderResolver::new(&ok).resolve("MODE", &mode).unwrap(), "\"fourWeeks\"");

        let bad = ValueSet::new().with("MODE", "week");
        let err = PlaceholderResolver::new(&bad).resolve("MODE", &mode).unwrap_err();
        assert!(err.to_string().contains("one of \"currentMonth\", \"fourWeeks\""));
    }

    #[test]
    fn test_bindings_shadow_values_then_default() {
        let mut color = spec(ScalarKind::String);
        color.default = Some(Scalar::from("#ffffff"));
        let values = ValueSet::new().with("name", "Global");
        let bindings: BTreeMap<String, Scalar> = [("name".to_string(), Scalar::from("Home"))].into();
        let resolver = PlaceholderResolver::scoped(&values, &bindings);

        assert_eq!(resolver.resolve("name", &spec(ScalarKind::String)).unwrap(), "\"Home\"");
        assert_eq!(resolver.resolve("color", &color).unwrap(), "\"#ffffff\"");
    }

    #[test]
    fn test_quoting_survives_reparse() {
        for raw in [
            r#"O'Brien's "Calendar""#,
            "back\\slash",
            "line\nbreak\ttab",
            "bell\u{7}",
            "sep\u{2028}arator",
            "",
        ] {
            let quoted = quote_string(raw);
            assert_eq!(parse_element(&quoted).unwrap(), json!(raw), "{quoted}");
        }
    }
}
