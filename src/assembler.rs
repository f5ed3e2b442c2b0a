//! Block Assembler - Fragment Lists Into Array Tails
//!
//! Separators belong to the assembler, never to fragment data: a fragment
//! gets a leading `,` exactly when its list already holds an element,
//! whether that element was authored in the template or emitted by an
//! earlier block of the same list.

use tracing::debug;

use crate::pipeline::RenderError;
use crate::resolver::PlaceholderResolver;
use crate::templates::{BlockSite, Segment, Template};
use crate::validation::parse_fragment;
use crate::values::{Fragment, Value, ValueSet};

/// Separator state of the array a run of blocks is extending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListCursor {
    pub list_id: usize,
    pub has_element: bool,
}

impl ListCursor {
    pub fn at(site: &BlockSite) -> Self {
        Self {
            list_id: site.list_id,
            has_element: site.preceded_by_element,
        }
    }
}

pub struct BlockAssembler<'a> {
    template: &'a Template,
    values: &'a ValueSet,
}

impl<'a> BlockAssembler<'a> {
    pub fn new(template: &'a Template, values: &'a ValueSet) -> Self {
        Self { template, values }
    }

    /// Joined text for one block site; empty when its list is empty.
    pub fn assemble(&self, site: &BlockSite, cursor: &mut ListCursor) -> Result<String, RenderError> {
        let slot = &site.slot;
        let fragments = match self.values.get(&slot.name) {
            Some(Value::Fragments(fragments)) => fragments,
            Some(other) => {
                return Err(RenderError::TypeMismatch {
                    name: slot.name.clone(),
                    expected: "fragment list".to_string(),
                    found: other.describe(),
                    position: slot.position,
                })
            }
            None => {
                return Err(RenderError::MissingValue {
                    name: slot.name.clone(),
                    position: slot.position,
                })
            }
        };

        let indent = " ".repeat(slot.position.column.saturating_sub(1));
        let mut out = String::new();
        for (index, fragment) in fragments.iter().enumerate() {
            let (element, open_line_comment) = self.render_fragment(site, index, fragment)?;
            if cursor.has_element {
                out.push(',');
            }
            if index > 0 {
                out.push('\n');
                out.push_str(&indent);
            }
            out.push_str(&element);
            // A trailing `//` comment would swallow whatever follows on its line.
            if open_line_comment {
                out.push('\n');
            }
            cursor.has_element = true;
        }

        debug!(block = %slot.name, fragments = fragments.len(), "assembled block");
        Ok(out)
    }

    fn render_fragment(
        &self,
        site: &BlockSite,
        index: usize,
        fragment: &Fragment,
    ) -> Result<(String, bool), RenderError> {
        let malformed = |reason: String| RenderError::MalformedFragment {
            block: site.slot.name.clone(),
            index,
            position: site.slot.position,
            reason,
        };

        let text = match fragment {
            Fragment::Literal(text) => normalize_literal(text).to_string(),
            Fragment::Bindings(bindings) => {
                let element = self
                    .template
                    .element(&site.slot.name)
                    .ok_or_else(|| malformed("block takes pre-rendered fragments only".to_string()))?;
                if let Some(unknown) = bindings.keys().find(|k| !element.placeholders.contains_key(*k)) {
                    return Err(malformed(format!("unexpected binding {}", unknown)));
                }

                let resolver = PlaceholderResolver::scoped(self.values, bindings);
                let mut text = String::new();
                for segment in &element.segments {
                    match segment {
                        Segment::Text(t) => text.push_str(t),
                        Segment::Scalar(slot) => {
                            let spec = element
                                .placeholders
                                .get(&slot.name)
                                .ok_or_else(|| malformed(format!("undeclared placeholder {}", slot.name)))?;
                            let literal = resolver
                                .resolve(&slot.name, spec)
                                .map_err(|e| malformed(e.to_string()))?;
                            text.push_str(&literal);
                        }
                        Segment::Block(inner) => {
                            return Err(malformed(format!("nested block {}", inner.slot.name)))
                        }
                    }
                }
                text
            }
        };

        let parsed = parse_fragment(&text).map_err(|v| malformed(v.to_string()))?;
        Ok((text, parsed.open_line_comment))
    }
}

/// Trim a pre-rendered fragment and drop a baked-in leading separator.
fn normalize_literal(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix(',')
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{BlockSpec, PlaceholderSchema, PlaceholderSpec};

    fn list_template() -> Template {
        let schema = PlaceholderSchema {
            id: "list".to_string(),
            name: String::new(),
            template_version: "1.0.0".to_string(),
            engine_min_version: "1.0.0".to_string(),
            placeholders: [("B".to_string(), PlaceholderSpec::Block(BlockSpec::default()))].into(),
        };
        Template::parse("{ items: [\n  ${B}\n] }", schema).unwrap()
    }

    fn site(template: &Template) -> BlockSite {
        template
            .segments()
            .iter()
            .find_map(|s| match s {
                Segment::Block(site) => Some(site.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_empty_list_emits_nothing() {
        let template = list_template();
        let values = ValueSet::new().with("B", Vec::<Fragment>::new());
        let site = site(&template);
        let mut cursor = ListCursor::at(&site);

        let out = BlockAssembler::new(&template, &values).assemble(&site, &mut cursor).unwrap();
        assert_eq!(out, "");
        assert!(!cursor.has_element);
    }

    #[test]
    fn test_first_position_has_no_separator() {
        let template = list_template();
        let values = ValueSet::new().with("B", vec![Fragment::literal("1"), Fragment::literal("2")]);
        let site = site(&template);
        let mut cursor = ListCursor::at(&site);

        let out = BlockAssembler::new(&template, &values).assemble(&site, &mut cursor).unwrap();
        assert_eq!(out, "1,\n  2");
        assert!(cursor.has_element);
    }

    #[test]
    fn test_later_position_gets_separator() {
        let template = list_template();
        let values = ValueSet::new().with("B", vec![Fragment::literal("3")]);
        let site = site(&template);
        let mut cursor = ListCursor { list_id: site.list_id, has_element: true };

        let out = BlockAssembler::new(&template, &values).assemble(&site, &mut cursor).unwrap();
        assert_eq!(out, ",3");
    }

    #[test]
    fn test_legacy_leading_comma_normalized() {
        let template = list_template();
        let values = ValueSet::new().with("B", vec![Fragment::literal("  ,{ module: \"x\" }\n")]);
        let site = site(&template);
        let mut cursor = ListCursor::at(&site);

        let out = BlockAssembler::new(&template, &values).assemble(&site, &mut cursor).unwrap();
        assert_eq!(out, "{ module: \"x\" }");
    }

    #[test]
    fn test_trailing_line_comment_keeps_separator_live() {
        let template = list_template();
        let values = ValueSet::new().with(
            "B",
            vec![
                Fragment::literal("{ module: \"a\" } // note"),
                Fragment::literal("{ module: \"b\" }"),
            ],
        );
        let site = site(&template);
        let mut cursor = ListCursor::at(&site);

        let out = BlockAssembler::new(&template, &values).assemble(&site, &mut cursor).unwrap();
        assert_eq!(out, "{ module: \"a\" } // note\n,\n  { module: \"b\" }");

        let text = format!("{{ items: [\n  {}\n] }}", out);
        let document = crate::validation::parse_document(&text).unwrap();
        assert_eq!(document.root["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_bindings_without_element_template() {
        let template = list_template();
        let values = ValueSet::new().with("B", vec![Fragment::bindings([("url", "X")])]);
        let site = site(&template);
        let mut cursor = ListCursor::at(&site);

        let err = BlockAssembler::new(&template, &values)
            .assemble(&site, &mut cursor)
            .unwrap_err();
        assert!(matches!(err, RenderError::MalformedFragment { index: 0, .. }));
    }

    #[test]
    fn test_literal_must_be_one_element() {
        let template = list_template();
        let site = site(&template);
        for bad in ["{ a: 1 },", "{ a: 1 }, { b: 2 }", "{ a: ", ""] {
            let values = ValueSet::new().with("B", vec![Fragment::literal(bad)]);
            let mut cursor = ListCursor::at(&site);
            let err = BlockAssembler::new(&template, &values)
                .assemble(&site, &mut cursor)
                .unwrap_err();
            assert!(matches!(err, RenderError::MalformedFragment { .. }), "accepted: {bad:?}");
        }
    }

    #[test]
    fn test_scalar_in_block_slot() {
        let template = list_template();
        let values = ValueSet::new().with("B", "");
        let site = site(&template);
        let mut cursor = ListCursor::at(&site);

        let err = BlockAssembler::new(&template, &values)
            .assemble(&site, &mut cursor)
            .unwrap_err();
        assert!(matches!(err, RenderError::TypeMismatch { ref name, .. } if name == "B"));
    }
}
