//! Template System - Enforceable Contracts
//!
//! A template is only accepted together with the schema that declares
//! every placeholder it references. Compilation checks placement rules up
//! front so rendering never has to guess what a placeholder is.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::values::Scalar;

pub type TemplateId = String;

const DASHBOARD_TEMPLATE: &str = include_str!("../templates/dashboard.template.js");
const DASHBOARD_SCHEMA: &str = include_str!("../templates/dashboard.schema.json");

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema parse error: {0}")]
    SchemaParse(#[from] serde_json::Error),

    #[error("Invalid schema entry {name}: {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("Malformed placeholder at {position}: {reason}")]
    MalformedPlaceholder { position: Position, reason: String },

    #[error("Placeholder {name} at {position} is not declared by the schema")]
    UndeclaredPlaceholder { name: String, position: Position },

    #[error("Placeholder {name} at {position} sits inside a string literal")]
    PlaceholderInString { name: String, position: Position },

    #[error("Block {name} at {position} must be the tail of an array")]
    BlockOutsideListTail { name: String, position: Position },

    #[error("Block {name} at {position} follows an authored separator")]
    SeparatorBeforeBlock { name: String, position: Position },

    #[error("Element template of {block}: {source}")]
    Element {
        block: String,
        #[source]
        source: Box<TemplateError>,
    },
}

/// 1-based line and column inside a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    String,
    Number,
    Boolean,
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::String => "string",
            ScalarKind::Number => "number",
            ScalarKind::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarSpec {
    pub kind: ScalarKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScalarSpec {
    pub fn new(kind: ScalarKind) -> Self {
        Self {
            kind,
            one_of: vec![],
            default: None,
            description: None,
        }
    }

    pub fn required(&self) -> bool {
        self.default.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementSpec {
    pub template: String,
    #[serde(default)]
    pub placeholders: BTreeMap<String, ScalarSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "slot", rename_all = "lowercase")]
pub enum PlaceholderSpec {
    Scalar(ScalarSpec),
    Block(BlockSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderSchema {
    pub id: TemplateId,
    #[serde(default)]
    pub name: String,
    pub template_version: String,
    pub engine_min_version: String,
    #[serde(default)]
    pub placeholders: BTreeMap<String, PlaceholderSpec>,
}

impl PlaceholderSchema {
    pub fn from_json_str(json: &str) -> Result<Self, TemplateError> {
        let schema: Self = serde_json::from_str(json)?;
        schema.check_defaults()?;
        Ok(schema)
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarSpec> {
        match self.placeholders.get(name) {
            Some(PlaceholderSpec::Scalar(spec)) => Some(spec),
            _ => None,
        }
    }

    pub fn block(&self, name: &str) -> Option<&BlockSpec> {
        match self.placeholders.get(name) {
            Some(PlaceholderSpec::Block(spec)) => Some(spec),
            _ => None,
        }
    }

    fn check_defaults(&self) -> Result<(), TemplateError> {
        for (name, spec) in &self.placeholders {
            match spec {
                PlaceholderSpec::Scalar(scalar) => check_default(name, scalar)?,
                PlaceholderSpec::Block(block) => {
                    if let Some(element) = &block.element {
                        for (inner, scalar) in &element.placeholders {
                            check_default(&format!("{}.{}", name, inner), scalar)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_default(name: &str, spec: &ScalarSpec) -> Result<(), TemplateError> {
    if let Some(default) = &spec.default {
        if default.kind() != spec.kind {
            return Err(TemplateError::InvalidSchema {
                name: name.to_string(),
                reason: format!("default is a {}, slot expects a {}", default.kind(), spec.kind),
            });
        }
    }
    Ok(())
}

/// A placeholder occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRef {
    pub name: String,
    pub position: Position,
}

/// A block placeholder occurrence and the list it extends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSite {
    pub slot: SlotRef,
    /// Identity of the enclosing array; consecutive blocks share it
    pub list_id: usize,
    /// The array already holds an authored element before this site
    pub preceded_by_element: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Scalar(SlotRef),
    Block(BlockSite),
}

/// Compiled element template of a multiplicity block.
#[derive(Debug, Clone)]
pub struct ElementTemplate {
    pub segments: Vec<Segment>,
    pub placeholders: BTreeMap<String, ScalarSpec>,
}

#[derive(Debug, Clone)]
pub struct Template {
    schema: PlaceholderSchema,
    segments: Vec<Segment>,
    elements: BTreeMap<String, ElementTemplate>,
}

impl Template {
    pub fn parse(source: &str, schema: PlaceholderSchema) -> Result<Self, TemplateError> {
        schema.check_defaults()?;

        let segments = compile(source, |name| {
            schema.placeholders.get(name).map(|spec| match spec {
                PlaceholderSpec::Scalar(_) => SlotKind::Scalar,
                PlaceholderSpec::Block(_) => SlotKind::Block,
            })
        })?;

        let mut elements = BTreeMap::new();
        for (name, spec) in &schema.placeholders {
            let PlaceholderSpec::Block(BlockSpec { element: Some(element), .. }) = spec else {
                continue;
            };
            let segments = compile(&element.template, |inner| {
                element.placeholders.get(inner).map(|_| SlotKind::Scalar)
            })
            .map_err(|source| TemplateError::Element {
                block: name.clone(),
                source: Box::new(source),
            })?;
            elements.insert(
                name.clone(),
                ElementTemplate {
                    segments,
                    placeholders: element.placeholders.clone(),
                },
            );
        }

        Ok(Self { schema, segments, elements })
    }

    /// The built-in Home DashCalendar contract.
    pub fn dashboard() -> Result<Self, TemplateError> {
        let schema = PlaceholderSchema::from_json_str(DASHBOARD_SCHEMA)?;
        Self::parse(DASHBOARD_TEMPLATE, schema)
    }

    pub fn load(template_path: &Path, schema_path: &Path) -> Result<Self, TemplateError> {
        let source = read(template_path)?;
        let schema = PlaceholderSchema::from_json_str(&read(schema_path)?)?;
        Self::parse(&source, schema)
    }

    pub fn id(&self) -> &str {
        &self.schema.id
    }

    pub fn version(&self) -> &str {
        &self.schema.template_version
    }

    pub fn schema(&self) -> &PlaceholderSchema {
        &self.schema
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn element(&self, block: &str) -> Option<&ElementTemplate> {
        self.elements.get(block)
    }

    /// Placeholder names in first-reference order.
    pub fn referenced(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![];
        for segment in &self.segments {
            let name = match segment {
                Segment::Text(_) => continue,
                Segment::Scalar(slot) => slot.name.as_str(),
                Segment::Block(site) => site.slot.name.as_str(),
            };
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// Referenced placeholders a value set must bind (no schema default).
    pub fn required(&self) -> Vec<&str> {
        self.referenced()
            .into_iter()
            .filter(|name| self.schema.scalar(name).map_or(true, ScalarSpec::required))
            .collect()
    }
}

fn read(path: &Path) -> Result<String, TemplateError> {
    fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Scalar,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    LineComment,
    BlockComment,
    Str(char),
}

struct Frame {
    open: char,
    list_id: usize,
    has_element: bool,
    after_separator: bool,
}

impl Frame {
    fn mark_element(&mut self) {
        self.has_element = true;
        self.after_separator = false;
    }
}

fn mark_top(frames: &mut [Frame]) {
    if let Some(top) = frames.last_mut() {
        top.mark_element();
    }
}

/// Split template text into segments, tracking enough of the document
/// grammar to place every block site.
fn compile<F>(text: &str, lookup: F) -> Result<Vec<Segment>, TemplateError>
where
    F: Fn(&str) -> Option<SlotKind>,
{
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut segments = vec![];
    let mut frames: Vec<Frame> = vec![];
    let mut next_list_id = 0;
    // First block of the current run, waiting for its closing `]`
    let mut pending: Option<SlotRef> = None;
    let mut literal_start = 0;
    let mut state = Lex::Code;
    let (mut line, mut column) = (1, 1);
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|&(_, n)| n);
        let mut step = 1;

        match state {
            Lex::LineComment => {
                if c == '\n' {
                    state = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = Lex::Code;
                    step = 2;
                }
            }
            Lex::Str(quote) => {
                if c == '\\' {
                    step = 2;
                } else if c == '$' && next == Some('{') {
                    let name = placeholder_name(text, offset).unwrap_or_default();
                    return Err(TemplateError::PlaceholderInString {
                        name: name.to_string(),
                        position: Position { line, column },
                    });
                } else if c == quote || c == '\n' {
                    state = Lex::Code;
                }
            }
            Lex::Code => match c {
                '/' if next == Some('/') => {
                    state = Lex::LineComment;
                    step = 2;
                }
                '/' if next == Some('*') => {
                    state = Lex::BlockComment;
                    step = 2;
                }
                '$' if next == Some('{') => {
                    let position = Position { line, column };
                    let name = placeholder_name(text, offset).ok_or_else(|| {
                        TemplateError::MalformedPlaceholder {
                            position,
                            reason: "expected ${NAME}".to_string(),
                        }
                    })?;
                    let slot = SlotRef {
                        name: name.to_string(),
                        position,
                    };
                    let kind = lookup(name).ok_or_else(|| TemplateError::UndeclaredPlaceholder {
                        name: name.to_string(),
                        position,
                    })?;

                    if offset > literal_start {
                        segments.push(Segment::Text(text[literal_start..offset].to_string()));
                    }

                    match kind {
                        SlotKind::Scalar => {
                            if let Some(block) = pending.take() {
                                return Err(TemplateError::BlockOutsideListTail {
                                    name: block.name,
                                    position: block.position,
                                });
                            }
                            mark_top(&mut frames);
                            segments.push(Segment::Scalar(slot));
                        }
                        SlotKind::Block => {
                            let site = match frames.last() {
                                Some(top) if top.open == '[' => {
                                    if top.after_separator {
                                        return Err(TemplateError::SeparatorBeforeBlock {
                                            name: slot.name,
                                            position,
                                        });
                                    }
                                    BlockSite {
                                        list_id: top.list_id,
                                        preceded_by_element: top.has_element,
                                        slot,
                                    }
                                }
                                _ => {
                                    return Err(TemplateError::BlockOutsideListTail {
                                        name: slot.name,
                                        position,
                                    })
                                }
                            };
                            if pending.is_none() {
                                pending = Some(site.slot.clone());
                            }
                            segments.push(Segment::Block(site));
                        }
                    }

                    // `${` + name + `}`, all on one line
                    let width = name.chars().count() + 3;
                    literal_start = offset + name.len() + 3;
                    i += width;
                    column += width;
                    continue;
                }
                c if c.is_whitespace() => {}
                c => {
                    if let Some(block) = pending.take() {
                        if c != ']' {
                            return Err(TemplateError::BlockOutsideListTail {
                                name: block.name,
                                position: block.position,
                            });
                        }
                    }
                    match c {
                        '[' | '{' | '(' => {
                            mark_top(&mut frames);
                            frames.push(Frame {
                                open: c,
                                list_id: next_list_id,
                                has_element: false,
                                after_separator: false,
                            });
                            next_list_id += 1;
                        }
                        ']' | '}' | ')' => {
                            // Unbalanced text is left for the document check.
                            if frames.last().is_some_and(|top| closes(top.open, c)) {
                                frames.pop();
                            }
                        }
                        ',' => {
                            if let Some(top) = frames.last_mut() {
                                top.after_separator = true;
                            }
                        }
                        '"' | '\'' => {
                            mark_top(&mut frames);
                            state = Lex::Str(c);
                        }
                        _ => mark_top(&mut frames),
                    }
                }
            },
        }

        for &(_, consumed) in chars.iter().skip(i).take(step) {
            if consumed == '\n' {
                line += 1;
                column = 1;
            } else {
                column += 1;
            }
        }
        i += step;
    }

    if let Some(block) = pending {
        return Err(TemplateError::BlockOutsideListTail {
            name: block.name,
            position: block.position,
        });
    }
    if literal_start < text.len() {
        segments.push(Segment::Text(text[literal_start..].to_string()));
    }

    Ok(segments)
}

fn closes(open: char, close: char) -> bool {
    matches!((open, close), ('[', ']') | ('{', '}') | ('(', ')'))
}

/// Name of the `${NAME}` starting at `offset`, if well formed.
fn placeholder_name(text: &str, offset: usize) -> Option<&str> {
    let rest = &text[offset + 2..];
    let end = rest.find('}')?;
    let name = &rest[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(slots: &[(&str, PlaceholderSpec)]) -> PlaceholderSchema {
        PlaceholderSchema {
            id: "test".to_string(),
            name: "Test".to_string(),
            template_version: "1.0.0".to_string(),
            engine_min_version: "1.0.0".to_string(),
            placeholders: slots
                .iter()
                .map(|(name, spec)| (name.to_string(), spec.clone()))
                .collect(),
        }
    }

    fn scalar(kind: ScalarKind) -> PlaceholderSpec {
        PlaceholderSpec::Scalar(ScalarSpec::new(kind))
    }

    fn block() -> PlaceholderSpec {
        PlaceholderSpec::Block(BlockSpec::default())
    }

    #[test]
    fn test_dashboard_contract_compiles() {
        let template = Template::dashboard().unwrap();
        assert_eq!(template.id(), "dashboard");
        assert_eq!(
            template.referenced(),
            vec![
                "ADDRESS",
                "PORT",
                "CALENDAR_BLOCK",
                "CAL_VIEW_MODE",
                "LATITUDE",
                "LONGITUDE",
                "OWM_API_KEY",
                "WALLPAPER_SOURCE",
                "WALLPAPER_INTERVAL_MS",
                "MODULE_TRAFFIC_BLOCK",
                "PSC_MODULE_BLOCK",
                "MODULE_HA_BLOCK",
            ]
        );
        assert_eq!(template.required(), template.referenced());
        assert!(template.element("CALENDAR_BLOCK").is_some());
        assert!(template.element("MODULE_HA_BLOCK").is_none());
    }

    #[test]
    fn test_block_sites_record_their_list() {
        let template = Template::dashboard().unwrap();
        let sites: Vec<&BlockSite> = template
            .segments()
            .iter()
            .filter_map(|s| match s {
                Segment::Block(site) => Some(site),
                _ => None,
            })
            .collect();

        assert_eq!(sites.len(), 4);
        // calendars: [ ${CALENDAR_BLOCK} ]
        assert!(!sites[0].preceded_by_element);
        // the three optional modules share the tail of `modules`
        assert!(sites[1..].iter().all(|s| s.preceded_by_element));
        assert!(sites[1..].iter().all(|s| s.list_id == sites[1].list_id));
        assert_ne!(sites[0].list_id, sites[1].list_id);
    }

    #[test]
    fn test_placeholders_in_comments_stay_literal() {
        let s = schema(&[("PORT", scalar(ScalarKind::Number))]);
        let template = Template::parse("// ${NOT_DECLARED}\n{ port: ${PORT} /* ${ALSO} */ }", s).unwrap();
        assert_eq!(template.referenced(), vec!["PORT"]);
    }

    #[test]
    fn test_placeholder_in_string_rejected() {
        let s = schema(&[("KEY", scalar(ScalarKind::String))]);
        let err = Template::parse(r#"{ apikey: "${KEY}" }"#, s).unwrap_err();
        assert!(matches!(err, TemplateError::PlaceholderInString { ref name, .. } if name == "KEY"));
    }

    #[test]
    fn test_undeclared_placeholder_rejected_with_position() {
        let s = schema(&[]);
        let err = Template::parse("{\n  a: ${MISSING}\n}", s).unwrap_err();
        match err {
            TemplateError::UndeclaredPlaceholder { name, position } => {
                assert_eq!(name, "MISSING");
                assert_eq!(position, Position { line: 2, column: 6 });
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_placeholder_rejected() {
        let s = schema(&[]);
        assert!(matches!(
            Template::parse("{ a: ${1BAD} }", s.clone()),
            Err(TemplateError::MalformedPlaceholder { .. })
        ));
        assert!(matches!(
            Template::parse("{ a: ${OPEN", s),
            Err(TemplateError::MalformedPlaceholder { .. })
        ));
    }

    #[test]
    fn test_block_must_end_a_list() {
        let s = schema(&[("B", block())]);
        assert!(Template::parse("[ 1 ${B} ]", s.clone()).is_ok());
        assert!(matches!(
            Template::parse("[ ${B} 1 ]", s.clone()),
            Err(TemplateError::BlockOutsideListTail { .. })
        ));
        assert!(matches!(
            Template::parse("{ a: 1 ${B} }", s.clone()),
            Err(TemplateError::BlockOutsideListTail { .. })
        ));
        assert!(matches!(
            Template::parse("[ 1, ${B} ]", s),
            Err(TemplateError::SeparatorBeforeBlock { .. })
        ));
    }

    #[test]
    fn test_adjacent_blocks_share_the_tail() {
        let s = schema(&[("A", block()), ("B", block()), ("C", block())]);
        let template = Template::parse("[\n  ${A}\n  // gap\n  ${B}${C}\n]", s).unwrap();
        let lists: Vec<usize> = template
            .segments()
            .iter()
            .filter_map(|s| match s {
                Segment::Block(site) => Some(site.list_id),
                _ => None,
            })
            .collect();
        assert_eq!(lists, vec![0, 0, 0]);
    }

    #[test]
    fn test_default_kind_checked() {
        let mut spec = ScalarSpec::new(ScalarKind::Number);
        spec.default = Some(Scalar::String("x".to_string()));
        let s = schema(&[("N", PlaceholderSpec::Scalar(spec))]);
        assert!(matches!(
            Template::parse("{ n: ${N} }", s),
            Err(TemplateError::InvalidSchema { .. })
        ));
    }
}
