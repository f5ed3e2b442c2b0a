//! Render Pipeline - Single Entry Point
//!
//! CRITICAL: render MUST parse its own output before returning it. No bypass.
//! A render either yields a validated document or nothing at all.

use serde_json::Value as JsonValue;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assembler::{BlockAssembler, ListCursor};
use crate::hashing::{document_digest, values_digest};
use crate::resolver::{PlaceholderResolver, ResolveError};
use crate::templates::{Position, Segment, Template, TemplateError};
use crate::validation::{parse_document, DocumentViolation, ParsedDocument};
use crate::values::ValueSet;
use crate::ENGINE_VERSION;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static VALIDATION_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_validation_call_count() -> u32 {
    VALIDATION_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_validation_call_count() {
    VALIDATION_CALL_COUNT.store(0, Ordering::SeqCst);
}

/// Every way a single render can fail. All of them are fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("Missing value: {name} (referenced at {position})")]
    MissingValue { name: String, position: Position },

    #[error("Type mismatch: {name} at {position} expects {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: String,
        found: String,
        position: Position,
    },

    #[error("Malformed fragment {index} of {block} (at {position}): {reason}")]
    MalformedFragment {
        block: String,
        index: usize,
        position: Position,
        reason: String,
    },

    #[error("Invalid document: {0}")]
    InvalidDocument(#[from] DocumentViolation),
}

impl RenderError {
    fn from_resolve(error: ResolveError, position: Position) -> Self {
        match error {
            ResolveError::Missing { name } => RenderError::MissingValue { name, position },
            ResolveError::Mismatch { name, expected, found } => RenderError::TypeMismatch {
                name,
                expected,
                found,
                position,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Render failed: {0}")]
    Render(#[from] RenderError),

    #[error("Template version {0} requires engine >= {1}, current is {2}")]
    EngineVersionMismatch(String, String, String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A validated render, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDocument {
    pub template_id: String,
    pub template_version: String,
    pub text: String,
    /// Parsed root literal of `text`
    pub root: JsonValue,
    /// SHA-256 of `text`
    pub digest: String,
}

impl RenderedDocument {
    /// Elements of the top-level `modules` array.
    pub fn modules(&self) -> &[JsonValue] {
        self.root
            .get("modules")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Render `template` with `values`, then validate the result.
pub fn render(template: &Template, values: &ValueSet) -> Result<RenderedDocument, RenderError> {
    let resolver = PlaceholderResolver::new(values);
    let assembler = BlockAssembler::new(template, values);
    let mut text = String::new();
    let mut cursor: Option<ListCursor> = None;

    for segment in template.segments() {
        match segment {
            Segment::Text(literal) => text.push_str(literal),
            Segment::Scalar(slot) => {
                let spec = template.schema().scalar(&slot.name).ok_or_else(|| {
                    RenderError::TypeMismatch {
                        name: slot.name.clone(),
                        expected: "scalar slot".to_string(),
                        found: "block slot".to_string(),
                        position: slot.position,
                    }
                })?;
                let literal = resolver
                    .resolve(&slot.name, spec)
                    .map_err(|e| RenderError::from_resolve(e, slot.position))?;
                text.push_str(&literal);
            }
            Segment::Block(site) => {
                // Consecutive blocks in one list continue the same cursor.
                let run = match cursor {
                    Some(c) if c.list_id == site.list_id => c,
                    _ => ListCursor::at(site),
                };
                let run = cursor.insert(run);
                text.push_str(&assembler.assemble(site, run)?);
            }
        }
    }
    debug!(template = %template.id(), bytes = text.len(), "substitution complete");

    let parsed = check_document(&text).map_err(|violation| {
        warn!(template = %template.id(), %violation, "rendered document rejected");
        RenderError::InvalidDocument(violation)
    })?;

    Ok(RenderedDocument {
        template_id: template.id().to_string(),
        template_version: template.version().to_string(),
        digest: document_digest(&text),
        root: parsed.root,
        text,
    })
}

/// Structural check of a config document; the render backstop.
pub fn check_document(text: &str) -> Result<ParsedDocument, DocumentViolation> {
    #[cfg(feature = "test-hooks")]
    VALIDATION_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

    parse_document(text)
}

/// Persist via a sibling temp file and rename, so readers never observe a
/// partially written config.
pub fn write_document(document: &RenderedDocument, path: &Path) -> Result<(), PipelineError> {
    let io_err = |source| PipelineError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(document.text.as_bytes()).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// The render pipeline - one checked template, many renders
pub struct RenderPipeline {
    template: Template,
}

impl RenderPipeline {
    /// Accept a template only if this engine satisfies its minimum version.
    pub fn new(template: Template) -> Result<Self, PipelineError> {
        check_engine_version(&template)?;
        Ok(Self { template })
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn render(&self, values: &ValueSet) -> Result<RenderedDocument, PipelineError> {
        Ok(render(&self.template, values)?)
    }

    /// Fingerprint of the inputs of a render.
    pub fn values_digest(&self, values: &ValueSet) -> Result<String, PipelineError> {
        Ok(values_digest(self.template.id(), self.template.version(), values)?)
    }

    /// Render and persist. Nothing is written unless the render is valid.
    pub fn render_to(&self, path: &Path, values: &ValueSet) -> Result<RenderedDocument, PipelineError> {
        let document = self.render(values)?;
        write_document(&document, path)?;
        info!(
            template = %document.template_id,
            path = %path.display(),
            digest = %document.digest,
            "config written"
        );
        Ok(document)
    }

    /// Validate a config file already on disk.
    pub fn check_file(path: &Path) -> Result<ParsedDocument, PipelineError> {
        let text = fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        check_document(&text).map_err(|v| PipelineError::Render(RenderError::InvalidDocument(v)))
    }
}

fn check_engine_version(template: &Template) -> Result<(), PipelineError> {
    let engine_ver = semver::Version::parse(ENGINE_VERSION)
        .map_err(|_| PipelineError::InvalidVersion(ENGINE_VERSION.to_string()))?;
    let min_ver = semver::Version::parse(&template.schema().engine_min_version)
        .map_err(|_| PipelineError::InvalidVersion(template.schema().engine_min_version.clone()))?;

    if engine_ver < min_ver {
        return Err(PipelineError::EngineVersionMismatch(
            template.version().to_string(),
            template.schema().engine_min_version.clone(),
            ENGINE_VERSION.to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{PlaceholderSchema, PlaceholderSpec, ScalarKind, ScalarSpec};

    fn port_template(engine_min_version: &str) -> Template {
        let schema = PlaceholderSchema {
            id: "port".to_string(),
            name: String::new(),
            template_version: "2.0.0".to_string(),
            engine_min_version: engine_min_version.to_string(),
            placeholders: [(
                "PORT".to_string(),
                PlaceholderSpec::Scalar(ScalarSpec::new(ScalarKind::Number)),
            )]
            .into(),
        };
        Template::parse("let config = { port: ${PORT} };\n", schema).unwrap()
    }

    #[test]
    fn test_engine_version_gate() {
        assert!(RenderPipeline::new(port_template("1.0.0")).is_ok());
        assert!(matches!(
            RenderPipeline::new(port_template("99.0.0")),
            Err(PipelineError::EngineVersionMismatch(..))
        ));
        assert!(matches!(
            RenderPipeline::new(port_template("not-a-version")),
            Err(PipelineError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_missing_value_carries_position() {
        let err = render(&port_template("1.0.0"), &ValueSet::new()).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingValue {
                name: "PORT".to_string(),
                position: Position { line: 1, column: 22 },
            }
        );
    }

    #[test]
    fn test_render_to_writes_nothing_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.js");
        let pipeline = RenderPipeline::new(port_template("1.0.0")).unwrap();

        assert!(pipeline.render_to(&path, &ValueSet::new()).is_err());
        assert!(!path.exists());

        let document = pipeline
            .render_to(&path, &ValueSet::new().with("PORT", 8080i64))
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), document.text);
        assert_eq!(document.root["port"], 8080);
    }

    #[test]
    fn test_check_file_reports_violation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.js");
        fs::write(&path, "let config = { port: 8080, };").unwrap();

        let err = RenderPipeline::check_file(&path).unwrap_err();
        assert!(err.to_string().contains("trailing separator"));
    }
}
