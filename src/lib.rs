//! DashCalendar Core - Display Host Config Renderer
//!
//! # The Rules (Non-Negotiable)
//! 1. Templates Are Contracts: every placeholder is declared with its kind
//! 2. Values Are Never Coerced
//! 3. Separators Belong To The Assembler
//! 4. Every Render Is Re-Parsed Before It Is Accepted
//! 5. Deterministic Output

pub mod templates;
pub mod values;
pub mod resolver;
pub mod assembler;
pub mod validation;
pub mod hashing;
pub mod pipeline;

pub use templates::{
    BlockSpec, PlaceholderSchema, PlaceholderSpec, Position, ScalarKind, ScalarSpec, Template,
    TemplateError, TemplateId,
};
pub use values::{Fragment, Scalar, Value, ValueSet, ValueError};
pub use resolver::PlaceholderResolver;
pub use assembler::BlockAssembler;
pub use validation::{DocumentViolation, ParsedDocument, ParsedElement};
pub use hashing::{document_digest, values_digest, canonical_json};
pub use pipeline::{
    check_document, render, write_document, PipelineError, RenderError, RenderPipeline,
    RenderedDocument,
};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
