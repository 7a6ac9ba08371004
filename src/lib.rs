//! Static site generation from a source tree and a structured data context.
//!
//! Files are classified by name into verbatim copies, single templates and
//! collection templates. Collection templates carry placeholders in their own
//! path and expand to one output per element of the collection they name.
//! All writes are planned first and then applied as one transaction.

pub mod classifier;
pub mod config;
pub mod context;
pub mod engine;
pub mod expander;
pub mod filters;
pub mod generator;
pub mod queue;
pub mod selector;
pub mod value;

pub use classifier::{PlaceholderPattern, SourceSet, TemplateMode};
pub use config::{ContextSourceSpec, Delimiters, GeneratorConfig, SelectorCase, SourceFormat};
pub use context::{Context, ContextView, GlobalSource};
pub use engine::TemplateEngine;
pub use expander::{expand, Expansion};
pub use generator::{GenerateError, Generator, Plan};
pub use queue::{ActionQueue, QueueFailure};
pub use value::Value;

/// Returns the generator version, with the build commit when one was
/// recorded at compile time.
///
/// # Returns
///
/// `0.3.0` or `0.3.0 (commit 1a2b3c4)`.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("FREIGHT_GIT_COMMIT") {
        Some(commit) if !commit.is_empty() => format!("{} (commit {})", version, commit),
        _ => version.to_string(),
    }
}
