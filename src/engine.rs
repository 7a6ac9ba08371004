use crate::config::Delimiters;
use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid template syntax configuration: {0}")]
    Syntax(String),
    #[error("failed to read template {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("template parse error in {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("template rendering failed for {name}: {message}")]
    Render { name: String, message: String },
}

/// A source file read for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedTemplate {
    /// Text that compiled; holds the normalized source.
    Text(String),
    /// Not text; copied as is where possible.
    Binary,
}

/// TemplateEngine wraps minijinja::Environment, configured with the run's
/// delimiters.
pub struct TemplateEngine {
    env: Environment<'static>,
    /// Matches a `.` right after an opening tag, as in `{{ .Name }}`.
    leading_dot: Regex,
}

impl TemplateEngine {
    pub fn new(delimiters: &Delimiters) -> Result<Self, EngineError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        let syntax = SyntaxConfig::builder()
            .variable_delimiters(delimiters.left.clone(), delimiters.right.clone())
            .build()
            .map_err(|e| EngineError::Syntax(e.to_string()))?;
        env.set_syntax(syntax);
        crate::filters::register(&mut env);

        let leading_dot = Regex::new(&format!(
            r"({}-?\s*)\.([A-Za-z_])",
            regex::escape(&delimiters.left)
        ))
        .map_err(|e| EngineError::Syntax(e.to_string()))?;

        Ok(Self { env, leading_dot })
    }

    /// Rewrites dotted-root references (`{{ .Name }}`) into plain ones.
    pub fn normalize(&self, source: &str) -> String {
        self.leading_dot.replace_all(source, "$1$2").into_owned()
    }

    /// Reads and compiles a template file. Non-text content is reported as
    /// [`LoadedTemplate::Binary`] instead of failing.
    pub fn load(&self, path: &Path) -> Result<LoadedTemplate, EngineError> {
        let bytes = fs::read(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.contains(&0) {
            return Ok(LoadedTemplate::Binary);
        }
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return Ok(LoadedTemplate::Binary),
        };
        let source = self.normalize(&text);
        if let Err(e) = self.env.template_from_str(&source) {
            return Err(EngineError::Parse {
                path: path.to_path_buf(),
                message: describe(&e, &source),
            });
        }
        Ok(LoadedTemplate::Text(source))
    }

    /// Renders already normalized template source with the given context.
    pub fn render<T: Serialize>(&self, name: &str, source: &str, context: &T) -> Result<String, EngineError> {
        let template = self
            .env
            .template_from_str(source)
            .map_err(|e| EngineError::Render {
                name: name.to_string(),
                message: describe(&e, source),
            })?;
        template.render(context).map_err(|e| EngineError::Render {
            name: name.to_string(),
            message: describe(&e, source),
        })
    }

    /// Normalizes and renders a template string.
    pub fn render_str<T: Serialize>(&self, source: &str, context: &T) -> Result<String, EngineError> {
        self.render("<string>", &self.normalize(source), context)
    }
}

fn describe(e: &minijinja::Error, source: &str) -> String {
    let kind = if e.kind() == ErrorKind::SyntaxError {
        "syntax error: "
    } else {
        ""
    };
    match e.line() {
        Some(line) => {
            let error_line = source.lines().nth(line.saturating_sub(1)).unwrap_or("");
            format!("{}{}\n{}", kind, e, error_line)
        }
        None => format!("{}{}", kind, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn engine() -> TemplateEngine {
        TemplateEngine::new(&Delimiters::default()).unwrap()
    }

    #[test]
    fn test_render_str() {
        let context = HashMap::from([("Name", "Cargo")]);
        let result = engine().render_str("Hello {{.Name}}", &context).unwrap();
        assert_eq!(result, "Hello Cargo");
        let result = engine().render_str("Hello {{ Name }}!", &context).unwrap();
        assert_eq!(result, "Hello Cargo!");
    }

    #[test]
    fn test_render_keeps_bytes_without_tags() {
        let text = "plain text\n  with trailing newline\n\n";
        let context: HashMap<String, String> = HashMap::new();
        assert_eq!(engine().render_str(text, &context).unwrap(), text);
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let context: HashMap<String, String> = HashMap::new();
        let result = engine()
            .render_str("[{{ .Current.name }}][{{ missing }}]", &context)
            .unwrap();
        assert_eq!(result, "[][]");
    }

    #[test]
    fn test_custom_delimiters() {
        let engine = TemplateEngine::new(&Delimiters::parse("[[,]]").unwrap()).unwrap();
        let context = HashMap::from([("name", "docs")]);
        assert_eq!(
            engine.render_str("[[ .name ]] {{ name }}", &context).unwrap(),
            "docs {{ name }}"
        );
    }

    #[test]
    fn test_filters_registered() {
        let context = HashMap::from([("title", "Hello World")]);
        let result = engine()
            .render_str("{{ title | kebabcase }}", &context)
            .unwrap();
        assert_eq!(result, "hello-world");
    }

    #[test]
    fn test_load_text_binary_and_invalid() {
        let dir = tempdir().unwrap();
        let text = dir.path().join("page.html");
        let binary = dir.path().join("logo.png");
        let broken = dir.path().join("broken.html");
        fs::write(&text, "<h1>{{ .Title }}</h1>\n").unwrap();
        fs::write(&binary, [0x89, b'P', b'N', b'G', 0x00, 0xff]).unwrap();
        fs::write(&broken, "{% if x %}never closed").unwrap();

        let engine = engine();
        assert_eq!(
            engine.load(&text).unwrap(),
            LoadedTemplate::Text("<h1>{{ Title }}</h1>\n".to_string())
        );
        assert_eq!(engine.load(&binary).unwrap(), LoadedTemplate::Binary);
        assert!(matches!(engine.load(&broken), Err(EngineError::Parse { .. })));
        assert!(matches!(
            engine.load(&dir.path().join("missing")),
            Err(EngineError::Io { .. })
        ));
    }
}
