use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::classifier::{self, PlaceholderPattern, SourceFile, TemplateMode};
use crate::config::GeneratorConfig;
use crate::context::{Context, ContextView};
use crate::engine::{EngineError, LoadedTemplate, TemplateEngine};
use crate::expander::{self, ExpandError};
use crate::queue::{ActionQueue, CopyFile, CreateFile, EnsureDir, OverwriteFile, QueueFailure};

/// Rendered output longer than this is never treated as blank.
const BLANK_CHECK_LIMIT: usize = 512;

#[derive(Error, Debug)]
pub enum GenerateError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error("invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("target is a directory: {0:?}")]
    TargetIsDirectory(PathBuf),
    #[error("not a directory: {0:?}")]
    NotADirectory(PathBuf),
    #[error("{path:?} expanded from {template:?} points outside the destination")]
    OutsideDestination { template: String, path: String },
    #[error("{template:?} expanded to a path without a file name")]
    EmptyFileName { template: String },
}

enum Content {
    Rendered(String),
    Copy(PathBuf),
}

struct Output {
    target: PathBuf,
    content: Content,
}

/// Turns source trees into a [`Plan`] of filesystem actions.
pub struct Generator {
    config: GeneratorConfig,
    context: Context,
    engine: TemplateEngine,
    pattern: PlaceholderPattern,
}

impl Generator {
    pub fn new(config: GeneratorConfig, context: Context) -> Result<Self, GenerateError> {
        let engine = TemplateEngine::new(&config.delimiters)?;
        let pattern = PlaceholderPattern::new(&config.delimiters)?;
        Ok(Self {
            config,
            context,
            engine,
            pattern,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Classifies `sources`, renders every template and plans the writes into
    /// `dst`. Nothing on disk is touched.
    pub fn plan<P: AsRef<Path>>(&self, sources: &[P], dst: &Path) -> Result<Plan, GenerateError> {
        if let Ok(meta) = fs::metadata(dst) {
            if !meta.is_dir() {
                return Err(GenerateError::NotADirectory(dst.to_path_buf()));
            }
        }

        let set = classifier::classify(sources, &self.pattern, &self.config.mode_prefix);
        if set.is_empty() {
            let roots: Vec<String> = sources.iter().map(|p| p.as_ref().display().to_string()).collect();
            warn!("no source files found in {}", roots.join(", "));
        }

        let mut outputs = Outputs::default();
        for source in set.sources(TemplateMode::Verbatim) {
            outputs.push(
                TemplateMode::Verbatim,
                Output {
                    target: source.relative.clone(),
                    content: Content::Copy(source.absolute.clone()),
                },
            );
        }
        for source in set.sources(TemplateMode::Single) {
            if let Some(output) = self.render_single(source)? {
                outputs.push(TemplateMode::Single, output);
            }
        }
        for source in set.sources(TemplateMode::Collection) {
            for output in self.render_collection(source)? {
                outputs.push(TemplateMode::Collection, output);
            }
        }

        let mut plan = Plan::new(dst);
        plan.dirs.push(EnsureDir::new(dst));
        for dir in missing_dirs(dst, outputs.targets())? {
            plan.dirs.push(EnsureDir::new(dir));
        }
        for (mode, queue) in [
            (TemplateMode::Verbatim, &mut plan.verbatim),
            (TemplateMode::Single, &mut plan.single),
            (TemplateMode::Collection, &mut plan.collection),
        ] {
            for output in outputs.take(mode) {
                enqueue(queue, dst, output)?;
            }
        }
        info!(
            "planned {} verbatim, {} single and {} collection outputs",
            plan.verbatim.len(),
            plan.single.len(),
            plan.collection.len()
        );
        Ok(plan)
    }

    fn render_single(&self, source: &SourceFile) -> Result<Option<Output>, GenerateError> {
        let target = classifier::output_name(&source.relative, &self.config.mode_prefix);
        match self.engine.load(&source.absolute)? {
            LoadedTemplate::Binary => {
                warn!("{:?} is not a text template, copying as is", source.relative);
                Ok(Some(Output {
                    target,
                    content: Content::Copy(source.absolute.clone()),
                }))
            }
            LoadedTemplate::Text(text) => {
                let view = self.context.root_view();
                let rendered = self.render(source, &text, &view)?;
                Ok(rendered.map(|rendered| Output {
                    target,
                    content: Content::Rendered(rendered),
                }))
            }
        }
    }

    fn render_collection(&self, source: &SourceFile) -> Result<Vec<Output>, GenerateError> {
        let template = source.relative.to_string_lossy().into_owned();
        let expansion = expander::expand(&self.context, &self.pattern, &template)?;
        let loaded = self.engine.load(&source.absolute)?;
        if loaded == LoadedTemplate::Binary {
            warn!("{:?} is not a text template, copying as is", source.relative);
        }

        let mut outputs = Vec::new();
        for (path, view) in &expansion.outputs {
            let target = output_path(&template, path)?;
            let target = classifier::output_name(&target, &self.config.mode_prefix);
            debug!("{:?} expands to {:?}", source.relative, target);
            let content = match &loaded {
                LoadedTemplate::Binary => Content::Copy(source.absolute.clone()),
                LoadedTemplate::Text(text) => match self.render(source, text, view)? {
                    Some(rendered) => Content::Rendered(rendered),
                    None => continue,
                },
            };
            outputs.push(Output { target, content });
        }
        Ok(outputs)
    }

    /// Renders `text`; blank results yield `None`.
    fn render(&self, source: &SourceFile, text: &str, view: &ContextView<'_>) -> Result<Option<String>, GenerateError> {
        let name = source.relative.to_string_lossy();
        let rendered = self.engine.render(&name, text, view)?;
        if is_blank(&rendered) {
            debug!("{:?} rendered blank, skipping", source.relative);
            return Ok(None);
        }
        Ok(Some(rendered))
    }
}

/// Outputs per mode. A target planned twice keeps only the later output.
#[derive(Default)]
struct Outputs {
    by_mode: HashMap<TemplateMode, Vec<Output>>,
    owner: HashMap<PathBuf, TemplateMode>,
}

impl Outputs {
    fn push(&mut self, mode: TemplateMode, output: Output) {
        if let Some(previous) = self.owner.insert(output.target.clone(), mode) {
            warn!(
                "{:?} is produced by more than one source, keeping the {} one",
                output.target, mode
            );
            if let Some(list) = self.by_mode.get_mut(&previous) {
                list.retain(|o| o.target != output.target);
            }
        }
        self.by_mode.entry(mode).or_default().push(output);
    }

    fn targets(&self) -> impl Iterator<Item = &Path> {
        self.by_mode.values().flatten().map(|o| o.target.as_path())
    }

    fn take(&mut self, mode: TemplateMode) -> Vec<Output> {
        self.by_mode.remove(&mode).unwrap_or_default()
    }
}

/// Turns a rendered path into one relative to the destination. Leading
/// separators and empty segments left by unresolved placeholders are
/// dropped; `..` and drive prefixes are rejected.
fn output_path(template: &str, rendered: &str) -> Result<PathBuf, GenerateError> {
    let mut path = PathBuf::new();
    for component in Path::new(rendered).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(GenerateError::OutsideDestination {
                    template: template.to_string(),
                    path: rendered.to_string(),
                });
            }
        }
    }
    if path.file_name().is_none() {
        return Err(GenerateError::EmptyFileName {
            template: template.to_string(),
        });
    }
    Ok(path)
}

/// Directories under `dst` that outputs need and that do not exist yet,
/// parents before children.
fn missing_dirs<'a>(dst: &Path, targets: impl Iterator<Item = &'a Path>) -> Result<BTreeSet<PathBuf>, GenerateError> {
    let mut dirs = BTreeSet::new();
    for target in targets {
        let parent = match target.parent() {
            Some(parent) => parent,
            None => continue,
        };
        for ancestor in parent.ancestors().filter(|a| !a.as_os_str().is_empty()) {
            let dir = dst.join(ancestor);
            match fs::metadata(&dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => return Err(GenerateError::NotADirectory(dir)),
                Err(_) => {
                    dirs.insert(dir);
                }
            }
        }
    }
    Ok(dirs)
}

fn enqueue(queue: &mut ActionQueue, dst: &Path, output: Output) -> Result<(), GenerateError> {
    let target = dst.join(&output.target);
    let existing = match fs::metadata(&target) {
        Ok(meta) if meta.is_dir() => return Err(GenerateError::TargetIsDirectory(target)),
        Ok(_) => true,
        Err(_) => false,
    };
    match output.content {
        Content::Copy(src) => queue.push(CopyFile::new(src, target)),
        Content::Rendered(text) if existing => queue.push(OverwriteFile::new(target, text)),
        Content::Rendered(text) => queue.push(CreateFile::new(target, text)),
    }
    Ok(())
}

/// True for empty output and for short output made only of spaces and line
/// breaks.
pub fn is_blank(contents: &str) -> bool {
    if contents.is_empty() {
        return true;
    }
    if contents.len() > BLANK_CHECK_LIMIT {
        return false;
    }
    contents.bytes().all(|b| matches!(b, b' ' | b'\r' | b'\n'))
}

/// Planned actions, grouped the way they run.
#[derive(Debug)]
pub struct Plan {
    dst: PathBuf,
    dirs: ActionQueue,
    verbatim: ActionQueue,
    single: ActionQueue,
    collection: ActionQueue,
}

impl Plan {
    fn new(dst: &Path) -> Self {
        Self {
            dst: dst.to_path_buf(),
            dirs: ActionQueue::new(dst),
            verbatim: ActionQueue::new(dst),
            single: ActionQueue::new(dst),
            collection: ActionQueue::new(dst),
        }
    }

    pub fn len(&self) -> usize {
        self.dirs.len() + self.verbatim.len() + self.single.len() + self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The dry-run report: one tree per group.
    pub fn describe(&self) -> String {
        [
            self.dirs.describe("Directories"),
            self.verbatim.describe("Verbatim Files"),
            self.single.describe("Single Templates"),
            self.collection.describe("Collection Templates"),
        ]
        .join("\n")
    }

    /// Runs directories, verbatim copies, single and then collection outputs
    /// as one transaction.
    pub fn execute(mut self) -> Result<(), QueueFailure> {
        let mut queue = ActionQueue::new(&self.dst);
        queue.append(&mut self.dirs);
        queue.append(&mut self.verbatim);
        queue.append(&mut self.single);
        queue.append(&mut self.collection);
        queue.execute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::SelectorCase;
    use tempfile::tempdir;

    fn write(root: &Path, relative: &str, contents: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn generator(roots: &[(&str, &str)]) -> Generator {
        let mut context = Context::new(SelectorCase::Sensitive);
        for (name, json) in roots {
            context.load_json(name, json.as_bytes()).unwrap();
        }
        Generator::new(GeneratorConfig::default(), context).unwrap()
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(""));
        assert!(is_blank(" \r\n\n  "));
        assert!(!is_blank("\t"));
        assert!(!is_blank(" x "));
        assert!(!is_blank(&" ".repeat(BLANK_CHECK_LIMIT + 1)));
    }

    #[test]
    fn test_output_path() {
        assert_eq!(output_path("t", "a/b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert!(matches!(
            output_path("t", "../evil.txt"),
            Err(GenerateError::OutsideDestination { .. })
        ));
        assert_eq!(output_path("t", "/Bob.txt").unwrap(), PathBuf::from("Bob.txt"));
        assert_eq!(output_path("t", "a//./b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert!(matches!(
            output_path("t", "a/../../evil.txt"),
            Err(GenerateError::OutsideDestination { .. })
        ));
        assert!(matches!(output_path("t", "/"), Err(GenerateError::EmptyFileName { .. })));
        assert!(matches!(output_path("t", ""), Err(GenerateError::EmptyFileName { .. })));
    }

    #[test]
    fn test_plan_groups_and_describes() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let out = dst.path().join("site");
        write(src.path(), "about.txt", b"about");
        write(src.path(), "_index.html", b"<h1>{{ .Site.title }}</h1>");
        write(src.path(), "posts/{{posts.slug}}.html", b"{{ .Current.body }}");

        let generator = generator(&[
            ("Site", r#"{"title": "Docs"}"#),
            ("posts", r#"[{"slug": "a", "body": "A"}, {"slug": "b", "body": "B"}]"#),
        ]);
        let plan = generator.plan(&[src.path()], &out).unwrap();
        assert_eq!(plan.dirs.len(), 2);
        assert_eq!(plan.verbatim.len(), 1);
        assert_eq!(plan.single.len(), 1);
        assert_eq!(plan.collection.len(), 2);

        let report = plan.describe();
        assert!(report.contains("Verbatim Files\n└── [1]  copy file [dst]/about.txt"));
        assert!(report.contains("new file [dst]/index.html"));
        assert!(report.contains("new file [dst]/posts/b.html"));
        assert!(!out.exists());

        plan.execute().unwrap();
        assert_eq!(fs::read_to_string(out.join("index.html")).unwrap(), "<h1>Docs</h1>");
        assert_eq!(fs::read_to_string(out.join("posts/a.html")).unwrap(), "A");
        assert_eq!(fs::read_to_string(out.join("posts/b.html")).unwrap(), "B");
        assert_eq!(fs::read_to_string(out.join("about.txt")).unwrap(), "about");
    }

    #[test]
    fn test_blank_renders_are_skipped() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "_empty.txt", b"{{ missing }}\n\n");
        let plan = generator(&[]).plan(&[src.path()], dst.path()).unwrap();
        assert_eq!(plan.single.len(), 0);
    }

    #[test]
    fn test_existing_file_is_overwritten() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "_page.txt", b"new {{ Name }}");
        write(dst.path(), "page.txt", b"old");
        let generator = generator(&[("Name", r#""x""#)]);
        let plan = generator.plan(&[src.path()], dst.path()).unwrap();
        assert!(plan.describe().contains("overwrite file [dst]/page.txt"));
        plan.execute().unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("page.txt")).unwrap(), "new x");
    }

    #[test]
    fn test_directory_conflicts_fail_before_execution() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "_page.txt", b"text");
        fs::create_dir_all(dst.path().join("page.txt")).unwrap();
        let err = generator(&[]).plan(&[src.path()], dst.path()).unwrap_err();
        assert!(matches!(err, GenerateError::TargetIsDirectory(_)));

        let src = tempdir().unwrap();
        write(src.path(), "nested/file.txt", b"text");
        fs::write(dst.path().join("nested"), "file in the way").unwrap();
        let err = generator(&[]).plan(&[src.path()], dst.path()).unwrap_err();
        assert!(matches!(err, GenerateError::NotADirectory(_)));
    }

    #[test]
    fn test_binary_collection_source_is_copied() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let image = [0x89, b'P', b'N', b'G', 0x00, 0x01];
        write(src.path(), "{{people.id}}.png", &image);
        let generator = generator(&[("people", r#"[{"id": 1}, {"id": 2}]"#)]);
        let plan = generator.plan(&[src.path()], dst.path()).unwrap();
        plan.execute().unwrap();
        assert_eq!(fs::read(dst.path().join("1.png")).unwrap(), image);
        assert_eq!(fs::read(dst.path().join("2.png")).unwrap(), image);
    }

    #[test]
    fn test_mode_prefix_dropped_from_expanded_name() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "_{{tags.name}}.md", b"# {{ Current.name }}");
        let generator = generator(&[("tags", r#"[{"name": "rust"}]"#)]);
        generator.plan(&[src.path()], dst.path()).unwrap().execute().unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("rust.md")).unwrap(), "# rust");
    }

    #[test]
    fn test_escaping_expansion_is_rejected() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "{{dirs.name}}/x.txt", b"x");
        let generator = generator(&[("dirs", r#"[{"name": ".."}]"#)]);
        let err = generator.plan(&[src.path()], dst.path()).unwrap_err();
        assert!(matches!(err, GenerateError::OutsideDestination { .. }));
    }

    #[test]
    fn test_missing_leading_segment_stays_in_destination() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "{{friends.team}}/{{friends.name}}.txt", b"{{ Current.name }}");
        let generator = generator(&[(
            "friends",
            r#"[{"name": "Alice", "team": "red"}, {"name": "Bob"}]"#,
        )]);
        generator.plan(&[src.path()], dst.path()).unwrap().execute().unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("red/Alice.txt")).unwrap(), "Alice");
        assert_eq!(fs::read_to_string(dst.path().join("Bob.txt")).unwrap(), "Bob");
    }

    #[test]
    fn test_template_extension_dropped_from_outputs() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "_header.tpl", b"Hello {{.Name}}");
        write(src.path(), "{{tags.name}}.md.tpl", b"# {{ Current.name }}");
        let generator = generator(&[("Name", r#""Cargo""#), ("tags", r#"[{"name": "rust"}]"#)]);
        generator.plan(&[src.path()], dst.path()).unwrap().execute().unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("header")).unwrap(), "Hello Cargo");
        assert_eq!(fs::read_to_string(dst.path().join("rust.md")).unwrap(), "# rust");
    }

    #[test]
    fn test_duplicate_targets_keep_the_later_output() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "page.txt", b"verbatim");
        write(src.path(), "_page.txt", b"single");
        let plan = generator(&[]).plan(&[src.path()], dst.path()).unwrap();
        assert_eq!(plan.verbatim.len(), 0);
        assert_eq!(plan.single.len(), 1);
        plan.execute().unwrap();
        assert_eq!(fs::read_to_string(dst.path().join("page.txt")).unwrap(), "single");
    }

    #[test]
    fn test_render_error_names_the_source() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        write(src.path(), "_bad.txt", b"{{ undefined_helper() }}");
        let err = generator(&[]).plan(&[src.path()], dst.path()).unwrap_err();
        assert!(matches!(err, GenerateError::Engine(EngineError::Render { .. })));
    }
}
