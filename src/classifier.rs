use crate::config::Delimiters;
use log::{debug, warn};
use regex::{Captures, Regex};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// How a source file is turned into output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateMode {
    /// Copied byte for byte.
    Verbatim,
    /// Rendered once against the root context; the mode prefix is dropped
    /// from the output name.
    Single,
    /// The path itself holds placeholders and may expand to many outputs.
    Collection,
}

impl fmt::Display for TemplateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TemplateMode::Verbatim => "verbatim",
            TemplateMode::Single => "single",
            TemplateMode::Collection => "collection",
        })
    }
}

/// A placeholder found in a path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder<'t> {
    pub range: Range<usize>,
    /// The selector with any leading current-scope `.` removed.
    pub selector: &'t str,
}

/// Matches `<left> selector <right>` in paths, built from the configured
/// delimiters.
#[derive(Debug, Clone)]
pub struct PlaceholderPattern {
    regex: Regex,
}

impl PlaceholderPattern {
    pub fn new(delimiters: &Delimiters) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!(
            r"{}\s*(?P<field>\.?[a-zA-Z0-9_.]+)\s*{}",
            regex::escape(&delimiters.left),
            regex::escape(&delimiters.right),
        ))?;
        Ok(Self { regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn placeholders<'t>(&self, text: &'t str) -> Vec<Placeholder<'t>> {
        self.regex
            .captures_iter(text)
            .filter_map(|caps| placeholder(&caps))
            .collect()
    }

    /// Replaces every placeholder with the output of `replace`.
    pub fn replace_all<F>(&self, text: &str, mut replace: F) -> String
    where
        F: FnMut(&Placeholder<'_>) -> String,
    {
        self.regex
            .replace_all(text, |caps: &Captures<'_>| match placeholder(caps) {
                Some(p) => replace(&p),
                None => String::new(),
            })
            .into_owned()
    }
}

fn placeholder<'t>(caps: &Captures<'t>) -> Option<Placeholder<'t>> {
    let whole = caps.get(0)?;
    let field = caps.name("field")?.as_str();
    Some(Placeholder {
        range: whole.range(),
        selector: field.strip_prefix('.').unwrap_or(field),
    })
}

/// A source file and its path relative to the input root it was found under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceFile {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Sources partitioned by mode, each list sorted and free of duplicates.
#[derive(Debug, Default, Clone)]
pub struct SourceSet {
    verbatim: Vec<SourceFile>,
    single: Vec<SourceFile>,
    collection: Vec<SourceFile>,
}

impl SourceSet {
    pub fn sources(&self, mode: TemplateMode) -> &[SourceFile] {
        match mode {
            TemplateMode::Verbatim => &self.verbatim,
            TemplateMode::Single => &self.single,
            TemplateMode::Collection => &self.collection,
        }
    }

    pub fn len(&self) -> usize {
        self.verbatim.len() + self.single.len() + self.collection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&mut self, mode: TemplateMode, source: SourceFile) {
        match mode {
            TemplateMode::Verbatim => self.verbatim.push(source),
            TemplateMode::Single => self.single.push(source),
            TemplateMode::Collection => self.collection.push(source),
        }
    }
}

/// Decides the mode of a single relative path. Placeholders win over the
/// mode prefix.
pub fn mode_of(relative: &Path, pattern: &PlaceholderPattern, mode_prefix: &str) -> TemplateMode {
    if pattern.is_match(&relative.to_string_lossy()) {
        return TemplateMode::Collection;
    }
    let prefixed = relative
        .file_name()
        .map(|name| name.to_string_lossy().starts_with(mode_prefix))
        .unwrap_or(false);
    if prefixed {
        TemplateMode::Single
    } else {
        TemplateMode::Verbatim
    }
}

/// Drops the mode prefix from the file name of `path`, if present.
pub fn strip_mode_prefix(path: &Path, mode_prefix: &str) -> PathBuf {
    match path.file_name().map(|n| n.to_string_lossy().into_owned()) {
        Some(name) => match name.strip_prefix(mode_prefix) {
            Some(stripped) if !stripped.is_empty() => path.with_file_name(stripped),
            _ => path.to_path_buf(),
        },
        None => path.to_path_buf(),
    }
}

/// Extension marking a file as a template source; it never reaches the
/// output name.
pub const TEMPLATE_EXTENSION: &str = "tpl";

/// Output name of a rendered template: the mode prefix and a trailing
/// `.tpl` are dropped from the file name.
pub fn output_name(path: &Path, mode_prefix: &str) -> PathBuf {
    let path = strip_mode_prefix(path, mode_prefix);
    let is_template = path
        .extension()
        .map(|ext| ext == TEMPLATE_EXTENSION)
        .unwrap_or(false);
    match path.file_stem() {
        Some(stem) if is_template && !stem.is_empty() => path.with_file_name(stem),
        _ => path,
    }
}

/// Walks every root depth first and sorts the files it finds into modes.
///
/// Roots and entries that cannot be read are logged and skipped; this never
/// fails as a whole.
pub fn classify<P: AsRef<Path>>(
    roots: &[P],
    pattern: &PlaceholderPattern,
    mode_prefix: &str,
) -> SourceSet {
    let mut set = SourceSet::default();
    let mut seen = HashSet::new();

    for root in roots {
        let root = root.as_ref();
        let root = match fs::canonicalize(root) {
            Ok(path) => path,
            Err(e) => {
                warn!("unable to stat {:?}, skipping: {}", root, e);
                continue;
            }
        };
        if root.is_file() {
            let relative = root.file_name().map(PathBuf::from).unwrap_or_default();
            if seen.insert(root.clone()) {
                let mode = mode_of(&relative, pattern, mode_prefix);
                set.push(mode, SourceFile { absolute: root, relative });
            }
            continue;
        }
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("unable to walk down {:?}, skipping: {}", e.path().unwrap_or(root.as_path()), e);
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let absolute = entry.path().to_path_buf();
            if !seen.insert(absolute.clone()) {
                continue;
            }
            let relative = match absolute.strip_prefix(&root) {
                Ok(relative) => relative.to_path_buf(),
                Err(_) => continue,
            };
            let mode = mode_of(&relative, pattern, mode_prefix);
            debug!("{:?} classified as {}", relative, mode);
            set.push(mode, SourceFile { absolute, relative });
        }
    }

    set.verbatim.sort();
    set.single.sort();
    set.collection.sort();
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pattern() -> PlaceholderPattern {
        PlaceholderPattern::new(&Delimiters::default()).unwrap()
    }

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "x").unwrap();
    }

    fn relatives(set: &SourceSet, mode: TemplateMode) -> Vec<String> {
        set.sources(mode)
            .iter()
            .map(|s| s.relative.to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_placeholders() {
        let p = pattern();
        let found = p.placeholders("{{ friends.name }}/{{.Current.id}}-{{x}}.txt");
        let selectors: Vec<&str> = found.iter().map(|p| p.selector).collect();
        assert_eq!(selectors, vec!["friends.name", "Current.id", "x"]);
        assert_eq!(found[0].range, 0..18);
        assert!(!p.is_match("{{ not valid! }}"));
    }

    #[test]
    fn test_custom_delimiters() {
        let p = PlaceholderPattern::new(&Delimiters::parse("[[,]]").unwrap()).unwrap();
        assert!(p.is_match("[[name]].txt"));
        assert!(!p.is_match("{{name}}.txt"));
        assert_eq!(p.replace_all("a-[[ x ]]-b", |_| "y".to_string()), "a-y-b");
    }

    #[test]
    fn test_mode_of_precedence() {
        let p = pattern();
        assert_eq!(mode_of(Path::new("about.txt"), &p, "_"), TemplateMode::Verbatim);
        assert_eq!(mode_of(Path::new("_header.tpl"), &p, "_"), TemplateMode::Single);
        assert_eq!(mode_of(Path::new("_{{x}}.tpl"), &p, "_"), TemplateMode::Collection);
        assert_eq!(mode_of(Path::new("{{dir}}/plain.txt"), &p, "_"), TemplateMode::Collection);
        assert_eq!(mode_of(Path::new("_dir/plain.txt"), &p, "_"), TemplateMode::Verbatim);
    }

    #[test]
    fn test_strip_mode_prefix() {
        assert_eq!(strip_mode_prefix(Path::new("a/_header"), "_"), PathBuf::from("a/header"));
        assert_eq!(strip_mode_prefix(Path::new("a/header"), "_"), PathBuf::from("a/header"));
        assert_eq!(strip_mode_prefix(Path::new("_"), "_"), PathBuf::from("_"));
    }

    #[test]
    fn test_output_name_drops_template_extension() {
        assert_eq!(output_name(Path::new("_header.tpl"), "_"), PathBuf::from("header"));
        assert_eq!(output_name(Path::new("a/_page.html.tpl"), "_"), PathBuf::from("a/page.html"));
        assert_eq!(output_name(Path::new("a/_page.html"), "_"), PathBuf::from("a/page.html"));
        assert_eq!(output_name(Path::new("Alice.txt"), "_"), PathBuf::from("Alice.txt"));
        assert_eq!(output_name(Path::new(".tpl"), "_"), PathBuf::from(".tpl"));
    }

    #[test]
    fn test_classify_tree() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "about.txt");
        touch(dir.path(), "_header.tpl");
        touch(dir.path(), "posts/{{posts.slug}}.md");
        touch(dir.path(), "posts/_index.md");
        touch(dir.path(), "assets/logo.png");

        let set = classify(&[dir.path()], &pattern(), "_");
        assert_eq!(set.len(), 5);
        assert_eq!(relatives(&set, TemplateMode::Verbatim), vec!["about.txt", "assets/logo.png"]);
        assert_eq!(relatives(&set, TemplateMode::Single), vec!["_header.tpl", "posts/_index.md"]);
        assert_eq!(relatives(&set, TemplateMode::Collection), vec!["posts/{{posts.slug}}.md"]);
    }

    #[test]
    fn test_classify_deduplicates_roots() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        touch(dir.path(), "b/c.txt");
        let set = classify(
            &[dir.path().to_path_buf(), dir.path().join("b"), dir.path().join("a.txt")],
            &pattern(),
            "_",
        );
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_classify_skips_missing_roots() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "a.txt");
        let set = classify(&[dir.path().join("missing"), dir.path().to_path_buf()], &pattern(), "_");
        assert_eq!(set.len(), 1);
        assert!(classify(&[dir.path().join("missing")], &pattern(), "_").is_empty());
    }

    #[test]
    fn test_placeholder_in_root_path_is_ignored() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("{{site}}");
        touch(&root, "plain.txt");
        let set = classify(&[&root], &pattern(), "_");
        assert_eq!(relatives(&set, TemplateMode::Verbatim), vec!["plain.txt"]);
    }
}
