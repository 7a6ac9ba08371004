//! Ordered, reversible filesystem mutations.
//!
//! Actions run first to last. When one fails, every action before it is
//! reverted, last to first. Reverting is best effort: a revert that fails is
//! logged and reported, and the rest still run.
//!
//! Reverting an [`OverwriteFile`] deletes the file; its previous contents are
//! not restored.

use log::{info, warn};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{op} {path:?}: {source}")]
pub struct ActionError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl ActionError {
    fn new(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    Commit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Acquire => "acquire",
            Stage::Commit => "commit",
        })
    }
}

/// A revert that failed during rollback. The effect of that action is left
/// behind in the destination.
#[derive(Debug)]
pub struct Orphan {
    pub action: usize,
    pub description: String,
    pub error: ActionError,
}

/// Why a queue stopped. `action` is 1-based.
#[derive(Error, Debug)]
#[error("action #{action} ({description}) failed to {stage}: {source}")]
pub struct QueueFailure {
    pub action: usize,
    pub description: String,
    pub stage: Stage,
    #[source]
    pub source: ActionError,
    pub orphans: Vec<Orphan>,
}

/// One planned filesystem mutation.
pub trait Action: fmt::Debug {
    /// Human readable effect; paths under `base` are shown as `[dst]/...`.
    fn describe(&self, base: &Path) -> String;

    /// Opens or stats what the action needs.
    fn acquire(&mut self) -> Result<(), ActionError>;

    /// Applies the effect.
    fn commit(&mut self) -> Result<(), ActionError>;

    /// Undoes what `acquire` and `commit` did.
    fn revert(&mut self) -> Result<(), ActionError>;
}

/// Creates a directory and any missing parents.
#[derive(Debug)]
pub struct EnsureDir {
    path: PathBuf,
    /// Directories this action created, deepest first.
    created: Vec<PathBuf>,
}

impl EnsureDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: Vec::new(),
        }
    }
}

impl Action for EnsureDir {
    fn describe(&self, base: &Path) -> String {
        format!("new dir {} if not exists", display_path(&self.path, base))
    }

    fn acquire(&mut self) -> Result<(), ActionError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ActionError> {
        let missing: Vec<PathBuf> = self
            .path
            .ancestors()
            .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
            .map(Path::to_path_buf)
            .collect();
        fs::create_dir_all(&self.path).map_err(|e| ActionError::new("create dir", &self.path, e))?;
        self.created = missing;
        Ok(())
    }

    fn revert(&mut self) -> Result<(), ActionError> {
        for dir in self.created.drain(..) {
            fs::remove_dir(&dir).map_err(|e| ActionError::new("remove dir", &dir, e))?;
        }
        Ok(())
    }
}

/// Writes a file that must not exist yet.
#[derive(Debug)]
pub struct CreateFile {
    path: PathBuf,
    contents: Vec<u8>,
    file: Option<File>,
}

impl CreateFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            file: None,
        }
    }
}

impl Action for CreateFile {
    fn describe(&self, base: &Path) -> String {
        format!(
            "new file {} size={} (no overwrite)",
            display_path(&self.path, base),
            human_size(self.contents.len() as u64)
        )
    }

    fn acquire(&mut self) -> Result<(), ActionError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| ActionError::new("create file", &self.path, e))?;
        self.file = Some(file);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ActionError> {
        write_contents(self.file.take(), &self.path, &self.contents)
    }

    fn revert(&mut self) -> Result<(), ActionError> {
        self.file = None;
        fs::remove_file(&self.path).map_err(|e| ActionError::new("remove file", &self.path, e))
    }
}

/// Truncates and rewrites a file. Reverting deletes it.
#[derive(Debug)]
pub struct OverwriteFile {
    path: PathBuf,
    contents: Vec<u8>,
    file: Option<File>,
}

impl OverwriteFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            file: None,
        }
    }
}

impl Action for OverwriteFile {
    fn describe(&self, base: &Path) -> String {
        format!(
            "overwrite file {} size={}",
            display_path(&self.path, base),
            human_size(self.contents.len() as u64)
        )
    }

    fn acquire(&mut self) -> Result<(), ActionError> {
        let file = File::create(&self.path).map_err(|e| ActionError::new("open file", &self.path, e))?;
        self.file = Some(file);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ActionError> {
        write_contents(self.file.take(), &self.path, &self.contents)
    }

    fn revert(&mut self) -> Result<(), ActionError> {
        self.file = None;
        fs::remove_file(&self.path).map_err(|e| ActionError::new("remove file", &self.path, e))
    }
}

/// Streams `src` into `dst`.
#[derive(Debug)]
pub struct CopyFile {
    src: PathBuf,
    dst: PathBuf,
    file: Option<File>,
}

impl CopyFile {
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            file: None,
        }
    }
}

impl Action for CopyFile {
    fn describe(&self, base: &Path) -> String {
        format!("copy file {}", display_path(&self.dst, base))
    }

    fn acquire(&mut self) -> Result<(), ActionError> {
        let file = File::create(&self.dst).map_err(|e| ActionError::new("open file", &self.dst, e))?;
        self.file = Some(file);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), ActionError> {
        let mut dst = match self.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        let mut src = File::open(&self.src).map_err(|e| ActionError::new("open file", &self.src, e))?;
        io::copy(&mut src, &mut dst).map_err(|e| ActionError::new("copy file", &self.dst, e))?;
        Ok(())
    }

    fn revert(&mut self) -> Result<(), ActionError> {
        self.file = None;
        fs::remove_file(&self.dst).map_err(|e| ActionError::new("remove file", &self.dst, e))
    }
}

fn write_contents(file: Option<File>, path: &Path, contents: &[u8]) -> Result<(), ActionError> {
    match file {
        Some(mut file) => file
            .write_all(contents)
            .and_then(|_| file.flush())
            .map_err(|e| ActionError::new("write file", path, e)),
        None => Ok(()),
    }
}

/// Actions executed in order, rolled back in reverse on failure.
#[derive(Debug, Default)]
pub struct ActionQueue {
    base: PathBuf,
    actions: Vec<Box<dyn Action>>,
}

impl ActionQueue {
    /// `base` is the destination root, used only to shorten descriptions.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            actions: Vec::new(),
        }
    }

    pub fn push<A: Action + 'static>(&mut self, action: A) {
        self.actions.push(Box::new(action));
    }

    pub fn append(&mut self, other: &mut ActionQueue) {
        self.actions.append(&mut other.actions);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.describe(&self.base)).collect()
    }

    /// Renders the planned actions as a tree under `title`.
    pub fn describe(&self, title: &str) -> String {
        let title = if title.is_empty() { "Queue" } else { title };
        let mut out = format!("{}\n", title);
        let descriptions = self.descriptions();
        let last = descriptions.len().saturating_sub(1);
        for (i, description) in descriptions.iter().enumerate() {
            let branch = if i == last { "└──" } else { "├──" };
            out.push_str(&format!("{} [{}]  {}\n", branch, i + 1, description));
        }
        out
    }

    /// Runs every action. On the first failure the already applied actions
    /// are reverted in reverse order and the failure is returned.
    pub fn execute(&mut self) -> Result<(), QueueFailure> {
        for i in 0..self.actions.len() {
            let description = self.actions[i].describe(&self.base);
            info!("action#{}: {}", i + 1, description);
            let action = &mut self.actions[i];
            let result = action
                .acquire()
                .map_err(|e| (Stage::Acquire, e))
                .and_then(|_| action.commit().map_err(|e| (Stage::Commit, e)));
            if let Err((stage, source)) = result {
                warn!("action#{} {} error: {}", i + 1, stage, source);
                let orphans = self.rollback(i);
                return Err(QueueFailure {
                    action: i + 1,
                    description,
                    stage,
                    source,
                    orphans,
                });
            }
        }
        Ok(())
    }

    /// Same as [`execute`](Self::execute), reduced to success or failure.
    pub fn run(&mut self) -> bool {
        self.execute().is_ok()
    }

    fn rollback(&mut self, failed: usize) -> Vec<Orphan> {
        let mut orphans = Vec::new();
        for i in (0..failed).rev() {
            let action = &mut self.actions[i];
            match action.revert() {
                Ok(()) => info!("reverted action#{}", i + 1),
                Err(error) => {
                    warn!("revert action#{} failed: {}", i + 1, error);
                    orphans.push(Orphan {
                        action: i + 1,
                        description: action.describe(&self.base),
                        error,
                    });
                }
            }
        }
        orphans
    }
}

fn display_path(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) if base.as_os_str().is_empty() => rel.display().to_string(),
        Ok(rel) if rel.as_os_str().is_empty() => "[dst]".to_string(),
        Ok(rel) => Path::new("[dst]").join(rel).display().to_string(),
        Err(_) => path.display().to_string(),
    }
}

/// Formats a byte count in SI units: `512 B`, `1.5 kB`, `23 MB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes < 10 {
        return format!("{} B", bytes);
    }
    let mut exp = ((bytes as f64).ln() / 1000f64.ln()).floor() as usize;
    exp = exp.min(UNITS.len() - 1);
    let mut value = bytes as f64 / 1000f64.powi(exp as i32);
    // 999_999 B must read 1.0 MB, not 1000 kB
    if round_for_display(value) >= 1000.0 && exp < UNITS.len() - 1 {
        exp += 1;
        value /= 1000.0;
    }
    let value = round_for_display(value);
    if exp == 0 || value >= 10.0 {
        format!("{:.0} {}", value, UNITS[exp])
    } else {
        format!("{:.1} {}", value, UNITS[exp])
    }
}

fn round_for_display(value: f64) -> f64 {
    if value >= 10.0 {
        value.round()
    } else {
        (value * 10.0).round() / 10.0
    }
}
