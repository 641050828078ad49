//! Build context shared by all contents of an image.

use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tempfile::TempDir;
use tracing::debug;

use crate::content::ProvidedFiles;
use crate::fakeroot::FakeRoot;
use crate::generator::{GeneratedPart, SplitArchiveGenerator};
use crate::{bail, IoContext, Result};

/// Working directory for intermediate files.
#[derive(Debug)]
enum WorkDir {
    /// Temporary directory removed on drop.
    Temp(TempDir),
    /// Directory provided by the user.
    Provided { path: PathBuf, created: bool },
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Temp(dir) => dir.path(),
            WorkDir::Provided { path, .. } => path,
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let WorkDir::Provided {
            path,
            created: true,
        } = self
        {
            if let Err(error) = fs::remove_dir_all(&*path) {
                debug!("unable to remove work directory {}: {error}", path.display());
            }
        }
    }
}

/// Context of an image build.
///
/// Owns the working directory for intermediate files and the registry of named
/// files contents produced by generators.
#[derive(Debug)]
pub struct BuildContext {
    work_dir: WorkDir,
    /// Counter for unique file names in the work directory.
    counter: Cell<u64>,
    generators: Vec<SplitArchiveGenerator>,
    registry: IndexMap<String, (usize, GeneratedPart)>,
}

impl BuildContext {
    /// Create a context with a fresh temporary working directory.
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("diskgen-")
            .tempdir()
            .context("unable to create temporary directory")?;
        Ok(Self::with(WorkDir::Temp(dir)))
    }

    /// Create a context using the given working directory.
    ///
    /// The directory is created if it does not exist and is removed again when the
    /// context is dropped. An existing directory is kept.
    pub fn with_work_dir(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let created = !path.exists();
        fs::create_dir_all(&path)
            .context(format!("unable to create work directory {}", path.display()))?;
        Ok(Self::with(WorkDir::Provided { path, created }))
    }

    fn with(work_dir: WorkDir) -> Self {
        Self {
            work_dir,
            counter: Cell::new(0),
            generators: Vec::new(),
            registry: IndexMap::new(),
        }
    }

    /// The working directory.
    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Unique path for a temporary file in the working directory.
    ///
    /// The file itself is not created.
    pub fn temp_path(&self, prefix: &str, suffix: &str) -> PathBuf {
        let idx = self.counter.get();
        self.counter.set(idx + 1);
        self.work_dir().join(format!("{prefix}{idx}{suffix}"))
    }

    /// Create a temporary directory in the working directory.
    pub fn temp_dir(&self, prefix: &str) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.work_dir())
            .context("unable to create temporary directory")
    }

    /// Create a `fakeroot` session, optionally starting from the `parent`'s state.
    pub fn fakeroot(&self, parent: Option<&FakeRoot>) -> Result<FakeRoot> {
        let state = self.temp_path("fakeroot-", ".state");
        match parent {
            Some(parent) => FakeRoot::derive(parent, state),
            None => Ok(FakeRoot::new(state)),
        }
    }

    /// Register a generator under all the keys it provides.
    pub fn register(&mut self, generator: SplitArchiveGenerator) -> Result<()> {
        let idx = self.generators.len();
        let mut keys = IndexMap::new();
        for (key, part) in generator.keys() {
            if self.registry.contains_key(&key) || keys.contains_key(&key) {
                bail!("Duplicate key {key} in contents");
            }
            keys.insert(key, (idx, part));
        }
        self.registry.extend(keys);
        self.generators.push(generator);
        Ok(())
    }

    /// Keys of all registered files contents.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.registry.keys().map(String::as_str)
    }

    /// Resolve the registered files contents with the given key.
    ///
    /// Runs the generator providing the key if it has not run yet.
    pub fn resolve(&mut self, key: &str) -> Result<ProvidedFiles> {
        let Some((idx, part)) = self.registry.get(key).cloned() else {
            bail!("Unknown content {key}");
        };
        let fakeroot = FakeRoot::new(self.temp_path("fakeroot-", ".state"));
        let work_dir = self.work_dir.path().to_path_buf();
        let generator = &mut self.generators[idx];
        generator.prepare(&work_dir, fakeroot)?;
        generator.files(&part)
    }
}
