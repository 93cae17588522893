use camino::{Utf8Path, Utf8PathBuf};
use std::fs;
use std::io;

/// Undo log for a group of file writes and deletions.
///
/// Every mutation records how to reverse it. Dropping the transaction
/// without [`commit`](Self::commit) rolls everything back, so a cancelled
/// future unwinds the same way as an error.
#[derive(Debug, Default)]
pub struct FileTransaction {
    undo: Vec<Undo>,
    /// Empty directories are pruned up to (not including) these roots on rollback.
    cleanup_roots: Vec<Utf8PathBuf>,
    finished: bool,
}

#[derive(Debug)]
enum Undo {
    /// File did not exist before; remove it.
    Created(Utf8PathBuf),
    /// File existed with these bytes; put them back.
    Replaced(Utf8PathBuf, Vec<u8>),
    /// File was renamed from `.0` to `.1`; rename it back.
    Moved(Utf8PathBuf, Utf8PathBuf),
}

impl FileTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prune empty directories below `root` during rollback.
    pub fn with_cleanup_root(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.cleanup_roots.push(root.into());
        self
    }

    /// Number of recorded mutations.
    pub fn len(&self) -> usize {
        self.undo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.undo.is_empty()
    }

    /// Snapshot `path` so rollback restores its current content.
    pub fn protect(&mut self, path: &Utf8Path) -> io::Result<()> {
        match fs::read(path) {
            Ok(data) => self.undo.push(Undo::Replaced(path.to_owned(), data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.undo.push(Undo::Created(path.to_owned()))
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Write `data` to `path`, creating parent directories.
    pub fn write(&mut self, path: &Utf8Path, data: &[u8]) -> io::Result<()> {
        self.protect(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }

    /// Copy `src` over `dst`.
    pub fn copy(&mut self, src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
        let data = fs::read(src)?;
        self.write(dst, &data)
    }

    /// Delete `path`. Returns false when it was already gone.
    pub fn remove(&mut self, path: &Utf8Path) -> io::Result<bool> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        fs::remove_file(path)?;
        self.undo.push(Undo::Replaced(path.to_owned(), data));
        Ok(true)
    }

    /// Rename `src` to `dst`. `dst` must not exist yet.
    pub fn move_file(&mut self, src: &Utf8Path, dst: &Utf8Path) -> io::Result<()> {
        if dst.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{dst} already exists"),
            ));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)?;
        self.undo.push(Undo::Moved(src.to_owned(), dst.to_owned()));
        Ok(())
    }

    /// Keep every change.
    pub fn commit(mut self) {
        self.finished = true;
        self.undo.clear();
    }

    /// Reverse every change, newest first. Returns the paths that could not
    /// be restored.
    pub fn rollback(mut self) -> Vec<(Utf8PathBuf, io::Error)> {
        self.finished = true;
        self.unwind()
    }

    fn unwind(&mut self) -> Vec<(Utf8PathBuf, io::Error)> {
        let mut failures = Vec::new();
        let mut touched_dirs = Vec::new();

        while let Some(step) = self.undo.pop() {
            let result = match &step {
                Undo::Created(path) => {
                    if let Some(parent) = path.parent() {
                        touched_dirs.push(parent.to_owned());
                    }
                    match fs::remove_file(path) {
                        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                        other => other,
                    }
                }
                Undo::Replaced(path, data) => path
                    .parent()
                    .map(fs::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| fs::write(path, data)),
                Undo::Moved(src, dst) => {
                    if let Some(parent) = dst.parent() {
                        touched_dirs.push(parent.to_owned());
                    }
                    src.parent()
                        .map(fs::create_dir_all)
                        .unwrap_or(Ok(()))
                        .and_then(|_| fs::rename(dst, src))
                }
            };
            if let Err(e) = result {
                let path = match step {
                    Undo::Created(path) | Undo::Replaced(path, _) | Undo::Moved(path, _) => path,
                };
                tracing::error!("Rollback could not restore {}: {}", path, e);
                failures.push((path, e));
            }
        }

        for dir in touched_dirs {
            if let Some(root) = self.cleanup_roots.iter().find(|root| dir.starts_with(root)) {
                remove_empty_dirs(&dir, root);
            }
        }
        failures
    }
}

impl Drop for FileTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.undo.is_empty() {
            tracing::warn!("File transaction dropped before commit, rolling back {} change(s)", self.undo.len());
            self.unwind();
        }
    }
}

/// Remove `start` and its ancestors while they are empty, stopping at `stop_at`.
pub fn remove_empty_dirs(start: &Utf8Path, stop_at: &Utf8Path) {
    let mut current = start.to_owned();
    while current != stop_at && current.starts_with(stop_at) && current.is_dir() {
        let is_empty = fs::read_dir(&current)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty || fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_owned(),
            None => break,
        }
    }
}
