use log::error;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// A file offered from the shared directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub size: u64,
}

/// Flat directory of shared files. Searches scan the directory on every
/// call so files dropped in while the node runs are picked up.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> FileStore {
        FileStore { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Case-insensitive substring match over the file names in the shared
    /// directory. Only plain, non-empty files are reported.
    pub fn search(&self, query: &str) -> Vec<LocalFile> {
        let needle = query.to_lowercase();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("shared directory {:?} is not readable: {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if !metadata.is_file() || metadata.len() == 0 {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.to_lowercase().contains(&needle) {
                files.push(LocalFile {
                    name,
                    size: metadata.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(name)?)
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        fs::write(self.resolve(name)?, bytes)
    }

    /// Remote peers supply the name; anything that could walk out of the
    /// shared directory is refused.
    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("file name {:?} escapes the shared directory", name),
            ));
        }
        Ok(self.dir.join(name))
    }
}
