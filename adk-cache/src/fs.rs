// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Root-contained filesystem access. Every operation takes a
//! [DirectoryRoot] plus a relative path, and the path is rejected if it
//! would escape the root (absolute paths, `..` components).

use std::fs::{self as stdfs, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// The three sandboxed directory trees the runtime may touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectoryRoot {
    /// Read-only application payload.
    AppRoot,
    /// Per-application configuration.
    AppConfig,
    /// Disposable cache storage.
    AppCache,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("path escapes its directory root: {0:?}")]
    PathEscapesRoot(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Maps each [DirectoryRoot] to a host-provided base directory.
#[derive(Debug, Clone)]
pub struct Filesystem {
    app_root: PathBuf,
    app_config: PathBuf,
    app_cache: PathBuf,
}

impl Filesystem {
    pub fn new(
        app_root: impl Into<PathBuf>,
        app_config: impl Into<PathBuf>,
        app_cache: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_root: app_root.into(),
            app_config: app_config.into(),
            app_cache: app_cache.into(),
        }
    }

    fn base(&self, root: DirectoryRoot) -> &Path {
        match root {
            DirectoryRoot::AppRoot => &self.app_root,
            DirectoryRoot::AppConfig => &self.app_config,
            DirectoryRoot::AppCache => &self.app_cache,
        }
    }

    /// Joins `relative` onto the root base after containment checks.
    fn resolve(&self, root: DirectoryRoot, relative: &str) -> Result<PathBuf, FsError> {
        let path = Path::new(relative);
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::PathEscapesRoot(relative.to_owned()));
                }
            }
        }
        Ok(self.base(root).join(path))
    }

    pub fn open_read(&self, root: DirectoryRoot, relative: &str) -> Result<File, FsError> {
        Ok(File::open(self.resolve(root, relative)?)?)
    }

    /// Opens for writing, creating or truncating.
    pub fn open_write(&self, root: DirectoryRoot, relative: &str) -> Result<File, FsError> {
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(root, relative)?)?)
    }

    pub fn rename(&self, root: DirectoryRoot, from: &str, to: &str) -> Result<(), FsError> {
        Ok(stdfs::rename(self.resolve(root, from)?, self.resolve(root, to)?)?)
    }

    pub fn delete_file(&self, root: DirectoryRoot, relative: &str) -> Result<(), FsError> {
        Ok(stdfs::remove_file(self.resolve(root, relative)?)?)
    }

    /// Recursively deletes a directory tree. Missing trees are fine.
    pub fn delete_directory(&self, root: DirectoryRoot, relative: &str) -> Result<(), FsError> {
        match stdfs::remove_dir_all(self.resolve(root, relative)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// `mkdir -p` under the root.
    pub fn create_directory_path(&self, root: DirectoryRoot, relative: &str) -> Result<(), FsError> {
        Ok(stdfs::create_dir_all(self.resolve(root, relative)?)?)
    }

    pub fn exists(&self, root: DirectoryRoot, relative: &str) -> bool {
        self.resolve(root, relative)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    pub fn file_size(&self, root: DirectoryRoot, relative: &str) -> Result<u64, FsError> {
        Ok(stdfs::metadata(self.resolve(root, relative)?)?.len())
    }

    /// Names of the entries directly under a directory.
    pub fn list_directory(&self, root: DirectoryRoot, relative: &str) -> Result<Vec<String>, FsError> {
        let mut names = Vec::new();
        for entry in stdfs::read_dir(self.resolve(root, relative)?)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
