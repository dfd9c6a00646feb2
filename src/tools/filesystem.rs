//! File System Tool
//!
//! This module provides a safe, restricted file system tool for agents to read, write, and
//! manage files within designated paths. It prevents directory traversal attacks and enforces
//! security restrictions.
//!
//! # Features
//!
//! - **Safe path handling**: Prevents directory traversal attacks (`../../../etc/passwd`)
//! - **Path restriction**: Optional root path to restrict all operations
//! - **File operations**: Read, write, append, patch, move, delete files
//! - **Directory operations**: List, create, delete directories; recursive find and search
//! - **Metadata access**: File size, modification time, is_directory
//! - **Extension filtering**: Optional file extension whitelist
//! - **Error handling**: Comprehensive error types with context
//!
//! # Security
//!
//! - All paths are normalized and validated
//! - Paths that escape the root directory are rejected, including through not-yet-existing
//!   components and symlinks planted mid-tree
//! - No execution of file contents
//! - Optional extension filtering to prevent writing dangerous files
//!
//! # Two roots, two trust levels
//!
//! An agent's home folder (read/write, sandboxed by [`FileSystemTool`]) is distinct from the
//! shared project folder (read-only, browsed via [`ProjectView`]). The project view additionally
//! tolerates a handful of path-prefix mistakes a model is prone to making (`projects/` prefix,
//! `projects/{id}/` prefix, absolute paths, a loosely-matched first segment) rather than failing
//! outright, since rejecting on the first typo wastes a full iteration of the agentic loop.
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```ignore
//! use agentmesh::tools::filesystem::FileSystemTool;
//! use std::path::PathBuf;
//!
//! let fs = FileSystemTool::new()
//!     .with_root_path(PathBuf::from("/home/user/documents"));
//!
//! // Read a file
//! let content = fs.read_file("notes.txt").await?;
//! println!("Content: {}", content);
//!
//! // Write a file
//! fs.write_file("output.txt", "Hello, World!").await?;
//!
//! // List directory
//! let entries = fs.read_directory(".", false).await?;
//! for entry in entries {
//!     println!("{}: {} bytes", entry.name, entry.size);
//! }
//! ```

use crate::tool_protocol::{
    ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Directories that are never walked by `find_files` or `search_in_files`, regardless of
/// caller-supplied excludes — matches the unconditional exclude list every agent home folder
/// and project folder carries.
pub const UNCONDITIONAL_EXCLUDES: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "coverage",
    ".next",
    ".cache",
];

/// Errors that can occur during file system operations
#[derive(Debug, Clone)]
pub enum FileSystemError {
    /// Path escapes the allowed root directory (security violation)
    PathTraversal(String),
    /// Path does not exist
    NotFound(String),
    /// File is a directory, but a file operation was attempted
    IsDirectory(String),
    /// Path is a directory, but a file operation was attempted
    NotADirectory(String),
    /// File already exists when it shouldn't
    AlreadyExists(String),
    /// Permission denied
    PermissionDenied(String),
    /// File extension not allowed
    ExtensionNotAllowed(String),
    /// IO error with context
    IOError(String),
    /// Invalid path format
    InvalidPath(String),
    /// `patch_file`'s `old_text` was not found verbatim in the target file
    PatchNotFound(String),
    /// `patch_file`'s `old_text` matched more than once; the caller must disambiguate
    PatchAmbiguous(String),
}

impl fmt::Display for FileSystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSystemError::PathTraversal(msg) => {
                write!(f, "Path traversal attempt blocked: {}", msg)
            }
            FileSystemError::NotFound(msg) => write!(f, "File not found: {}", msg),
            FileSystemError::IsDirectory(msg) => write!(f, "Is a directory: {}", msg),
            FileSystemError::NotADirectory(msg) => write!(f, "Not a directory: {}", msg),
            FileSystemError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            FileSystemError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            FileSystemError::ExtensionNotAllowed(msg) => {
                write!(f, "Extension not allowed: {}", msg)
            }
            FileSystemError::IOError(msg) => write!(f, "IO error: {}", msg),
            FileSystemError::InvalidPath(msg) => write!(f, "Invalid path: {}", msg),
            FileSystemError::PatchNotFound(msg) => {
                write!(f, "old_text not found in file: {}", msg)
            }
            FileSystemError::PatchAmbiguous(msg) => {
                write!(f, "old_text matches more than once: {}", msg)
            }
        }
    }
}

impl Error for FileSystemError {}

/// Metadata about a file or directory
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    /// File or directory name
    pub name: String,
    /// Full path relative to root
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_directory: bool,
    /// Last modified time
    pub modified: String,
}

/// Entry in a directory listing
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    /// Entry name
    pub name: String,
    /// Whether this is a directory
    pub is_directory: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
}

/// A line matched by `search_in_files`
#[derive(Debug, Clone)]
pub struct SearchMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

/// Safe file system tool for agents with path restrictions
#[derive(Clone)]
pub struct FileSystemTool {
    /// Root path restricting all operations
    root_path: Option<PathBuf>,
    /// Allowed file extensions (None = all allowed)
    allowed_extensions: Option<Vec<String>>,
}

impl FileSystemTool {
    /// Create a new file system tool with no restrictions
    pub fn new() -> Self {
        Self {
            root_path: None,
            allowed_extensions: None,
        }
    }

    /// Set the root path - all operations are restricted to this directory and its subdirectories
    pub fn with_root_path(mut self, path: PathBuf) -> Self {
        self.root_path = Some(path);
        self
    }

    /// Set allowed file extensions (e.g., ["txt", "pdf", "md"])
    pub fn with_allowed_extensions(mut self, extensions: Vec<String>) -> Self {
        self.allowed_extensions = Some(extensions);
        self
    }

    /// Normalize and validate a path
    fn validate_path(&self, path: &str) -> Result<PathBuf, FileSystemError> {
        // Convert to PathBuf
        let path_buf = PathBuf::from(path);

        // Reject absolute paths
        if path_buf.is_absolute() {
            return Err(FileSystemError::InvalidPath(
                "Absolute paths are not allowed".to_string(),
            ));
        }

        // Resolve .. and . components relative to root
        let mut normalized = PathBuf::new();
        for component in path_buf.components() {
            use std::path::Component;
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::Normal(c) => normalized.push(c),
                Component::CurDir => {} // Skip . components
                _ => {} // Ignore other components (shouldn't happen for relative paths)
            }
        }

        // Get the effective path (with root if set)
        let effective_path = if let Some(root) = &self.root_path {
            root.join(&normalized)
        } else {
            normalized
        };

        // Verify the effective path is within root (if root is set).
        //
        // Always canonicalize to resolve symlinks before comparing against root_canonical.
        // For paths that don't exist yet (write/create), canonicalize the nearest existing
        // ancestor and reconstruct the non-existent suffix under it — this prevents symlink
        // escapes through parent directory components.
        if let Some(root) = &self.root_path {
            let root_canonical = root.canonicalize().map_err(|e| {
                FileSystemError::IOError(format!("Cannot canonicalize root: {}", e))
            })?;

            let canonical_to_check = if effective_path.exists() {
                // Path exists — canonicalize fully (resolves all symlinks).
                effective_path.canonicalize().map_err(|e| {
                    FileSystemError::IOError(format!("Cannot canonicalize path: {}", e))
                })?
            } else {
                // Path doesn't exist yet (write/create).
                // Canonicalize the nearest existing ancestor to catch symlinks in parent dirs.
                let parent = effective_path.parent().ok_or_else(|| {
                    FileSystemError::InvalidPath("Path has no parent".to_string())
                })?;
                let canonical_parent = if parent.exists() {
                    parent.canonicalize().map_err(|e| {
                        FileSystemError::IOError(format!("Cannot canonicalize parent: {}", e))
                    })?
                } else {
                    // Walk up until we find an existing ancestor.
                    let mut ancestor = parent;
                    loop {
                        if ancestor.exists() {
                            break ancestor.canonicalize().map_err(|e| {
                                FileSystemError::IOError(format!(
                                    "Cannot canonicalize ancestor: {}",
                                    e
                                ))
                            })?;
                        }
                        ancestor = ancestor.parent().ok_or_else(|| {
                            FileSystemError::InvalidPath(
                                "No existing ancestor found".to_string(),
                            )
                        })?;
                    }
                };
                // Reconstruct the non-existent suffix under the canonical parent.
                let suffix = effective_path.strip_prefix(parent).unwrap_or(&effective_path);
                canonical_parent.join(suffix)
            };

            if !canonical_to_check.starts_with(&root_canonical) {
                return Err(FileSystemError::PathTraversal(format!(
                    "Path escapes root directory: {}",
                    path
                )));
            }
        }

        Ok(effective_path)
    }

    /// Check if file extension is allowed
    fn check_extension(&self, path: &Path) -> Result<(), FileSystemError> {
        if let Some(allowed) = &self.allowed_extensions {
            if let Some(ext) = path.extension() {
                let ext_str = ext.to_string_lossy().to_lowercase();
                if !allowed.iter().any(|a| a.to_lowercase() == ext_str) {
                    return Err(FileSystemError::ExtensionNotAllowed(format!(
                        "Extension .{} not allowed",
                        ext_str
                    )));
                }
            }
        }
        Ok(())
    }

    /// Read entire file content as string
    pub async fn read_file(&self, path: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;
        self.check_extension(&safe_path)?;

        if !safe_path.exists() {
            return Err(Box::new(FileSystemError::NotFound(path.to_string())));
        }

        if safe_path.is_dir() {
            return Err(Box::new(FileSystemError::IsDirectory(path.to_string())));
        }

        let content = fs::read_to_string(&safe_path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(content)
    }

    /// Write content to file (overwrites if exists)
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;
        self.check_extension(&safe_path)?;

        if safe_path.exists() && safe_path.is_dir() {
            return Err(Box::new(FileSystemError::IsDirectory(path.to_string())));
        }

        // Ensure parent directory exists
        if let Some(parent) = safe_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })?;
        }

        fs::write(&safe_path, content).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(())
    }

    /// Append content to file
    pub async fn append_file(
        &self,
        path: &str,
        content: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;
        self.check_extension(&safe_path)?;

        if safe_path.exists() && safe_path.is_dir() {
            return Err(Box::new(FileSystemError::IsDirectory(path.to_string())));
        }

        // Ensure parent directory exists
        if let Some(parent) = safe_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })?;
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&safe_path)
            .map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })?;

        file.write_all(content.as_bytes()).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(())
    }

    /// Replace the unique occurrence of `old_text` with `new_text` in a file.
    ///
    /// Fails if `old_text` is absent ([`FileSystemError::PatchNotFound`]) or occurs more than
    /// once ([`FileSystemError::PatchAmbiguous`]) — the caller must widen `old_text` with more
    /// surrounding context to disambiguate.
    pub async fn patch_file(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let content = self.read_file(path).await?;
        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return Err(Box::new(FileSystemError::PatchNotFound(path.to_string())));
        }
        if occurrences > 1 {
            return Err(Box::new(FileSystemError::PatchAmbiguous(path.to_string())));
        }
        let patched = content.replacen(old_text, new_text, 1);
        self.write_file(path, &patched).await
    }

    /// Move (or rename) a file or directory within the sandboxed root.
    pub async fn move_file(
        &self,
        from: &str,
        to: &str,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let safe_from = self.validate_path(from)?;
        if !safe_from.exists() {
            return Err(Box::new(FileSystemError::NotFound(from.to_string())));
        }

        // Validate `to` without requiring it to exist.
        let safe_to = self.validate_path(to)?;
        if safe_to.exists() {
            return Err(Box::new(FileSystemError::AlreadyExists(to.to_string())));
        }
        if let Some(parent) = safe_to.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })?;
        }

        fs::rename(&safe_from, &safe_to).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(())
    }

    /// Get file metadata
    pub async fn get_file_metadata(
        &self,
        path: &str,
    ) -> Result<FileMetadata, Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;

        if !safe_path.exists() {
            return Err(Box::new(FileSystemError::NotFound(path.to_string())));
        }

        let metadata = fs::metadata(&safe_path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        let modified_time = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(FileMetadata {
            name: safe_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            path: path.to_string(),
            size: metadata.len(),
            is_directory: metadata.is_dir(),
            modified: modified_time,
        })
    }

    /// Alias kept for tool-dispatch naming parity with `get_file_info`.
    pub async fn get_file_info(
        &self,
        path: &str,
    ) -> Result<FileMetadata, Box<dyn Error + Send + Sync>> {
        self.get_file_metadata(path).await
    }

    /// Read directory contents
    pub async fn read_directory(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<DirectoryEntry>, Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;

        if !safe_path.exists() {
            return Err(Box::new(FileSystemError::NotFound(path.to_string())));
        }

        if !safe_path.is_dir() {
            return Err(Box::new(FileSystemError::NotADirectory(path.to_string())));
        }

        let mut entries = Vec::new();

        if recursive {
            self.read_directory_recursive(&safe_path, &mut entries)?;
        } else {
            for entry in fs::read_dir(&safe_path).map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })? {
                let entry = entry.map_err(|e| {
                    Box::new(FileSystemError::IOError(e.to_string()))
                        as Box<dyn Error + Send + Sync>
                })?;
                let metadata = entry.metadata().map_err(|e| {
                    Box::new(FileSystemError::IOError(e.to_string()))
                        as Box<dyn Error + Send + Sync>
                })?;

                entries.push(DirectoryEntry {
                    name: entry.file_name().to_string_lossy().to_string(),
                    is_directory: metadata.is_dir(),
                    size: if metadata.is_dir() { 0 } else { metadata.len() },
                });
            }
        }

        Ok(entries)
    }

    /// Recursively read directory
    #[allow(clippy::only_used_in_recursion)]
    fn read_directory_recursive(
        &self,
        path: &Path,
        entries: &mut Vec<DirectoryEntry>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        for entry in fs::read_dir(path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })? {
            let entry = entry.map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })?;

            if UNCONDITIONAL_EXCLUDES.contains(&entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| {
                Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
            })?;

            entries.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_directory: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });

            if metadata.is_dir() {
                // Validate the resolved path before recursing to prevent a symlink inside the
                // tree from pointing outside the root and being silently traversed.
                if let Some(root) = &self.root_path {
                    if let Ok(root_canonical) = root.canonicalize() {
                        match entry.path().canonicalize() {
                            Ok(canonical) if !canonical.starts_with(&root_canonical) => {
                                // Symlink points outside the root — skip silently.
                                continue;
                            }
                            Err(_) => continue, // Cannot resolve — skip.
                            Ok(_) => {}          // Within root — proceed.
                        }
                    }
                }
                self.read_directory_recursive(&entry.path(), entries)?;
            }
        }

        Ok(())
    }

    /// Delete a file
    pub async fn delete_file(&self, path: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;

        if !safe_path.exists() {
            return Err(Box::new(FileSystemError::NotFound(path.to_string())));
        }

        if safe_path.is_dir() {
            return Err(Box::new(FileSystemError::IsDirectory(path.to_string())));
        }

        fs::remove_file(&safe_path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(())
    }

    /// Delete a directory (recursively)
    pub async fn delete_directory(&self, path: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;

        if !safe_path.exists() {
            return Err(Box::new(FileSystemError::NotFound(path.to_string())));
        }

        if !safe_path.is_dir() {
            return Err(Box::new(FileSystemError::NotADirectory(path.to_string())));
        }

        fs::remove_dir_all(&safe_path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(())
    }

    /// Check if a file or directory exists
    pub async fn file_exists(&self, path: &str) -> Result<bool, Box<dyn Error + Send + Sync>> {
        match self.validate_path(path) {
            Ok(safe_path) => Ok(safe_path.exists()),
            Err(_) => Ok(false), // Path traversal or invalid = doesn't exist
        }
    }

    /// Create a directory (with parents)
    pub async fn create_directory(&self, path: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;

        if safe_path.exists() {
            if !safe_path.is_dir() {
                return Err(Box::new(FileSystemError::AlreadyExists(path.to_string())));
            }
            return Ok(()); // Already exists and is a directory
        }

        fs::create_dir_all(&safe_path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(())
    }

    /// Find files under `directory` whose name contains `pattern`, honoring the unconditional
    /// exclude list plus any caller-supplied additional excludes.
    pub async fn find_files(
        &self,
        directory: &str,
        pattern: &str,
        extra_excludes: &[String],
    ) -> Result<Vec<DirectoryEntry>, Box<dyn Error + Send + Sync>> {
        let entries = self.read_directory(directory, true).await?;
        let matching: Vec<_> = entries
            .into_iter()
            .filter(|e| e.name.contains(pattern))
            .filter(|e| !extra_excludes.iter().any(|x| e.name.contains(x)))
            .collect();

        Ok(matching)
    }

    /// Grep-style recursive search for `pattern` across file contents under `directory`,
    /// honoring the unconditional exclude list. Binary files (those failing UTF-8 decoding)
    /// are skipped rather than erroring the whole search.
    pub async fn search_in_files(
        &self,
        directory: &str,
        pattern: &str,
    ) -> Result<Vec<SearchMatch>, Box<dyn Error + Send + Sync>> {
        let entries = self.read_directory(directory, true).await?;
        let mut matches = Vec::new();

        for entry in entries.into_iter().filter(|e| !e.is_directory) {
            let rel_path = format!("{}/{}", directory.trim_end_matches('/'), entry.name);
            let content = match self.read_file(&rel_path).await {
                Ok(c) => c,
                Err(_) => continue, // binary or unreadable — skip
            };
            for (i, line) in content.lines().enumerate() {
                if line.contains(pattern) {
                    matches.push(SearchMatch {
                        path: rel_path.clone(),
                        line_number: i + 1,
                        line: line.to_string(),
                    });
                }
            }
        }

        Ok(matches)
    }

    /// Byte-for-byte comparison of two files within the sandboxed root.
    pub async fn compare_files(
        &self,
        a: &str,
        b: &str,
    ) -> Result<bool, Box<dyn Error + Send + Sync>> {
        let content_a = self.read_file(a).await?;
        let content_b = self.read_file(b).await?;
        Ok(content_a == content_b)
    }

    /// Get file size in bytes
    pub async fn get_file_size(&self, path: &str) -> Result<u64, Box<dyn Error + Send + Sync>> {
        let safe_path = self.validate_path(path)?;

        if !safe_path.exists() {
            return Err(Box::new(FileSystemError::NotFound(path.to_string())));
        }

        if safe_path.is_dir() {
            return Err(Box::new(FileSystemError::IsDirectory(path.to_string())));
        }

        let metadata = fs::metadata(&safe_path).map_err(|e| {
            Box::new(FileSystemError::IOError(e.to_string())) as Box<dyn Error + Send + Sync>
        })?;

        Ok(metadata.len())
    }
}

impl Default for FileSystemTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view over the shared project folder, used by `read_project_file` and
/// `list_project_files`.
///
/// Tolerates the path-prefix mistakes a model commonly makes rather than failing on the first
/// attempt: a leading `projects/` or `projects/{project_id}/` segment is stripped, an absolute
/// path is made relative to the project root, and if the first path segment does not match any
/// existing top-level folder it is retried against the single closest-named folder (by prefix)
/// before giving up.
#[derive(Clone)]
pub struct ProjectView {
    root: PathBuf,
    project_id: String,
}

impl ProjectView {
    pub fn new(root: PathBuf, project_id: impl Into<String>) -> Self {
        Self {
            root,
            project_id: project_id.into(),
        }
    }

    fn correct_prefix(&self, path: &str) -> String {
        let mut p = path.trim_start_matches('/').to_string();
        let projects_prefix = format!("projects/{}/", self.project_id);
        if let Some(rest) = p.strip_prefix(&projects_prefix) {
            return rest.to_string();
        }
        if let Some(rest) = p.strip_prefix("projects/") {
            p = rest.to_string();
        }
        p
    }

    fn fuzzy_correct(&self, path: &str) -> String {
        let corrected = self.correct_prefix(path);
        let mut parts = corrected.splitn(2, '/');
        let first = parts.next().unwrap_or("");
        let rest = parts.next();

        if self.root.join(first).exists() {
            return corrected;
        }

        if let Ok(read_dir) = fs::read_dir(&self.root) {
            for entry in read_dir.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(first) || first.starts_with(name.as_str()) {
                    return match rest {
                        Some(r) => format!("{}/{}", name, r),
                        None => name,
                    };
                }
            }
        }

        corrected
    }

    pub async fn read_file(&self, path: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let corrected = self.fuzzy_correct(path);
        FileSystemTool::new()
            .with_root_path(self.root.clone())
            .read_file(&corrected)
            .await
    }

    pub async fn list_files(
        &self,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<DirectoryEntry>, Box<dyn Error + Send + Sync>> {
        let corrected = self.fuzzy_correct(path);
        FileSystemTool::new()
            .with_root_path(self.root.clone())
            .read_directory(&corrected, recursive)
            .await
    }
}

/// [`ToolProtocol`] implementation exposing the full filesystem tool catalog to the agentic
/// loop: `read_file`, `write_file`, `patch_file`, `list_files`, `delete_file`, `move_file`,
/// `create_directory`, `find_files`, `search_in_files`, `get_file_info`, `compare_files`.
pub struct FileSystemProtocol {
    tool: FileSystemTool,
}

impl FileSystemProtocol {
    pub fn new() -> Self {
        Self {
            tool: FileSystemTool::new(),
        }
    }

    pub fn with_root_path(root: PathBuf) -> Self {
        Self {
            tool: FileSystemTool::new().with_root_path(root),
        }
    }
}

impl Default for FileSystemProtocol {
    fn default() -> Self {
        Self::new()
    }
}

fn arg_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing `{}`", key)))
}

#[async_trait]
impl ToolProtocol for FileSystemProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = match tool_name {
            "read_file" => {
                let path = arg_str(&parameters, "path")?;
                self.tool
                    .read_file(&path)
                    .await
                    .map(|content| ToolResult::success(serde_json::json!({ "content": content })))
            }
            "write_file" => {
                let path = arg_str(&parameters, "path")?;
                let content = arg_str(&parameters, "content")?;
                self.tool
                    .write_file(&path, &content)
                    .await
                    .map(|_| ToolResult::success(serde_json::json!({ "written": true })))
            }
            "patch_file" => {
                let path = arg_str(&parameters, "path")?;
                let old_text = arg_str(&parameters, "old_text")?;
                let new_text = arg_str(&parameters, "new_text")?;
                self.tool
                    .patch_file(&path, &old_text, &new_text)
                    .await
                    .map(|_| ToolResult::success(serde_json::json!({ "patched": true })))
            }
            "list_files" => {
                let path = parameters
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let recursive = parameters
                    .get("recursive")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.tool
                    .read_directory(&path, recursive)
                    .await
                    .map(|entries| ToolResult::success(serde_json::to_value(entries).unwrap_or_default()))
            }
            "delete_file" => {
                let path = arg_str(&parameters, "path")?;
                self.tool
                    .delete_file(&path)
                    .await
                    .map(|_| ToolResult::success(serde_json::json!({ "deleted": true })))
            }
            "move_file" => {
                let from = arg_str(&parameters, "from")?;
                let to = arg_str(&parameters, "to")?;
                self.tool
                    .move_file(&from, &to)
                    .await
                    .map(|_| ToolResult::success(serde_json::json!({ "moved": true })))
            }
            "create_directory" => {
                let path = arg_str(&parameters, "path")?;
                self.tool
                    .create_directory(&path)
                    .await
                    .map(|_| ToolResult::success(serde_json::json!({ "created": true })))
            }
            "find_files" => {
                let directory = parameters
                    .get("directory")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let pattern = arg_str(&parameters, "pattern")?;
                let extra: Vec<String> = parameters
                    .get("exclude")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                self.tool
                    .find_files(&directory, &pattern, &extra)
                    .await
                    .map(|entries| ToolResult::success(serde_json::to_value(entries).unwrap_or_default()))
            }
            "search_in_files" => {
                let directory = parameters
                    .get("directory")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let pattern = arg_str(&parameters, "pattern")?;
                self.tool
                    .search_in_files(&directory, &pattern)
                    .await
                    .map(|matches| {
                        let json: Vec<_> = matches
                            .into_iter()
                            .map(|m| {
                                serde_json::json!({
                                    "path": m.path,
                                    "line_number": m.line_number,
                                    "line": m.line,
                                })
                            })
                            .collect();
                        ToolResult::success(serde_json::Value::Array(json))
                    })
            }
            "get_file_info" => {
                let path = arg_str(&parameters, "path")?;
                self.tool.get_file_info(&path).await.map(|meta| {
                    ToolResult::success(serde_json::json!({
                        "name": meta.name,
                        "path": meta.path,
                        "size": meta.size,
                        "is_directory": meta.is_directory,
                        "modified": meta.modified,
                    }))
                })
            }
            "compare_files" => {
                let a = arg_str(&parameters, "a")?;
                let b = arg_str(&parameters, "b")?;
                self.tool
                    .compare_files(&a, &b)
                    .await
                    .map(|equal| ToolResult::success(serde_json::json!({ "equal": equal })))
            }
            other => return Err(Box::new(ToolError::NotFound(other.to_string()))),
        };

        Ok(result.unwrap_or_else(|e| ToolResult::failure(e.to_string())))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![
            ToolMetadata::new("read_file", "Read the full contents of a file as text.")
                .with_parameter(ToolParameter::new("path", ToolParameterType::String).required()),
            ToolMetadata::new("write_file", "Write (overwrite) a file's contents.")
                .with_parameter(ToolParameter::new("path", ToolParameterType::String).required())
                .with_parameter(
                    ToolParameter::new("content", ToolParameterType::String).required(),
                ),
            ToolMetadata::new(
                "patch_file",
                "Replace a unique, exact occurrence of old_text with new_text in a file.",
            )
            .with_parameter(ToolParameter::new("path", ToolParameterType::String).required())
            .with_parameter(ToolParameter::new("old_text", ToolParameterType::String).required())
            .with_parameter(ToolParameter::new("new_text", ToolParameterType::String).required()),
            ToolMetadata::new("list_files", "List directory contents, optionally recursively.")
                .with_parameter(ToolParameter::new("path", ToolParameterType::String))
                .with_parameter(ToolParameter::new("recursive", ToolParameterType::Boolean)),
            ToolMetadata::new("delete_file", "Delete a single file.")
                .with_parameter(ToolParameter::new("path", ToolParameterType::String).required()),
            ToolMetadata::new("move_file", "Move or rename a file or directory.")
                .with_parameter(ToolParameter::new("from", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("to", ToolParameterType::String).required()),
            ToolMetadata::new("create_directory", "Create a directory, including parents.")
                .with_parameter(ToolParameter::new("path", ToolParameterType::String).required()),
            ToolMetadata::new(
                "find_files",
                "Recursively find files whose name contains a substring pattern.",
            )
            .with_parameter(ToolParameter::new("directory", ToolParameterType::String))
            .with_parameter(ToolParameter::new("pattern", ToolParameterType::String).required())
            .with_parameter(
                ToolParameter::new("exclude", ToolParameterType::Array)
                    .with_items(ToolParameterType::String),
            ),
            ToolMetadata::new(
                "search_in_files",
                "Recursively grep file contents for a substring pattern.",
            )
            .with_parameter(ToolParameter::new("directory", ToolParameterType::String))
            .with_parameter(ToolParameter::new("pattern", ToolParameterType::String).required()),
            ToolMetadata::new("get_file_info", "Get metadata (size, mtime, kind) for a path.")
                .with_parameter(ToolParameter::new("path", ToolParameterType::String).required()),
            ToolMetadata::new("compare_files", "Byte-compare two files for equality.")
                .with_parameter(ToolParameter::new("a", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("b", ToolParameterType::String).required()),
        ])
    }

    async fn get_tool_metadata(
        &self,
        tool_name: &str,
    ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_filesystem_creation() {
        let fs = FileSystemTool::new();
        assert!(fs.root_path.is_none());
        assert!(fs.allowed_extensions.is_none());
    }

    #[tokio::test]
    async fn test_with_root_path() {
        let path = PathBuf::from("/tmp");
        let fs = FileSystemTool::new().with_root_path(path.clone());
        assert_eq!(fs.root_path, Some(path));
    }

    #[tokio::test]
    async fn test_with_allowed_extensions() {
        let fs = FileSystemTool::new()
            .with_allowed_extensions(vec!["txt".to_string(), "md".to_string()]);
        assert!(fs.allowed_extensions.is_some());
    }

    #[tokio::test]
    async fn test_write_and_read_file() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "Hello, World!").await.unwrap();
        let content = fs.read_file("test.txt").await.unwrap();
        assert_eq!(content, "Hello, World!");
    }

    #[tokio::test]
    async fn test_append_file() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "Hello").await.unwrap();
        fs.append_file("test.txt", " World").await.unwrap();

        let content = fs.read_file("test.txt").await.unwrap();
        assert_eq!(content, "Hello World");
    }

    #[tokio::test]
    async fn test_patch_file_unique_match() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "fn main() {\n    old();\n}\n")
            .await
            .unwrap();
        fs.patch_file("test.txt", "old();", "new();").await.unwrap();

        let content = fs.read_file("test.txt").await.unwrap();
        assert!(content.contains("new();"));
    }

    #[tokio::test]
    async fn test_patch_file_ambiguous() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "x\nx\n").await.unwrap();
        let result = fs.patch_file("test.txt", "x", "y").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_patch_file_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "hello").await.unwrap();
        let result = fs.patch_file("test.txt", "missing", "y").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_move_file() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("a.txt", "content").await.unwrap();
        fs.move_file("a.txt", "sub/b.txt").await.unwrap();

        assert!(!fs.file_exists("a.txt").await.unwrap());
        assert_eq!(fs.read_file("sub/b.txt").await.unwrap(), "content");
    }

    #[tokio::test]
    async fn test_file_exists() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "content").await.unwrap();

        assert!(fs.file_exists("test.txt").await.unwrap());
        assert!(!fs.file_exists("nonexistent.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_file() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "content").await.unwrap();
        assert!(fs.file_exists("test.txt").await.unwrap());

        fs.delete_file("test.txt").await.unwrap();
        assert!(!fs.file_exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_file_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "Hello").await.unwrap();
        let metadata = fs.get_file_metadata("test.txt").await.unwrap();

        assert_eq!(metadata.name, "test.txt");
        assert_eq!(metadata.size, 5);
        assert!(!metadata.is_directory);
    }

    #[tokio::test]
    async fn test_create_directory() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.create_directory("subdir").await.unwrap();
        assert!(fs.file_exists("subdir").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_directory() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("file1.txt", "content1").await.unwrap();
        fs.write_file("file2.txt", "content2").await.unwrap();
        fs.create_directory("subdir").await.unwrap();

        let entries = fs.read_directory(".", false).await.unwrap();
        assert_eq!(entries.len(), 3);
    }

    #[tokio::test]
    async fn test_read_directory_excludes_node_modules() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("src/lib.rs", "content").await.unwrap();
        fs.write_file("node_modules/pkg/index.js", "content")
            .await
            .unwrap();

        let entries = fs.read_directory(".", true).await.unwrap();
        assert!(entries.iter().all(|e| e.name != "index.js"));
    }

    #[tokio::test]
    async fn test_get_file_size() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test.txt", "Hello").await.unwrap();
        let size = fs.get_file_size("test.txt").await.unwrap();
        assert_eq!(size, 5);
    }

    #[tokio::test]
    async fn test_path_traversal_prevention() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        let result = fs.read_file("../../../etc/passwd").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_extension_filtering() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new()
            .with_root_path(temp_dir.path().to_path_buf())
            .with_allowed_extensions(vec!["txt".to_string()]);

        fs.write_file("test.txt", "content").await.unwrap();
        let result = fs.write_file("test.pdf", "content");
        assert!(result.await.is_err());
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.create_directory("subdir").await.unwrap();
        fs.write_file("subdir/file.txt", "content").await.unwrap();

        fs.delete_directory("subdir").await.unwrap();
        assert!(!fs.file_exists("subdir").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_files() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("test1.txt", "content").await.unwrap();
        fs.write_file("test2.txt", "content").await.unwrap();
        fs.write_file("other.md", "content").await.unwrap();

        let results = fs.find_files(".", "test", &[]).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_search_in_files() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("a.txt", "alpha\nbeta\n").await.unwrap();
        fs.write_file("b.txt", "gamma\n").await.unwrap();

        let matches = fs.search_in_files(".", "beta").await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "./a.txt");
        assert_eq!(matches[0].line_number, 2);
    }

    #[tokio::test]
    async fn test_compare_files() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("a.txt", "same").await.unwrap();
        fs.write_file("b.txt", "same").await.unwrap();
        fs.write_file("c.txt", "different").await.unwrap();

        assert!(fs.compare_files("a.txt", "b.txt").await.unwrap());
        assert!(!fs.compare_files("a.txt", "c.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_read_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        let result = fs.read_file("nonexistent.txt").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_directory_recursive() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());

        fs.write_file("file1.txt", "content").await.unwrap();
        fs.create_directory("subdir").await.unwrap();
        fs.write_file("subdir/file2.txt", "content").await.unwrap();

        let entries = fs.read_directory(".", true).await.unwrap();
        assert!(entries.len() >= 3);
    }

    #[tokio::test]
    async fn test_project_view_strips_projects_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FileSystemTool::new().with_root_path(temp_dir.path().to_path_buf());
        fs.write_file("README.md", "hello").await.unwrap();

        let view = ProjectView::new(temp_dir.path().to_path_buf(), "proj-1");
        let content = view.read_file("projects/proj-1/README.md").await.unwrap();
        assert_eq!(content, "hello");
    }
}
