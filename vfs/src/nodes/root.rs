use std::path::PathBuf;

use path_clean::PathClean;

/// Describes how a root entry maps onto its delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootKind {
    /// A plain directory, addressed by its absolute path.
    Directory { path: String },

    /// The inside of an archive. `local_path` points to the archive file,
    /// paths inside it are rendered as `local_path` + `separator` + inner path.
    Archive {
        local_path: String,
        separator: String,
    },
}

impl RootKind {
    /// Classifies `base_path`. If the delegate declares an archive separator
    /// and the path contains it, the part in front of it is the archive file.
    pub fn for_path(base_path: &str, archive_separator: Option<&str>) -> Self {
        if let Some(separator) = archive_separator {
            if let Some(ix) = base_path.find(separator) {
                return RootKind::Archive {
                    local_path: clean_path(&base_path[..ix]),
                    separator: separator.to_string(),
                };
            }
            // a separator without a trailing slash ("!/" vs "!")
            let trimmed = separator.trim_end_matches('/');
            if !trimmed.is_empty() {
                if let Some(local) = base_path.strip_suffix(trimmed) {
                    return RootKind::Archive {
                        local_path: clean_path(local),
                        separator: separator.to_string(),
                    };
                }
            }
        }

        RootKind::Directory {
            path: clean_path(base_path),
        }
    }

    /// The name of a root entry.
    /// Directory roots are named by their full path, archive roots by the file
    /// name of the archive.
    pub fn name(&self) -> String {
        match self {
            RootKind::Directory { path } => path.clone(),
            RootKind::Archive { local_path, .. } => local_path
                .rsplit('/')
                .find(|s| !s.is_empty())
                .unwrap_or(local_path)
                .to_string(),
        }
    }

    /// The rendered path of the root itself.
    pub fn path(&self) -> String {
        match self {
            RootKind::Directory { path } if is_drive(path) => format!("{}/", path),
            RootKind::Directory { path } => path.clone(),
            RootKind::Archive {
                local_path,
                separator,
            } => format!("{}{}", local_path, separator),
        }
    }

    /// The prefix child paths get appended to.
    /// Unlike [RootKind::path], this does not add a slash to drive roots.
    pub fn child_prefix(&self) -> String {
        match self {
            RootKind::Directory { path } => path.clone(),
            RootKind::Archive { .. } => self.path(),
        }
    }

    /// The path of the archive file, if this is an archive root.
    pub fn local_path(&self) -> Option<&str> {
        match self {
            RootKind::Archive { local_path, .. } => Some(local_path),
            RootKind::Directory { .. } => None,
        }
    }
}

/// Returns true for bare windows drive names like `C:`.
fn is_drive(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Converts to a system-independent, lexically cleaned path without trailing
/// slashes (except for `/` itself).
pub(crate) fn clean_path(path: &str) -> String {
    let independent = path.replace('\\', "/");
    if independent.is_empty() {
        return independent;
    }
    let cleaned = PathBuf::from(&independent)
        .clean()
        .to_string_lossy()
        .replace('\\', "/");

    if cleaned.len() > 1 {
        cleaned.trim_end_matches('/').to_string()
    } else {
        cleaned
    }
}
