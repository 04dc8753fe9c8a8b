use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use super::{DelegateFs, FileAttributes};
use crate::nodes::join_path;

/// A [DelegateFs] backed by the host file system.
#[derive(Debug, Clone)]
pub struct HostFs {
    case_sensitive: bool,
}

impl Default for HostFs {
    fn default() -> Self {
        Self {
            case_sensitive: !cfg!(any(target_os = "windows", target_os = "macos")),
        }
    }
}

impl HostFs {
    pub fn with_case_sensitivity(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }
}

fn to_millis(time: io::Result<SystemTime>) -> i64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(crate::nodes::TIMESTAMP_UNKNOWN)
}

#[cfg(unix)]
fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_hidden(_path: &Path) -> bool {
    false
}

impl DelegateFs for HostFs {
    fn protocol(&self) -> &str {
        "file"
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn is_local(&self) -> bool {
        true
    }

    #[instrument(skip(self), level = "trace")]
    fn attributes(&self, path: &str) -> io::Result<Option<FileAttributes>> {
        let p = Path::new(path);
        let link_metadata = match fs::symlink_metadata(p) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let is_symlink = link_metadata.file_type().is_symlink();
        // symlinks report the attributes of their target, dangling ones their own
        let metadata = if is_symlink {
            fs::metadata(p).unwrap_or(link_metadata)
        } else {
            link_metadata
        };

        Ok(Some(FileAttributes {
            is_directory: metadata.is_dir(),
            is_symlink,
            is_special: !metadata.is_dir() && !metadata.is_file(),
            is_hidden: is_hidden(p),
            is_writable: !metadata.permissions().readonly(),
            length: if metadata.is_file() { metadata.len() } else { 0 },
            last_modified: to_millis(metadata.modified()),
        }))
    }

    fn list(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        names.sort();
        Ok(names)
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(File::create(path)?))
    }

    fn symlink_target(&self, path: &str) -> io::Result<Option<String>> {
        match fs::read_link(path) {
            Ok(target) => Ok(Some(target.to_string_lossy().replace('\\', "/"))),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_child_file(&self, parent: &str, name: &str) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(join_path(parent, name))?;
        Ok(())
    }

    fn create_child_directory(&self, parent: &str, name: &str) -> io::Result<()> {
        fs::create_dir(join_path(parent, name))
    }

    #[instrument(skip(self))]
    fn delete(&self, path: &str) -> io::Result<()> {
        if fs::symlink_metadata(path)?.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
    }

    fn rename(&self, path: &str, new_name: &str) -> io::Result<()> {
        let target = Path::new(path).with_file_name(new_name);
        fs::rename(path, target)
    }

    fn move_to(&self, path: &str, new_parent: &str) -> io::Result<()> {
        let name = Path::new(path)
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot move a root"))?;
        fs::rename(path, Path::new(new_parent).join(name))
    }

    #[instrument(skip(self))]
    fn copy(&self, path: &str, new_parent: &str, new_name: &str) -> io::Result<()> {
        let source = Path::new(path);
        let target = PathBuf::from(join_path(new_parent, new_name));

        if !fs::metadata(source)?.is_dir() {
            fs::copy(source, &target)?;
            return Ok(());
        }

        for entry in WalkDir::new(source).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let destination = target.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&destination)?;
            } else {
                debug!(from = %entry.path().display(), to = %destination.display(), "copying");
                fs::copy(entry.path(), &destination)?;
            }
        }
        Ok(())
    }

    fn set_writable(&self, path: &str, writable: bool) -> io::Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(!writable);
        fs::set_permissions(path, permissions)
    }

    fn set_timestamp(&self, path: &str, timestamp: i64) -> io::Result<()> {
        let time = UNIX_EPOCH + Duration::from_millis(timestamp.max(0) as u64);
        OpenOptions::new().write(true).open(path)?.set_modified(time)
    }
}
