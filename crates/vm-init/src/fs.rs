//! Filesystem access used by boot and provisioning.
//!
//! Everything that touches guest paths goes through [`Fs`] so the same code
//! runs against the real root ([`OsFs`]) or an in-memory tree ([`MemFs`]).
//! Paths are always absolute guest paths.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{DirBuilder, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub type SharedFs = Arc<dyn Fs>;

pub trait Fs: Send + Sync + fmt::Debug {
    /// Create `path` and any missing parents. Directories that are created
    /// get `mode` exactly; existing ones are left alone.
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()>;

    /// Create or truncate a file. `mode` applies when the file is created.
    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Names of the entries directly under `path`.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Create `link` pointing at `target`. The target is stored verbatim.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        String::from_utf8(self.read_file(path)?)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

// ---------------------------------------------------------------------------
// OsFs
// ---------------------------------------------------------------------------

/// The real filesystem, rooted at `root` (`/` in the guest).
#[derive(Debug, Clone)]
pub struct OsFs {
    root: PathBuf,
}

impl OsFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

impl Fs for OsFs {
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let full = self.resolve(path);
        // Only the missing suffix of the path is created; the umask must not
        // weaken modes such as 01777, so permissions are set explicitly.
        let missing: Vec<PathBuf> = full
            .ancestors()
            .take_while(|p| !p.exists())
            .map(Path::to_path_buf)
            .collect();
        DirBuilder::new().recursive(true).mode(mode).create(&full)?;
        for dir in missing {
            std::fs::set_permissions(&dir, Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(self.resolve(path))?;
        file.write_all(data)
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.resolve(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        std::os::unix::fs::chown(self.resolve(path), Some(uid), Some(gid))
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(link))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).symlink_metadata().is_ok()
    }
}

// ---------------------------------------------------------------------------
// MemFs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir { mode: u32, uid: u32, gid: u32 },
    File { data: Vec<u8>, mode: u32, uid: u32, gid: u32 },
    Symlink(PathBuf),
}

/// In-memory tree for tests. `/` always exists.
#[derive(Debug)]
pub struct MemFs {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            PathBuf::from("/"),
            Node::Dir {
                mode: 0o755,
                uid: 0,
                gid: 0,
            },
        );
        Self {
            nodes: Mutex::new(nodes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node(&self, path: impl AsRef<Path>) -> Option<Node> {
        self.lock().get(path.as_ref()).cloned()
    }

    /// Seed a file, creating its parents with mode 0755.
    pub fn add_file(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> io::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent, 0o755)?;
        }
        self.write_file(path, data.as_ref(), 0o644)
    }

    /// Every path in the tree, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
}

impl Fs for MemFs {
    fn create_dir_all(&self, path: &Path, mode: u32) -> io::Result<()> {
        let mut nodes = self.lock();
        let mut ancestors: Vec<&Path> = path.ancestors().collect();
        ancestors.reverse();
        for dir in ancestors {
            match nodes.get(dir) {
                Some(Node::Dir { .. }) => {}
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} is not a directory", dir.display()),
                    ));
                }
                None => {
                    nodes.insert(dir.to_path_buf(), Node::Dir { mode, uid: 0, gid: 0 });
                }
            }
        }
        Ok(())
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
        let mut nodes = self.lock();
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        if !matches!(nodes.get(parent), Some(Node::Dir { .. })) {
            return Err(not_found(parent));
        }
        let node = match nodes.remove(path) {
            Some(Node::File { mode, uid, gid, .. }) => Node::File {
                data: data.to_vec(),
                mode,
                uid,
                gid,
            },
            Some(Node::Dir { .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::IsADirectory,
                    path.display().to_string(),
                ));
            }
            _ => Node::File {
                data: data.to_vec(),
                mode,
                uid: 0,
                gid: 0,
            },
        };
        nodes.insert(path.to_path_buf(), node);
        Ok(())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.lock().get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            _ => Err(not_found(path)),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let nodes = self.lock();
        if !matches!(nodes.get(path), Some(Node::Dir { .. })) {
            return Err(not_found(path));
        }
        Ok(nodes
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    fn chown(&self, path: &Path, new_uid: u32, new_gid: u32) -> io::Result<()> {
        match self.lock().get_mut(path) {
            Some(Node::Dir { uid, gid, .. } | Node::File { uid, gid, .. }) => {
                *uid = new_uid;
                *gid = new_gid;
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        let mut nodes = self.lock();
        if nodes.contains_key(link) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                link.display().to_string(),
            ));
        }
        nodes.insert(link.to_path_buf(), Node::Symlink(target.to_path_buf()));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }
}
