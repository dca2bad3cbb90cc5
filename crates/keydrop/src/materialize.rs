//! File materializer
//!
//! Secret content reaches its destination through a temp file in the same
//! directory. Ownership and mode are set on the temp file before the rename,
//! so the destination never exists with the wrong content or permissions.
//!
//! When rollback is enabled every destination touched by a run is recorded
//! in a [`RollbackJournal`] first. The previous file is kept as a hard link
//! next to the destination, which makes restoring it a single rename.

use std::ffi::CString;
use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::FsError;
use crate::manifest::SecretSpec;

/// Mode for directories created on the way to a destination
const DIR_MODE: u32 = 0o755;

/// Suffix of the hard link that preserves a destination's previous content
const ROLLBACK_SUFFIX: &str = "keydrop-rollback";

/// Numeric owner and group to apply, `None` leaves the current value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Ownership {
    /// Resolve a secret's owner and group through the system databases
    pub fn resolve(owner: Option<&str>, group: Option<&str>) -> Result<Self, FsError> {
        let uid = owner
            .map(|name| lookup_id(name, IdKind::User))
            .transpose()?;
        let gid = group
            .map(|name| lookup_id(name, IdKind::Group))
            .transpose()?;
        Ok(Self { uid, gid })
    }

    fn is_noop(&self) -> bool {
        self.uid.is_none() && self.gid.is_none()
    }
}

#[derive(Clone, Copy)]
enum IdKind {
    User,
    Group,
}

/// Numeric ids pass through, names go through getpwnam_r/getgrnam_r
fn lookup_id(name: &str, kind: IdKind) -> Result<u32, FsError> {
    let unknown = || match kind {
        IdKind::User => FsError::UnknownUser(name.to_string()),
        IdKind::Group => FsError::UnknownGroup(name.to_string()),
    };

    if let Ok(id) = name.parse::<u32>() {
        return Ok(id);
    }

    let cname = CString::new(name).map_err(|_| unknown())?;
    let mut buf_len = 4096usize;

    loop {
        let mut buf = vec![0 as libc::c_char; buf_len];
        let rc;
        let found;
        let id;

        // SAFETY: every pointer refers to a live local of the expected type,
        // and the buffer length passed matches the allocation.
        unsafe {
            match kind {
                IdKind::User => {
                    let mut pwd: libc::passwd = std::mem::zeroed();
                    let mut result: *mut libc::passwd = std::ptr::null_mut();
                    rc = libc::getpwnam_r(
                        cname.as_ptr(),
                        &mut pwd,
                        buf.as_mut_ptr(),
                        buf.len(),
                        &mut result,
                    );
                    found = !result.is_null();
                    id = pwd.pw_uid;
                }
                IdKind::Group => {
                    let mut grp: libc::group = std::mem::zeroed();
                    let mut result: *mut libc::group = std::ptr::null_mut();
                    rc = libc::getgrnam_r(
                        cname.as_ptr(),
                        &mut grp,
                        buf.as_mut_ptr(),
                        buf.len(),
                        &mut result,
                    );
                    found = !result.is_null();
                    id = grp.gr_gid;
                }
            }
        }

        if rc == libc::ERANGE && buf_len < 1 << 20 {
            buf_len *= 2;
            continue;
        }
        return if rc == 0 && found { Ok(id) } else { Err(unknown()) };
    }
}

/// What a destination looked like before the run touched it
#[derive(Debug, Clone, PartialEq, Eq)]
enum Original {
    /// Content was not rewritten
    Untouched,
    /// The destination did not exist
    Absent,
    /// Previous content lives at this path
    Preserved(PathBuf),
}

#[derive(Debug, Clone)]
struct JournalEntry {
    destination: PathBuf,
    original: Original,
    created_links: Vec<PathBuf>,
}

/// Record of everything a run changed, for all-or-nothing rollback
#[derive(Debug, Default)]
pub struct RollbackJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl RollbackJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<JournalEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Keep the current destination content before it is replaced
    fn preserve(&self, destination: &Path) -> Result<(), FsError> {
        let original = match fs::symlink_metadata(destination) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Original::Absent,
            Err(e) => return Err(FsError::io("Inspecting", destination, e)),
            Ok(_) => {
                let backup = sibling(destination, ROLLBACK_SUFFIX);
                remove_if_exists(&backup)?;
                if fs::hard_link(destination, &backup).is_err() {
                    fs::copy(destination, &backup)
                        .map_err(|e| FsError::io("Preserving", destination, e))?;
                }
                Original::Preserved(backup)
            }
        };

        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.destination == destination) {
            Some(entry) if entry.original == Original::Untouched => entry.original = original,
            Some(_) => {}
            None => entries.push(JournalEntry {
                destination: destination.to_path_buf(),
                original,
                created_links: Vec::new(),
            }),
        }
        Ok(())
    }

    fn link_created(&self, destination: &Path, link: &Path) {
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.destination == destination) {
            Some(entry) => entry.created_links.push(link.to_path_buf()),
            None => entries.push(JournalEntry {
                destination: destination.to_path_buf(),
                original: Original::Untouched,
                created_links: vec![link.to_path_buf()],
            }),
        }
    }

    /// Number of destinations recorded
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Put every recorded destination back the way it was
    ///
    /// Keeps going after a failure and returns every error seen.
    pub fn restore(&self) -> Vec<FsError> {
        let entries = std::mem::take(&mut *self.entries());
        let mut errors = Vec::new();

        for entry in entries.into_iter().rev() {
            for link in entry.created_links.iter().rev() {
                if let Err(e) = remove_if_exists(link) {
                    errors.push(e);
                }
            }
            let result = match &entry.original {
                Original::Untouched => Ok(()),
                Original::Absent => remove_if_exists(&entry.destination),
                Original::Preserved(backup) => fs::rename(backup, &entry.destination)
                    .map_err(|e| FsError::io("Restoring", &entry.destination, e)),
            };
            if let Err(e) = result {
                errors.push(e);
            }
        }
        errors
    }

    /// Drop preserved copies after a run that does not need them
    pub fn discard(&self) {
        let entries = std::mem::take(&mut *self.entries());
        for entry in entries {
            if let Original::Preserved(backup) = entry.original {
                if let Err(e) = remove_if_exists(&backup) {
                    tracing::warn!("Failed to remove rollback copy: {}", e);
                }
            }
        }
    }
}

/// Writes secrets and keeps their metadata and symlinks in shape
#[derive(Debug, Clone, Default)]
pub struct Materializer {
    /// Extra attempts after a transient OS error
    write_retries: u32,
}

impl Materializer {
    pub fn new(write_retries: u32) -> Self {
        Self { write_retries }
    }

    /// Atomically write new content, then make sure symlinks point at it
    pub fn write(
        &self,
        spec: &SecretSpec,
        content: &[u8],
        journal: Option<&RollbackJournal>,
    ) -> Result<(), FsError> {
        let ownership = Ownership::resolve(spec.owner.as_deref(), spec.group.as_deref())?;

        // A conflicting symlink path fails the secret before its content lands
        for link in &spec.symlinks {
            check_symlink(link, &spec.path)?;
        }

        if let Some(parent) = spec.path.parent() {
            self.retry(|| create_dirs(parent))?;
        }
        if let Some(journal) = journal {
            journal.preserve(&spec.path)?;
        }

        self.retry(|| write_atomic(&spec.path, content, spec.mode, ownership))?;
        self.link_all(spec, journal)
    }

    /// Re-apply owner, group, mode and symlinks without touching content
    pub fn reassert(
        &self,
        spec: &SecretSpec,
        journal: Option<&RollbackJournal>,
    ) -> Result<(), FsError> {
        let ownership = Ownership::resolve(spec.owner.as_deref(), spec.group.as_deref())?;
        for link in &spec.symlinks {
            check_symlink(link, &spec.path)?;
        }
        self.retry(|| apply_metadata(&spec.path, spec.mode, ownership))?;
        self.link_all(spec, journal)
    }

    fn link_all(
        &self,
        spec: &SecretSpec,
        journal: Option<&RollbackJournal>,
    ) -> Result<(), FsError> {
        for link in &spec.symlinks {
            let created = self.retry(|| ensure_symlink(link, &spec.path))?;
            if created {
                tracing::debug!(secret = %spec.name, link = %link.display(), "Created symlink");
                if let Some(journal) = journal {
                    journal.link_created(&spec.path, link);
                }
            }
        }
        Ok(())
    }

    fn retry<T>(&self, mut op: impl FnMut() -> Result<T, FsError>) -> Result<T, FsError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.write_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "Transient filesystem error, retrying: {}", e);
                }
                result => return result,
            }
        }
    }
}

fn create_dirs(dir: &Path) -> Result<(), FsError> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| FsError::io("Creating directory", dir, e))
}

/// Temp file in the destination directory, metadata first, then rename
fn write_atomic(
    path: &Path,
    content: &[u8],
    mode: u32,
    ownership: Ownership,
) -> Result<(), FsError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| FsError::io("Creating temp file for", path, e))?;

    tmp.write_all(content)
        .map_err(|e| FsError::io("Writing", path, e))?;

    // chown before chmod: changing owner clears setuid/setgid bits
    if !ownership.is_noop() {
        std::os::unix::fs::fchown(tmp.as_file(), ownership.uid, ownership.gid)
            .map_err(|e| FsError::io("Changing owner of", path, e))?;
    }
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(|e| FsError::io("Setting mode on", path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("Syncing", path, e))?;

    tmp.persist(path)
        .map_err(|e| FsError::io("Renaming into place", path, e.error))?;
    sync_dir(parent)
}

/// Flush a directory so a rename inside it survives a crash
fn sync_dir(dir: &Path) -> Result<(), FsError> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| FsError::io("Syncing directory", dir, e))
}

fn apply_metadata(path: &Path, mode: u32, ownership: Ownership) -> Result<(), FsError> {
    let meta = fs::metadata(path).map_err(|e| FsError::io("Inspecting", path, e))?;

    if !ownership.is_noop() {
        use std::os::unix::fs::MetadataExt;
        let uid_differs = ownership.uid.is_some_and(|uid| uid != meta.uid());
        let gid_differs = ownership.gid.is_some_and(|gid| gid != meta.gid());
        if uid_differs || gid_differs {
            std::os::unix::fs::chown(path, ownership.uid, ownership.gid)
                .map_err(|e| FsError::io("Changing owner of", path, e))?;
        }
    }

    if meta.permissions().mode() & 0o7777 != mode || !ownership.is_noop() {
        fs::set_permissions(path, Permissions::from_mode(mode))
            .map_err(|e| FsError::io("Setting mode on", path, e))?;
    }
    Ok(())
}

/// What is currently at a symlink path
enum LinkState {
    Missing,
    Correct,
}

/// Fail if anything at `link` other than a symlink to `target` is in the way
fn check_symlink(link: &Path, target: &Path) -> Result<LinkState, FsError> {
    match fs::symlink_metadata(link) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LinkState::Missing),
        Err(e) => Err(FsError::io("Inspecting", link, e)),
        Ok(meta) if meta.file_type().is_symlink() => {
            let current =
                fs::read_link(link).map_err(|e| FsError::io("Reading symlink", link, e))?;
            let current = if current.is_relative() {
                link.parent().unwrap_or_else(|| Path::new("/")).join(current)
            } else {
                current
            };
            if same_path(&current, target) {
                Ok(LinkState::Correct)
            } else {
                Err(FsError::SymlinkConflict {
                    path: link.to_path_buf(),
                    reason: format!(
                        "points at {} instead of {}",
                        current.display(),
                        target.display()
                    ),
                })
            }
        }
        Ok(meta) => Err(FsError::SymlinkConflict {
            path: link.to_path_buf(),
            reason: if meta.is_dir() {
                "a directory is in the way".to_string()
            } else {
                "a regular file is in the way".to_string()
            },
        }),
    }
}

/// Make `link` a symlink to `target`; returns whether it was created
///
/// Anything already at `link` that is not a symlink to `target` is a
/// conflict and is left alone.
fn ensure_symlink(link: &Path, target: &Path) -> Result<bool, FsError> {
    match check_symlink(link, target)? {
        LinkState::Correct => Ok(false),
        LinkState::Missing => {
            if let Some(parent) = link.parent() {
                create_dirs(parent)?;
            }
            std::os::unix::fs::symlink(target, link)
                .map_err(|e| FsError::io("Creating symlink", link, e))?;
            Ok(true)
        }
    }
}

/// Compare paths lexically after resolving `.` and `..`
fn same_path(a: &Path, b: &Path) -> bool {
    use std::path::Component;
    let clean = |p: &Path| -> PathBuf {
        let mut out = PathBuf::new();
        for component in p.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    out.pop();
                }
                other => out.push(other),
            }
        }
        out
    };
    clean(a) == clean(b)
}

/// `/dir/name` -> `/dir/.name.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, suffix))
}

fn remove_if_exists(path: &Path) -> Result<(), FsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FsError::io("Removing", path, e)),
    }
}
