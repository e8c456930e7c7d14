//! Best-effort filesystem classification for the watched path.
//!
//! Native change notifications are unreliable on network filesystems, so the
//! watcher falls back to polling when the file lives on one.

use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilesystemType {
    #[default]
    Unknown,
    Local,
    Nfs,
    Smb,
    Sshfs,
    Fuse,
}

impl FilesystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Unknown => "unknown",
            FilesystemType::Local => "local",
            FilesystemType::Nfs => "nfs",
            FilesystemType::Smb => "smb",
            FilesystemType::Sshfs => "sshfs",
            FilesystemType::Fuse => "fuse",
        }
    }

    /// Network filesystems where inotify-style events cannot be trusted.
    pub fn is_remote(&self) -> bool {
        matches!(self, FilesystemType::Nfs | FilesystemType::Smb | FilesystemType::Sshfs)
    }

    /// Map a `/proc/mounts` type column onto a classification.
    pub fn from_mount_type(fstype: &str) -> Self {
        match fstype {
            "nfs" | "nfs4" => FilesystemType::Nfs,
            "cifs" | "smbfs" | "smb3" => FilesystemType::Smb,
            "fuse.sshfs" | "sshfs" => FilesystemType::Sshfs,
            t if t == "fuse" || t.starts_with("fuse.") => FilesystemType::Fuse,
            "" => FilesystemType::Unknown,
            _ => FilesystemType::Local,
        }
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify the filesystem holding `path`. Unknown off Linux or on any error.
pub fn detect(path: &Path) -> FilesystemType {
    if path.as_os_str().is_empty() {
        return FilesystemType::Unknown;
    }
    let target = existing_ancestor(path);
    match std::fs::read_to_string("/proc/mounts") {
        Ok(mounts) => classify_from_mounts(&mounts, &target),
        Err(_) => FilesystemType::Unknown,
    }
}

/// The path itself, or its nearest existing ancestor, canonicalized.
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Pick the longest mount point that prefixes `target`.
pub fn classify_from_mounts(mounts: &str, target: &Path) -> FilesystemType {
    mounts
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let _device = cols.next()?;
            let mount_point = unescape_mount_point(cols.next()?);
            let fstype = cols.next()?;
            Some((mount_point, fstype))
        })
        .filter(|(mount_point, _)| target.starts_with(mount_point))
        .max_by_key(|(mount_point, _)| mount_point.as_os_str().len())
        .map(|(_, fstype)| FilesystemType::from_mount_type(fstype))
        .unwrap_or_default()
}

/// `/proc/mounts` octal-escapes spaces and tabs in mount points.
fn unescape_mount_point(raw: &str) -> PathBuf {
    PathBuf::from(
        raw.replace("\\040", " ")
            .replace("\\011", "\t")
            .replace("\\134", "\\"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTS: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
server:/export /mnt/shared nfs4 rw 0 0
//host/share /mnt/win cifs rw 0 0
user@host:/home /mnt/remote\\040home fuse.sshfs rw 0 0
";

    #[test]
    fn test_classify_longest_prefix() {
        assert_eq!(
            classify_from_mounts(MOUNTS, Path::new("/home/me/.beads/issues.jsonl")),
            FilesystemType::Local
        );
        assert_eq!(
            classify_from_mounts(MOUNTS, Path::new("/mnt/shared/proj/issues.jsonl")),
            FilesystemType::Nfs
        );
        assert_eq!(classify_from_mounts(MOUNTS, Path::new("/mnt/win/x")), FilesystemType::Smb);
        assert_eq!(
            classify_from_mounts(MOUNTS, Path::new("/mnt/remote home/x")),
            FilesystemType::Sshfs
        );
    }

    #[test]
    fn test_remote_classification() {
        assert!(FilesystemType::Nfs.is_remote());
        assert!(FilesystemType::Sshfs.is_remote());
        assert!(!FilesystemType::Fuse.is_remote());
        assert!(!FilesystemType::Local.is_remote());
        assert_eq!(FilesystemType::from_mount_type("fuse.rclone"), FilesystemType::Fuse);
        assert_eq!(FilesystemType::Smb.to_string(), "smb");
    }

    #[test]
    fn test_detect_empty_path_is_unknown() {
        assert_eq!(detect(Path::new("")), FilesystemType::Unknown);
    }
}
