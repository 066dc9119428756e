// Instance-scoped working directory tree. Exclusively owned by this
// worker process; the `work` subtree is recreated from scratch for every
// submission.
use crate::error::{JudgeError, Result};
use nix::unistd::{Gid, Group, Uid, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WorkDir {
    base: PathBuf,
}

impl WorkDir {
    pub fn new(root: &Path, instance: &str) -> Self {
        Self {
            base: root.join(instance),
        }
    }

    pub fn internal(&self, sub: impl AsRef<Path>) -> PathBuf {
        self.base.join(sub)
    }

    pub fn recreate_work(&self) -> Result<()> {
        let work = self.internal("work");
        let _ = fs::remove_dir_all(&work);
        fs::create_dir_all(&work)?;
        Ok(())
    }
}

/// Assign ownership of everything under `path` to the sandbox runtime
/// user, so the sandboxed process can use its mounts without privilege
/// escalation.
pub fn chown_recursive(path: &Path, user: &str, group: &str) -> Result<()> {
    let uid = User::from_name(user)
        .map_err(|e| JudgeError::Configuration(format!("cannot look up user {user}: {e}")))?
        .ok_or_else(|| JudgeError::Configuration(format!("no such user: {user}")))?
        .uid;
    let gid = Group::from_name(group)
        .map_err(|e| JudgeError::Configuration(format!("cannot look up group {group}: {e}")))?
        .ok_or_else(|| JudgeError::Configuration(format!("no such group: {group}")))?
        .gid;

    chown_walk(path, uid, gid)
}

fn chown_walk(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    nix::unistd::chown(path, Some(uid), Some(gid))
        .map_err(|e| JudgeError::Configuration(format!("chown {} failed: {e}", path.display())))?;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_walk(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// World-writable data area: 0777 directories, 0666 files, so the
/// sandbox user can create and modify scratch files.
pub fn grant_data_permissions(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;

    for entry in fs::read_dir(path)? {
        let entry_path = entry?.path();
        if entry_path.is_dir() {
            grant_data_permissions(&entry_path)?;
        } else {
            fs::set_permissions(&entry_path, fs::Permissions::from_mode(0o666))?;
        }
    }
    Ok(())
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_path_is_instance_scoped() {
        let wd = WorkDir::new(Path::new("/tmp/verdict"), "w1");
        assert_eq!(
            wd.internal("work/run/out"),
            PathBuf::from("/tmp/verdict/w1/work/run/out")
        );
    }

    #[test]
    fn recreate_work_wipes_previous_contents() {
        let root = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(root.path(), "w1");

        wd.recreate_work().unwrap();
        fs::write(wd.internal("work/stale.txt"), b"old").unwrap();
        wd.recreate_work().unwrap();

        assert!(wd.internal("work").is_dir());
        assert!(!wd.internal("work/stale.txt").exists());
    }

    #[test]
    fn copies_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("nested/b.txt"), b"b").unwrap();

        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"a");
        assert_eq!(fs::read(dst.join("nested/b.txt")).unwrap(), b"b");
    }

    #[test]
    fn data_permissions_are_world_writable() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(data.join("sub")).unwrap();
        fs::write(data.join("sub/f.txt"), b"x").unwrap();

        grant_data_permissions(&data).unwrap();

        let dir_mode = fs::metadata(data.join("sub")).unwrap().permissions().mode();
        let file_mode = fs::metadata(data.join("sub/f.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o777);
        assert_eq!(file_mode & 0o777, 0o666);
    }
}
