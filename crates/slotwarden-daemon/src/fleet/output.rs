//! Shared output channel of a fleet.
//!
//! Consumers read the Leader's output through `<run_dir>/<mode>/current`.
//! On unix this is a symlink swapped atomically with a rename; elsewhere it
//! is a small file holding the target path.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Name of the link inside a mode directory.
pub const CURRENT_LINK: &str = "current";

pub fn link_path(mode_dir: &Path) -> PathBuf {
    mode_dir.join(CURRENT_LINK)
}

/// Point the mode's output link at `target`, replacing any previous target.
pub fn point_current(mode_dir: &Path, target: &Path) -> io::Result<()> {
    std::fs::create_dir_all(mode_dir)?;
    let link = link_path(mode_dir);
    let staging = mode_dir.join(format!(".{CURRENT_LINK}.next"));

    match std::fs::remove_file(&staging) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &staging)?;
    #[cfg(not(unix))]
    std::fs::write(&staging, target.to_string_lossy().as_bytes())?;

    std::fs::rename(&staging, &link)?;
    debug!(link = %link.display(), target = %target.display(), "Output link updated");
    Ok(())
}

/// Current target of the mode's output link, if any.
pub fn current_target(mode_dir: &Path) -> Option<PathBuf> {
    let link = link_path(mode_dir);
    #[cfg(unix)]
    {
        std::fs::read_link(link).ok()
    }
    #[cfg(not(unix))]
    {
        std::fs::read_to_string(link)
            .ok()
            .map(|s| PathBuf::from(s.trim()))
    }
}
