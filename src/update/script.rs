//! Install script - Rendered shell script that performs the atomic swap
//!
//! The running application cannot replace its own bundle: it must exit to
//! release its file locks. So the final move runs in a small generated shell
//! script, launched detached from our process group, which waits for us to
//! exit, swaps the staged bundle into place with a backup, and restores the
//! backup on any failure past the destructive point.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use uuid::Uuid;

use crate::platform;

/// Everything the script template needs.
#[derive(Debug, Clone)]
pub struct ScriptParams {
    /// The staged, already-downloaded bundle to install
    pub staged: PathBuf,
    /// The bundle being replaced
    pub target: PathBuf,
    /// Where the current bundle is parked during the swap
    pub backup: PathBuf,
    /// Our own pid; the script waits (bounded) for it to exit
    pub wait_pid: Option<u32>,
    /// Upper bound on the wait; the script proceeds afterwards regardless
    pub wait_secs: u64,
    /// Launch the new bundle once it is in place
    pub relaunch: bool,
    /// Delay before the backup is deleted after a successful swap
    pub cleanup_delay_secs: u64,
}

impl ScriptParams {
    pub fn new(staged: PathBuf, target: PathBuf, backup: PathBuf) -> Self {
        Self {
            staged,
            target,
            backup,
            wait_pid: None,
            wait_secs: 10,
            relaunch: true,
            cleanup_delay_secs: 5,
        }
    }
}

/// Render the install script.
///
/// Invariant: the backup exists before any destructive step, and every
/// failure after the backup is created funnels through `restore_and_fail`.
/// The script deletes itself on every exit path.
pub fn render(params: &ScriptParams) -> String {
    let staged = params.staged.display();
    let target = params.target.display();
    let backup = params.backup.display();

    let wait_block = match params.wait_pid {
        Some(pid) => format!(
            r#"i=0
while [ "$i" -lt {secs} ] && kill -0 {pid} 2>/dev/null; do
    sleep 1
    i=$((i+1))
done"#,
            secs = params.wait_secs,
            pid = pid
        ),
        None => "# no running process to wait for".to_string(),
    };

    let relaunch_block = if params.relaunch {
        r#"open "$TARGET" 2>/dev/null"#
    } else {
        "# relaunch disabled"
    };

    format!(
        r#"#!/bin/sh
# Finishes a MultiClone update: swaps the staged bundle into place once the
# old process exits, restoring the backup if anything goes wrong.
set -u

STAGED="{staged}"
TARGET="{target}"
BACKUP="{backup}"
SELF="$0"

restore_and_fail() {{
    rm -rf "$TARGET"
    mv "$BACKUP" "$TARGET" 2>/dev/null
    rm -f -- "$SELF"
    exit 1
}}

# Wait (bounded) for the old process to release its files.
{wait_block}

# A backup left over from an earlier attempt is stale.
rm -rf "$BACKUP"

if ! mv "$TARGET" "$BACKUP"; then
    rm -f -- "$SELF"
    exit 1
fi

if ! cp -pR "$STAGED" "$TARGET"; then
    restore_and_fail
fi

chmod -R u+w "$TARGET" 2>/dev/null
xattr -dr com.apple.quarantine "$TARGET" 2>/dev/null

if [ ! -d "$TARGET" ]; then
    restore_and_fail
fi

{relaunch_block}

sleep {cleanup_delay}
rm -rf "$BACKUP"
rm -f -- "$SELF"
exit 0
"#,
        staged = staged,
        target = target,
        backup = backup,
        wait_block = wait_block,
        relaunch_block = relaunch_block,
        cleanup_delay = params.cleanup_delay_secs,
    )
}

/// Write a rendered script into `dir` with a unique name, executable.
pub fn write_script(dir: &Path, contents: &str) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("install-{}.sh", Uuid::new_v4()));
    std::fs::write(&path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }

    Ok(path)
}

/// Launches a rendered script. The real executor detaches it from our
/// process group; tests substitute a recorder.
pub trait ScriptExecutor: Send + Sync {
    fn execute(&self, script: &Path, admin: bool) -> Result<()>;
}

/// Executor that runs the script detached via `/bin/sh`, or through the
/// platform elevation path when `admin` is set.
pub struct DetachedScriptExecutor;

impl ScriptExecutor for DetachedScriptExecutor {
    fn execute(&self, script: &Path, admin: bool) -> Result<()> {
        if admin {
            #[cfg(target_os = "macos")]
            {
                return platform::macos::spawn_script_elevated(script);
            }
            #[cfg(not(target_os = "macos"))]
            anyhow::bail!("Elevated install is not supported on this platform");
        }
        platform::spawn_detached("/bin/sh", &[OsStr::new(script)])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn make_bundle(path: &Path, payload: &str) {
        std::fs::create_dir_all(path.join("Contents")).unwrap();
        std::fs::write(path.join("Contents/payload"), payload).unwrap();
    }

    fn read_payload(path: &Path) -> String {
        std::fs::read_to_string(path.join("Contents/payload")).unwrap()
    }

    fn run(script: &Path) -> std::process::ExitStatus {
        Command::new("/bin/sh")
            .arg(script)
            .status()
            .expect("run /bin/sh")
    }

    fn params(dir: &Path) -> ScriptParams {
        ScriptParams {
            staged: dir.join("staged/App.app"),
            target: dir.join("installed/App.app"),
            backup: dir.join("installed/App.backup.app"),
            wait_pid: None,
            wait_secs: 0,
            relaunch: false,
            cleanup_delay_secs: 0,
        }
    }

    #[test]
    fn successful_install_swaps_bundle_and_removes_backup() {
        let dir = TempDir::new().unwrap();
        let p = params(dir.path());
        make_bundle(&p.staged, "new");
        make_bundle(&p.target, "old");
        // A stale backup from an earlier attempt must not get in the way.
        make_bundle(&p.backup, "stale");

        let script = write_script(&dir.path().join("scripts"), &render(&p)).unwrap();
        let status = run(&script);

        assert!(status.success());
        assert_eq!(read_payload(&p.target), "new");
        assert!(!p.backup.exists(), "backup deleted after success");
        assert!(!script.exists(), "script is self-deleting");
    }

    #[test]
    fn failure_after_backup_restores_previous_bundle() {
        let dir = TempDir::new().unwrap();
        let p = params(dir.path());
        // No staged bundle: the copy step fails after the backup was taken.
        make_bundle(&p.target, "old");

        let script = write_script(&dir.path().join("scripts"), &render(&p)).unwrap();
        let status = run(&script);

        assert!(!status.success());
        assert_eq!(read_payload(&p.target), "old", "target restored");
        assert!(!p.backup.exists(), "backup moved back, not leaked");
        assert!(!script.exists(), "script is self-deleting on failure too");
    }

    #[test]
    fn wait_block_tracks_the_pid_parameter() {
        let dir = TempDir::new().unwrap();
        let mut p = params(dir.path());
        assert!(render(&p).contains("no running process"));

        p.wait_pid = Some(4242);
        p.wait_secs = 10;
        let rendered = render(&p);
        assert!(rendered.contains("kill -0 4242"));
        assert!(rendered.contains(r#"[ "$i" -lt 10 ]"#));
    }

    #[test]
    fn relaunch_line_is_optional() {
        let dir = TempDir::new().unwrap();
        let mut p = params(dir.path());
        assert!(!render(&p).contains("open \"$TARGET\""));
        p.relaunch = true;
        assert!(render(&p).contains("open \"$TARGET\""));
    }
}
