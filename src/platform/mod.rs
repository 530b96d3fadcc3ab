//! Platform-specific process, bundle, and privilege primitives

#[cfg(target_os = "macos")]
pub mod macos;

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::Result;

/// Terminate a process gracefully
pub fn terminate_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGTERM) == 0 {
                Ok(())
            } else {
                anyhow::bail!(
                    "Failed to terminate process: {}",
                    std::io::Error::last_os_error()
                )
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGKILL) == 0 {
                Ok(())
            } else {
                anyhow::bail!(
                    "Failed to kill process: {}",
                    std::io::Error::last_os_error()
                )
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // kill with signal 0 checks if process exists without sending a signal
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Open or activate the application bundle at `path`.
pub fn open_application(path: &Path, activate: bool) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        macos::open_application(path, activate)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = activate;
        open::that(path).map_err(|e| anyhow::anyhow!("Failed to open {:?}: {}", path, e))
    }
}

/// Rewrite a bundle's identity metadata and display name in place.
pub fn rewrite_bundle_identity(bundle: &Path, identity: &str, display_name: &str) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        macos::rewrite_bundle_identity(bundle, identity, display_name)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = (bundle, identity, display_name);
        anyhow::bail!("Unsupported platform")
    }
}

/// Remove the download-quarantine marker from a bundle tree.
pub fn strip_quarantine(bundle: &Path) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        macos::strip_quarantine(bundle)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = bundle;
        anyhow::bail!("Unsupported platform")
    }
}

/// Apply a local ad-hoc signature to a bundle.
pub fn sign_adhoc(bundle: &Path) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        macos::sign_adhoc(bundle)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = bundle;
        anyhow::bail!("Unsupported platform")
    }
}

/// Make the OS application-discovery cache pick up a new or changed bundle.
pub fn refresh_discovery_cache(bundle: &Path) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        macos::refresh_discovery_cache(bundle)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = bundle;
        anyhow::bail!("Unsupported platform")
    }
}

/// Unpack a downloaded package (disk image) and copy the application bundle
/// inside it into `dest_dir`. Returns the extracted bundle path.
pub fn extract_package(package: &Path, dest_dir: &Path) -> Result<std::path::PathBuf> {
    #[cfg(target_os = "macos")]
    {
        macos::extract_dmg(package, dest_dir)
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = (package, dest_dir);
        anyhow::bail!("Unsupported platform")
    }
}

/// Run a one-shot elevated-privilege probe. `Ok(true)` means the user
/// granted administrator rights; `Ok(false)` means they declined.
pub fn authorize_admin() -> Result<bool> {
    #[cfg(target_os = "macos")]
    {
        macos::authorize_admin()
    }
    #[cfg(not(target_os = "macos"))]
    {
        anyhow::bail!("Unsupported platform")
    }
}

/// Spawn a command fully detached from our process group, with no inherited
/// stdio. The child survives our exit; we never wait on it.
pub fn spawn_detached(program: impl AsRef<OsStr>, args: &[&OsStr]) -> Result<u32> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(0x00000008); // DETACHED_PROCESS
    }

    let child = cmd.spawn()?;
    Ok(child.id())
}
