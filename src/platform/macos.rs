//! macOS bundle identity, signing, and privilege primitives

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

const LSREGISTER: &str = "/System/Library/Frameworks/CoreServices.framework/Frameworks/LaunchServices.framework/Support/lsregister";

/// Open or activate an application bundle via LaunchServices.
pub fn open_application(path: &Path, activate: bool) -> Result<()> {
    let mut cmd = Command::new("open");
    if !activate {
        cmd.arg("-g");
    }
    let status = cmd
        .arg(path)
        .status()
        .context("Failed to run open")?;
    if !status.success() {
        anyhow::bail!("open exited with {} for {:?}", status, path);
    }
    Ok(())
}

/// Get the Info.plist path from an app bundle
pub fn info_plist_path(app_path: &Path) -> Option<PathBuf> {
    let plist_path = app_path.join("Contents").join("Info.plist");
    plist_path.exists().then_some(plist_path)
}

/// Set a key in a plist via PlistBuddy, adding it when absent.
fn plist_set(plist: &Path, key: &str, value: &str) -> Result<()> {
    let set = Command::new("/usr/libexec/PlistBuddy")
        .args(["-c", &format!("Set :{} {}", key, value)])
        .arg(plist)
        .output()
        .context("Failed to run PlistBuddy")?;
    if set.status.success() {
        return Ok(());
    }

    let add = Command::new("/usr/libexec/PlistBuddy")
        .args(["-c", &format!("Add :{} string {}", key, value)])
        .arg(plist)
        .output()
        .context("Failed to run PlistBuddy")?;
    if !add.status.success() {
        anyhow::bail!(
            "PlistBuddy could not set {} in {:?}: {}",
            key,
            plist,
            String::from_utf8_lossy(&add.stderr).trim()
        );
    }
    Ok(())
}

/// Rewrite a bundle's identity and display names in place.
pub fn rewrite_bundle_identity(bundle: &Path, identity: &str, display_name: &str) -> Result<()> {
    let plist = info_plist_path(bundle)
        .with_context(|| format!("No Info.plist inside {:?}", bundle))?;

    plist_set(&plist, "CFBundleIdentifier", identity)?;
    plist_set(&plist, "CFBundleName", display_name)?;
    plist_set(&plist, "CFBundleDisplayName", display_name)?;

    info!("Rewrote {:?} to identity {}", bundle, identity);
    Ok(())
}

/// Remove the download-quarantine marker from the whole bundle tree.
///
/// A missing attribute is not an error; xattr complains and we move on.
pub fn strip_quarantine(bundle: &Path) -> Result<()> {
    let output = Command::new("xattr")
        .args(["-dr", "com.apple.quarantine"])
        .arg(bundle)
        .output()
        .context("Failed to run xattr")?;
    if !output.status.success() {
        debug!(
            "xattr on {:?}: {}",
            bundle,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Apply a local ad-hoc signature to a bundle.
///
/// This is signature-only (`-s -`), not a trust-chain signature: the bundle
/// is a byte copy of an already-trusted binary, so a valid local seal is all
/// execution policy needs. Nothing here may ever widen that to establishing
/// new trust.
pub fn sign_adhoc(bundle: &Path) -> Result<()> {
    let output = Command::new("codesign")
        .args(["--force", "--deep", "--sign", "-"])
        .arg(bundle)
        .output()
        .context("Failed to run codesign")?;
    if !output.status.success() {
        anyhow::bail!(
            "codesign failed for {:?}: {}",
            bundle,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Force LaunchServices to register the bundle so its identity resolves.
pub fn refresh_discovery_cache(bundle: &Path) -> Result<()> {
    let output = Command::new(LSREGISTER)
        .arg("-f")
        .arg(bundle)
        .output()
        .context("Failed to run lsregister")?;
    if !output.status.success() {
        warn!(
            "lsregister failed for {:?}: {}",
            bundle,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// One-shot elevation probe via an AppleScript administrator prompt.
///
/// Runs a no-op shell command with administrator privileges; success means
/// the user granted rights for the upcoming privileged script.
pub fn authorize_admin() -> Result<bool> {
    let output = Command::new("osascript")
        .args([
            "-e",
            "do shell script \"/usr/bin/true\" with administrator privileges",
        ])
        .output()
        .context("Failed to run osascript")?;
    Ok(output.status.success())
}

/// Mount a disk image, copy the first application bundle inside it into
/// `dest_dir`, and detach the image again.
pub fn extract_dmg(image: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let mount_point = std::env::temp_dir().join(format!("multiclone-mount-{}", std::process::id()));
    std::fs::create_dir_all(&mount_point)?;

    let attach = Command::new("hdiutil")
        .args(["attach", "-nobrowse", "-readonly", "-mountpoint"])
        .arg(&mount_point)
        .arg(image)
        .output()
        .context("Failed to run hdiutil attach")?;
    if !attach.status.success() {
        anyhow::bail!(
            "hdiutil attach failed for {:?}: {}",
            image,
            String::from_utf8_lossy(&attach.stderr).trim()
        );
    }

    let result = (|| -> Result<PathBuf> {
        let bundle = std::fs::read_dir(&mount_point)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().map(|ext| ext == "app").unwrap_or(false))
            .with_context(|| format!("No application bundle inside {:?}", image))?;

        std::fs::create_dir_all(dest_dir)?;
        let dest = dest_dir.join(bundle.file_name().unwrap_or_default());
        let copy = Command::new("cp")
            .arg("-pR")
            .arg(&bundle)
            .arg(&dest)
            .output()
            .context("Failed to copy bundle out of image")?;
        if !copy.status.success() {
            anyhow::bail!(
                "Copy out of {:?} failed: {}",
                image,
                String::from_utf8_lossy(&copy.stderr).trim()
            );
        }
        Ok(dest)
    })();

    let detach = Command::new("hdiutil")
        .args(["detach", "-force"])
        .arg(&mount_point)
        .output();
    if let Err(e) = detach {
        warn!("hdiutil detach failed for {:?}: {}", mount_point, e);
    }
    let _ = std::fs::remove_dir(&mount_point);

    result
}

/// Run a shell script with administrator privileges, detached.
pub fn spawn_script_elevated(script: &Path) -> Result<()> {
    let script_str = script
        .to_str()
        .with_context(|| format!("Non-UTF-8 script path {:?}", script))?;
    let apple_script = format!(
        "do shell script \"/bin/sh '{}' >/dev/null 2>&1 &\" with administrator privileges",
        script_str.replace('\'', "'\\''")
    );
    super::spawn_detached("osascript", &["-e".as_ref(), apple_script.as_ref()])?;
    Ok(())
}
