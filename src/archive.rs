//! Archive extraction through OS-provided tools.
//!
//! Release archives are unpacked with `tar` / `unzip` (PowerShell
//! `Expand-Archive` as the Windows fallback) rather than an in-process
//! decoder; the binaries inside can be hundreds of megabytes and the OS
//! tools handle permissions and symlinks natively.

use crate::error::{GatewayError, Result};
use crate::process;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Extraction timeout; large ROCm archives unpack slowly on first install.
const EXTRACT_TIMEOUT: Duration = Duration::from_secs(600);

/// Extract `archive` into `dest_dir`, detecting `.tar.gz` by suffix and
/// treating everything else as ZIP.
///
/// # Errors
///
/// Returns [`GatewayError::Installation`] when the extraction tool is
/// missing or exits non-zero. The caller is responsible for deleting the
/// archive and the destination directory on failure.
pub async fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dest_dir).await?;

    if is_tarball(archive) {
        extract_tarball(archive, dest_dir).await
    } else {
        extract_zip(archive, dest_dir).await
    }
}

fn is_tarball(archive: &Path) -> bool {
    archive
        .to_str()
        .is_some_and(|s| s.ends_with(".tar.gz") || s.ends_with(".tgz"))
}

async fn extract_tarball(archive: &Path, dest_dir: &Path) -> Result<()> {
    info!(archive = %archive.display(), dest = %dest_dir.display(), "extracting tarball");
    // bsdtar on Windows 10+ accepts the same flags as GNU tar.
    let args = vec![
        "-xzf".to_owned(),
        archive.display().to_string(),
        "-C".to_owned(),
        dest_dir.display().to_string(),
        "--strip-components=1".to_owned(),
    ];
    run_tool("tar", &args).await
}

async fn extract_zip(archive: &Path, dest_dir: &Path) -> Result<()> {
    info!(archive = %archive.display(), dest = %dest_dir.display(), "extracting zip");

    if cfg!(windows) {
        let tar_args = vec![
            "-xf".to_owned(),
            archive.display().to_string(),
            "-C".to_owned(),
            dest_dir.display().to_string(),
        ];
        if run_tool("tar", &tar_args).await.is_ok() {
            return Ok(());
        }
        let ps_command = format!(
            "Expand-Archive -Path '{}' -DestinationPath '{}' -Force -ErrorAction Stop",
            archive.display(),
            dest_dir.display()
        );
        return run_tool("powershell", &["-Command".to_owned(), ps_command]).await;
    }

    let args = vec![
        "-o".to_owned(),
        "-q".to_owned(),
        archive.display().to_string(),
        "-d".to_owned(),
        dest_dir.display().to_string(),
    ];
    run_tool("unzip", &args).await
}

async fn run_tool(tool: &str, args: &[String]) -> Result<()> {
    let exit = process::run_with_output(tool, args, None, |_line| true, Some(EXTRACT_TIMEOUT))
        .await
        .map_err(|e| GatewayError::Installation(format!("{tool} unavailable: {e}")))?;
    if exit != 0 {
        return Err(GatewayError::Installation(format!(
            "{tool} exited with code {exit} while extracting"
        )));
    }
    Ok(())
}
