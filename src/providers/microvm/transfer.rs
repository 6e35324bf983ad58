//! File transfer over exec.
//!
//! Pods expose no file API, so transfers run small shell scripts through the
//! exec channel. Every script is passed as `sh -c SCRIPT sh PATH`, so the
//! path travels as `$1` and is never interpolated into shell source.
//!
//! - single files travel base64-encoded over stdin/stdout
//! - directories travel as base64-encoded `tar.gz` archives
//! - archives received from a pod are unpacked with path-traversal checks

use crate::constants::{MAX_FILE_TRANSFER_SIZE, WORKSPACE_PATH};
use crate::error::{Error, Result};
use crate::runtime::ExecOptions;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};

// =============================================================================
// Scripts
// =============================================================================

/// Exit code the scripts use for a missing source path.
pub const MISSING_PATH_EXIT_CODE: i32 = 66;

/// Decodes stdin into `$1`, creating parent directories.
pub const WRITE_FILE_SCRIPT: &str = r#"set -e; mkdir -p "$(dirname "$1")"; base64 -d > "$1""#;

/// Writes `$1` to stdout, base64-encoded.
pub const READ_FILE_SCRIPT: &str = r#"[ -f "$1" ] || exit 66; base64 "$1""#;

/// Unpacks a base64 `tar.gz` from stdin into directory `$1`.
pub const UPLOAD_DIR_SCRIPT: &str = r#"set -e; mkdir -p "$1"; base64 -d | tar -xzf - -C "$1""#;

/// Packs directory `$1` as a base64 `tar.gz` on stdout.
pub const DOWNLOAD_DIR_SCRIPT: &str = r#"[ -d "$1" ] || exit 66; tar -czf - -C "$1" . | base64"#;

/// Prints the size of `$1` in KiB.
pub const DISK_USAGE_SCRIPT: &str = r#"du -sk "$1" 2>/dev/null | cut -f1"#;

/// Runs `$2..` with `$1` as working directory.
pub const WORKDIR_SCRIPT: &str = r#"cd "$1" && shift && exec "$@""#;

/// Argv running `script` with `arg` as `$1`.
#[must_use]
pub fn script_command(script: &str, arg: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
        arg.to_string(),
    ]
}

/// Applies working directory and extra environment to a command.
#[must_use]
pub fn wrap_command(command: &[String], options: &ExecOptions) -> Vec<String> {
    let mut argv = Vec::new();
    if !options.env.is_empty() {
        argv.push("env".to_string());
        argv.extend(options.env.iter().map(|(k, v)| format!("{k}={v}")));
    }
    if let Some(dir) = &options.working_dir {
        argv.extend(script_command(WORKDIR_SCRIPT, dir));
    }
    argv.extend(command.iter().cloned());
    argv
}

/// Resolves a pod path; relative paths are taken from the workspace.
pub fn resolve_remote_path(path: &str) -> Result<String> {
    if path.is_empty() || path.contains('\0') {
        return Err(Error::Configuration(format!("invalid remote path {path:?}")));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("{WORKSPACE_PATH}/{}", path.trim_start_matches("./")))
    }
}

// =============================================================================
// Encoding
// =============================================================================

#[must_use]
pub fn encode(data: &[u8]) -> Vec<u8> {
    STANDARD.encode(data).into_bytes()
}

/// Decodes base64, ignoring the line breaks `base64` inserts.
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    let compact: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|e| Error::Serialization(format!("invalid base64 payload: {e}")))
}

fn check_size(size: usize) -> Result<()> {
    if size > MAX_FILE_TRANSFER_SIZE {
        return Err(Error::ResourceExhausted(format!(
            "transfer of {size} bytes exceeds limit of {MAX_FILE_TRANSFER_SIZE} bytes"
        )));
    }
    Ok(())
}

// =============================================================================
// Archives
// =============================================================================

/// Packs a local directory into a `tar.gz`.
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(format!("directory {}", dir.display())));
    }
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let data = builder.into_inner()?.finish()?;
    check_size(data.len())?;
    Ok(data)
}

/// Packs in-memory files (`relative path`, contents) into a `tar.gz`.
pub fn pack_entries<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for (path, data) in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data)?;
    }
    let data = builder.into_inner()?.finish()?;
    check_size(data.len())?;
    Ok(data)
}

fn check_entry_path(path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::PathTraversal {
            path: path.to_string_lossy().into_owned(),
        });
    }
    Ok(())
}

/// Unpacks a `tar.gz` into `dest`.
///
/// Rejects the whole archive on the first entry that is absolute or climbs
/// out of `dest`. Returns the number of bytes written.
pub fn unpack_archive(data: &[u8], dest: &Path) -> Result<u64> {
    check_size(data.len())?;
    std::fs::create_dir_all(dest)?;

    let mut archive = Archive::new(GzDecoder::new(data));
    let mut total = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;
        if matches!(entry.header().entry_type(), EntryType::Symlink | EntryType::Link) {
            tracing::debug!(path = %path.display(), "skipping link in archive");
            continue;
        }
        total += entry.size();
        if total > MAX_FILE_TRANSFER_SIZE as u64 {
            return Err(Error::ResourceExhausted(format!(
                "archive expands beyond {MAX_FILE_TRANSFER_SIZE} bytes"
            )));
        }
        entry.unpack_in(dest)?;
    }
    Ok(total)
}

/// Reads regular-file entries of a `tar.gz` into memory.
///
/// Applies the same traversal checks as [`unpack_archive`]. Paths are
/// returned relative, without a leading `./`.
pub fn read_entries(data: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
    check_size(data.len())?;
    let mut archive = Archive::new(GzDecoder::new(data));
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        let relative: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        files.push((relative.join("/"), contents));
    }
    Ok(files)
}
