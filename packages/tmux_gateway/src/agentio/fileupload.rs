//! File-upload staging: envelope parsing, name sanitization, saving to the
//! agent's workdir, and choosing what to paste into the pane.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Upload size cap.
pub const MAX_FILE_UPLOAD_BYTES: usize = 8 * 1024 * 1024;

/// Largest text payload pasted inline instead of by path.
const MAX_INLINE_PASTE_BYTES: usize = 256 * 1024;

/// How many leading bytes the UTF-8-cleanness scan inspects.
const TEXT_SAMPLE_BYTES: usize = 4096;

const DEFAULT_FILE_NAME: &str = "attachment.bin";

/// Parse the upload envelope `fileName \0 mimeType \0 bytes`. A missing
/// file name defaults to `attachment.bin`.
pub fn parse_file_upload_payload(payload: &[u8]) -> Result<(String, String, &[u8])> {
    let first = payload
        .iter()
        .position(|&b| b == 0)
        .context("missing file name separator")?;
    let rest = &payload[first + 1..];
    let second = rest
        .iter()
        .position(|&b| b == 0)
        .context("missing mime type separator")?;

    let file_name = String::from_utf8_lossy(&payload[..first]).to_string();
    let mime_type = String::from_utf8_lossy(&rest[..second]).to_string();
    let data = &rest[second + 1..];

    let file_name = if file_name.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        file_name
    };
    Ok((file_name, mime_type, data))
}

/// Sanitize a file name for use as a single path component: path separators
/// are stripped, anything outside `[A-Za-z0-9._-]` becomes `_`, leading
/// dots are collapsed, and an empty result falls back to `attachment.bin`.
pub fn sanitize_path_component(name: &str) -> String {
    let mut out = String::new();
    for ch in name.trim().chars() {
        if ch == '/' || ch == '\\' {
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let out = out.trim_start_matches('.');
    if out.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        out.to_string()
    }
}

/// Save uploaded bytes under `<workDir>/.tmux-adapter/uploads/`, falling
/// back to `<system-temp>/tmux-adapter/uploads/<agent>/` when the workdir
/// is unknown or not writable. Returns the saved path.
pub fn save_uploaded_file(
    work_dir: &str,
    agent: &str,
    file_name: &str,
    data: &[u8],
) -> Result<PathBuf> {
    let stamped = format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        sanitize_path_component(file_name)
    );

    if !work_dir.is_empty() {
        let dir = Path::new(work_dir).join(".tmux-adapter").join("uploads");
        if let Ok(path) = try_write(&dir, &stamped, data) {
            return Ok(path);
        }
    }

    let dir = std::env::temp_dir()
        .join("tmux-adapter")
        .join("uploads")
        .join(sanitize_path_component(agent));
    try_write(&dir, &stamped, data)
        .with_context(|| format!("save upload to {}", dir.display()))
}

fn try_write(dir: &Path, file_name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, data)?;
    Ok(path)
}

/// The path pasted into the agent's pane: workdir-relative when the saved
/// file is inside the workdir, absolute otherwise.
pub fn build_server_paste_path(work_dir: &str, saved: &Path) -> String {
    if work_dir.is_empty() {
        return saved.display().to_string();
    }
    match saved.strip_prefix(work_dir) {
        Ok(rel) => rel.display().to_string(),
        Err(_) => saved.display().to_string(),
    }
}

/// Decide what to paste: images paste their absolute path (agents
/// dereference and render), small clean text pastes inline, everything
/// else pastes a path. Paths carry a trailing space so the agent's input
/// tokenizes cleanly.
pub fn build_paste_payload(saved: &Path, paste_path: &str, mime_type: &str, data: &[u8]) -> Vec<u8> {
    if mime_type.starts_with("image/") {
        return format!("{} ", saved.display()).into_bytes();
    }
    if is_text_like(mime_type, data) && data.len() <= MAX_INLINE_PASTE_BYTES {
        return data.to_vec();
    }
    format!("{paste_path} ").into_bytes()
}

/// Whether an upload should be treated as pasteable text. The declared MIME
/// type is advisory only: agents routinely upload text as
/// `application/octet-stream`, and a `text/*` upload can carry binary
/// garbage, so the content scan decides either way.
pub fn is_text_like(_mime_type: &str, data: &[u8]) -> bool {
    is_utf8_text(data)
}

/// Scan at most the first 4096 bytes: reject NUL or control characters
/// (other than tab/newline/carriage-return) and invalid UTF-8.
pub fn is_utf8_text(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(TEXT_SAMPLE_BYTES)];
    for &b in sample {
        if b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r' {
            return false;
        }
    }
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        // A multi-byte character cut off at the sample boundary is fine;
        // any other invalid sequence is not text.
        Err(e) => e.error_len().is_none(),
    }
}

/// Validate the upload size before any further processing.
pub fn check_upload_size(len: usize) -> Result<()> {
    if len > MAX_FILE_UPLOAD_BYTES {
        bail!(
            "upload of {len} bytes exceeds the {} byte limit",
            MAX_FILE_UPLOAD_BYTES
        );
    }
    Ok(())
}
