//! Command handler helpers for the CLI binary.
//!
//! Shared utilities used by multiple subcommands live here.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;

/// Load a JSON payload from either an inline string or a file path.
pub fn load_payload(payload: Option<String>, payload_file: Option<String>) -> Result<Value> {
    if let Some(p) = payload_file {
        let bytes = fs::read(&p).with_context(|| format!("read payload-file failed: {}", p))?;
        let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(&bytes);
        let raw = String::from_utf8(bytes.to_vec()).context("payload-file must be UTF-8 text")?;
        let raw = raw.trim();
        let v: Value = serde_json::from_str(raw).context("payload-file must contain valid JSON")?;
        return Ok(v);
    }

    let raw = payload.context("must provide --payload or --payload-file")?;
    let raw = raw.trim();
    let v: Value = serde_json::from_str(raw).context("--payload must be valid JSON")?;
    Ok(v)
}
