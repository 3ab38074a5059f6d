//! `spec` subcommand: prints or writes the OpenAPI document.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use anyhow::Context;
use utoipa::OpenApi;

use crate::openapi::ApiDoc;

/// Generates the OpenAPI document.
///
/// `None` or `"yaml"` streams YAML to stdout, `"json"` streams JSON. Any
/// other value is a file path whose extension picks the format, YAML unless
/// it ends in `.json`.
///
/// # Errors
/// Returns an error if serialization or the write fails.
pub fn generate_spec(output: Option<&str>) -> anyhow::Result<()> {
    let openapi = ApiDoc::openapi();

    match output {
        None | Some("yaml") => io::stdout().write_all(openapi.to_yaml()?.as_bytes())?,
        Some("json") => io::stdout().write_all(openapi.to_json()?.as_bytes())?,
        Some(path) => {
            let path = Path::new(path);
            let body = match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => openapi.to_json()?,
                _ => openapi.to_yaml()?,
            };
            fs::write(path, body)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("OpenAPI spec written to {}", path.display());
        }
    }

    Ok(())
}
