// Convodex - app/export.rs
//
// Markdown, HTML, and JSON serialisation of a conversation.
// Writes to any Write trait object; the file-placement wrapper lives at
// the bottom and is the only piece that touches the filesystem.

use crate::core::model::MessageRow;
use crate::util::error::ExportError;
use chrono::DateTime;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Requested output representation for `extract`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Markdown,
    Json,
    Html,
}

impl ExportFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "markdown" => Some(Self::Markdown),
            "json" => Some(Self::Json),
            "html" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Html => "html",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Json => "json",
            Self::Html => "html",
        }
    }
}

/// Render an epoch-second timestamp as RFC 3339, second precision.
fn format_timestamp(epoch: Option<f64>) -> Option<String> {
    let secs = epoch?;
    DateTime::from_timestamp(secs as i64, 0).map(|dt| dt.to_rfc3339())
}

/// Export a conversation to Markdown. `messages` are oldest-first.
pub fn export_markdown<W: Write>(
    conversation_id: &str,
    messages: &[MessageRow],
    mut writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    let io_err = |source| ExportError::Io {
        path: export_path.to_path_buf(),
        source,
    };

    writeln!(writer, "# {conversation_id}").map_err(io_err)?;
    for msg in messages {
        writeln!(writer).map_err(io_err)?;
        match format_timestamp(msg.timestamp) {
            Some(ts) => writeln!(writer, "## {} ({ts})", msg.role).map_err(io_err)?,
            None => writeln!(writer, "## {}", msg.role).map_err(io_err)?,
        }
        writeln!(writer).map_err(io_err)?;
        writeln!(writer, "{}", msg.content).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)?;
    Ok(messages.len())
}

/// Export a conversation to a minimal self-contained HTML document.
pub fn export_html<W: Write>(
    conversation_id: &str,
    messages: &[MessageRow],
    mut writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    let io_err = |source| ExportError::Io {
        path: export_path.to_path_buf(),
        source,
    };

    let title = html_escape(conversation_id);
    writeln!(
        writer,
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>"
    )
    .map_err(io_err)?;

    for msg in messages {
        let role = msg.role.as_str();
        writeln!(writer, "<section class=\"message role-{role}\">").map_err(io_err)?;
        match format_timestamp(msg.timestamp) {
            Some(ts) => {
                writeln!(writer, "<h2>{role} <time>{}</time></h2>", html_escape(&ts))
                    .map_err(io_err)?;
            }
            None => writeln!(writer, "<h2>{role}</h2>").map_err(io_err)?,
        }
        writeln!(writer, "<pre>{}</pre>", html_escape(&msg.content)).map_err(io_err)?;
        writeln!(writer, "</section>").map_err(io_err)?;
    }

    writeln!(writer, "</body>\n</html>").map_err(io_err)?;
    writer.flush().map_err(io_err)?;
    Ok(messages.len())
}

/// Export a conversation as a JSON array of messages.
pub fn export_json<W: Write>(
    messages: &[MessageRow],
    writer: W,
    export_path: &Path,
) -> Result<usize, ExportError> {
    serde_json::to_writer_pretty(writer, messages).map_err(|source| ExportError::Json {
        path: export_path.to_path_buf(),
        source,
    })?;
    Ok(messages.len())
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Write `<extract_dir>/<conversation_id>.<ext>` and return the path.
pub fn write_export(
    extract_dir: &Path,
    conversation_id: &str,
    format: ExportFormat,
    messages: &[MessageRow],
) -> Result<PathBuf, ExportError> {
    let path = extract_dir.join(format!("{conversation_id}.{}", format.extension()));
    let io_err = |source| ExportError::Io {
        path: path.clone(),
        source,
    };

    std::fs::create_dir_all(extract_dir).map_err(io_err)?;
    let file = std::fs::File::create(&path).map_err(io_err)?;
    let mut writer = std::io::BufWriter::new(file);

    let count = match format {
        ExportFormat::Markdown => export_markdown(conversation_id, messages, &mut writer, &path)?,
        ExportFormat::Html => export_html(conversation_id, messages, &mut writer, &path)?,
        ExportFormat::Json => export_json(messages, &mut writer, &path)?,
    };
    writer.flush().map_err(io_err)?;

    tracing::info!(
        path = %path.display(),
        format = format.name(),
        messages = count,
        "Conversation exported"
    );
    Ok(path)
}

// =============================================================================
// Tests
// =============================================================================
