//! Readable text from nbformat outputs.
//!
//! Outputs are stored in the document as JSON strings. Tool results render
//! them as plain text: rich payloads become short placeholders, ANSI escapes
//! are stripped, and long text is truncated to keep results small.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Default per-output character limit.
pub const DEFAULT_OUTPUT_CHARS: usize = 1_000;

/// Hard per-output character limit, even with full output requested.
pub const MAX_OUTPUT_CHARS: usize = 40_000;

const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/svg+xml", "image/gif"];

fn ansi_escape() -> &'static Regex {
    static ANSI_ESCAPE: OnceLock<Regex> = OnceLock::new();
    ANSI_ESCAPE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ANSI pattern is valid"))
}

/// Remove ANSI color escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").into_owned()
}

/// Heuristic check for inline image payloads that would flood a text result.
pub fn is_base64_image_data(text: &str) -> bool {
    const JSON_IMAGE_MARKERS: &[&str] = &[
        "\"image/png\":\"",
        "\"image/jpeg\":\"",
        "\"image/svg+xml\":\"",
        "data:image/",
    ];
    if JSON_IMAGE_MARKERS.iter().any(|marker| text.contains(marker)) {
        return true;
    }

    if text.len() <= 1000 {
        return false;
    }
    // PNG and JPEG signatures in base64
    if text.contains("iVBORw0KGgo") || text.contains("/9j/") {
        return true;
    }
    if text.len() <= 5000 {
        return false;
    }

    let bytes = text.as_bytes();
    let sample = bytes[..1000].iter().chain(&bytes[bytes.len() - 1000..]);
    let foreign = sample
        .filter(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b' ' | b'\n' | b'\t')))
        .count();
    foreign < 200
}

/// Join a string or a list of strings (nbformat multiline text).
fn multiline_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| part.as_str().map_or_else(|| part.to_string(), str::to_string))
            .collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render one output as text.
pub fn extract_output(output: &Value) -> String {
    let object = match output {
        Value::Array(items) => {
            return items.iter().map(extract_output).collect::<Vec<_>>().join("\n");
        }
        Value::Object(object) => object,
        other => {
            let text = multiline_text(other);
            if is_base64_image_data(&text) {
                return "[Image Data Detected]".to_string();
            }
            return strip_ansi(&text);
        }
    };

    let output_type = object.get("output_type").and_then(Value::as_str).unwrap_or("");
    match output_type {
        "stream" => {
            let text = object.get("text").map(multiline_text).unwrap_or_default();
            if is_base64_image_data(&text) {
                return "[Image Data in Stream]".to_string();
            }
            strip_ansi(&text)
        }
        "display_data" | "execute_result" => {
            let empty = serde_json::Map::new();
            let data = object
                .get("data")
                .and_then(Value::as_object)
                .unwrap_or(&empty);
            if data.contains_key("image/png") {
                "[Image Output (PNG)]".to_string()
            } else if data.contains_key("image/jpeg") {
                "[Image Output (JPEG)]".to_string()
            } else if data.contains_key("image/svg+xml") {
                "[Image Output (SVG)]".to_string()
            } else if data.contains_key("text/html") {
                "[HTML Output]".to_string()
            } else if let Some(plain) = data.get("text/plain") {
                let text = multiline_text(plain);
                if is_base64_image_data(&text) {
                    return "[Image Data in Text Output]".to_string();
                }
                strip_ansi(&text)
            } else {
                let keys: Vec<&str> = data.keys().map(String::as_str).collect();
                format!("[{} Data: keys={:?}]", output_type, keys)
            }
        }
        "error" => match object.get("traceback") {
            Some(Value::Array(lines)) => lines
                .iter()
                .map(|line| strip_ansi(&multiline_text(line)))
                .collect::<Vec<_>>()
                .join("\n"),
            Some(other) => strip_ansi(&multiline_text(other)),
            None => String::new(),
        },
        other => format!("[Unknown output type: {}]", other),
    }
}

/// Truncate `text` to the output limit, saying how much was cut.
pub fn truncate_output(text: &str, full_output: bool) -> String {
    let limit = if full_output {
        MAX_OUTPUT_CHARS
    } else {
        DEFAULT_OUTPUT_CHARS
    };
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }

    let cut = text
        .char_indices()
        .nth(limit)
        .map_or(text.len(), |(offset, _)| offset);
    let kept = text[..cut].trim_end();
    let remaining = total - kept.chars().count();

    if full_output {
        format!(
            "{}\n\n... [Output truncated at 40k chars (safety limit) - {} more characters]",
            kept, remaining
        )
    } else {
        format!(
            "{}\n\n... [Output truncated - {} more characters. Use full_output=True to see complete output]",
            kept, remaining
        )
    }
}

/// An image found in an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub mime_type: String,
    pub size_bytes: usize,
    #[serde(skip_serializing)]
    pub base64_data: String,
    pub description: String,
}

/// Find the first image payload in an output.
pub fn extract_image_info(output: &Value) -> Option<ImageInfo> {
    let sources = [
        output.get("data"),
        Some(output),
        output.get("metadata").and_then(|m| m.get("data")),
    ];

    for data in sources.into_iter().flatten().filter(|d| d.is_object()) {
        for mime_type in IMAGE_MIME_TYPES {
            let Some(payload) = data.get(*mime_type) else {
                continue;
            };
            let payload = multiline_text(payload);
            if payload.len() > 50 {
                let subtype = mime_type.rsplit('/').next().unwrap_or(mime_type);
                return Some(ImageInfo {
                    mime_type: mime_type.to_string(),
                    size_bytes: payload.len(),
                    base64_data: payload,
                    description: format!("Generated {} image", subtype.to_uppercase()),
                });
            }
        }
    }
    None
}

/// Text and images extracted from a cell's outputs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractedOutputs {
    pub text_outputs: Vec<String>,
    pub images: Vec<ImageInfo>,
}

fn parse_stored(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Render stored outputs, collecting image metadata alongside the text.
pub fn extract_outputs_with_images(outputs: &[String], full_output: bool) -> ExtractedOutputs {
    let mut extracted = ExtractedOutputs::default();
    for raw in outputs {
        let output = parse_stored(raw);
        if let Some(image) = extract_image_info(&output) {
            extracted.images.push(image);
        }
        let text = extract_output(&output);
        if !text.is_empty() {
            extracted.text_outputs.push(truncate_output(&text, full_output));
        }
    }
    extracted
}

/// Render stored outputs as text only.
pub fn extract_outputs(outputs: &[String], full_output: bool) -> Vec<String> {
    extract_outputs_with_images(outputs, full_output).text_outputs
}
