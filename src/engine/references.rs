// Finding and rewriting file references inside request payloads.

use serde_json::{Map, Value};

use crate::detect::media;

const FILE_DATA_KEYS: [&str; 2] = ["fileData", "file_data"];
const REFERENCE_KEYS: [&str; 4] = ["fileUri", "file_uri", "fileName", "file_name"];
const MEDIA_TYPE_KEYS: [&str; 2] = ["mimeType", "mime_type"];

/// Replacement for one `fileData` object.
#[derive(Debug, Clone)]
pub struct FileRewrite {
    /// Remote reference the worker's upstream understands.
    pub uri: String,
    pub media_type: String,
    pub display_name: String,
}

fn reference_of(file_data: &Map<String, Value>) -> Option<&str> {
    REFERENCE_KEYS.iter().find_map(|k| {
        file_data
            .get(*k)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    })
}

fn visit<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if FILE_DATA_KEYS.contains(&key.as_str()) {
                    if let Some(reference) = child.as_object().and_then(reference_of) {
                        out.push(reference);
                    }
                } else {
                    visit(child, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| visit(item, out)),
        _ => {}
    }
}

/// Every `fileData` reference in document order, duplicates included.
///
/// Inline data (`inlineData`) is not a reference and is left alone.
pub fn file_references(payload: &Value) -> Vec<String> {
    let mut out = Vec::new();
    visit(payload, &mut out);
    out.into_iter().map(str::to_string).collect()
}

type Rewriter<'a> = dyn FnMut(&str) -> Option<FileRewrite> + 'a;

fn rewrite_node(map: &mut Map<String, Value>, rewrite: &mut Rewriter<'_>) -> usize {
    let mut count = 0;
    for (key, child) in map.iter_mut() {
        if FILE_DATA_KEYS.contains(&key.as_str()) {
            if let Some(file_data) = child.as_object_mut() {
                let replacement = reference_of(file_data).and_then(|r| rewrite(r));
                if let Some(replacement) = replacement {
                    apply(file_data, replacement);
                    count += 1;
                }
            }
        } else {
            count += rewrite_value(child, rewrite);
        }
    }
    count
}

fn rewrite_value(value: &mut Value, rewrite: &mut Rewriter<'_>) -> usize {
    match value {
        Value::Object(map) => rewrite_node(map, rewrite),
        Value::Array(items) => {
            let mut count = 0;
            for item in items {
                count += rewrite_value(item, rewrite);
            }
            count
        }
        _ => 0,
    }
}

fn apply(file_data: &mut Map<String, Value>, replacement: FileRewrite) {
    let current = MEDIA_TYPE_KEYS
        .iter()
        .find_map(|k| file_data.get(*k).and_then(Value::as_str))
        .map(str::to_string);
    for key in REFERENCE_KEYS.iter().chain(MEDIA_TYPE_KEYS.iter().skip(1)) {
        file_data.remove(*key);
    }
    file_data.insert("fileUri".to_string(), Value::String(replacement.uri));

    let media_type = media::corrected(
        current.as_deref(),
        &replacement.media_type,
        Some(&replacement.display_name),
    )
    .or(current);
    match media_type {
        Some(m) => {
            file_data.insert("mimeType".to_string(), Value::String(m));
        }
        None => {
            file_data.remove("mimeType");
        }
    }
}

/// Rewrite every `fileData` reference for which `rewrite` returns a replacement.
///
/// The reference keys are replaced by a single `fileUri`, and a generic or
/// mislabelled `mimeType` is replaced by the cached one. Returns the number of
/// objects rewritten.
pub fn rewrite_file_data(
    payload: &mut Value,
    mut rewrite: impl FnMut(&str) -> Option<FileRewrite>,
) -> usize {
    rewrite_value(payload, &mut rewrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {"text": "describe these"},
                    {"fileData": {"fileUri": "files/aaa", "mimeType": "application/octet-stream"}},
                    {"file_data": {"file_name": "files/bbb"}},
                    {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                    {"fileData": {"fileUri": "files/aaa"}}
                ]
            }]
        })
    }

    #[test]
    fn finds_references_in_both_spellings() {
        assert_eq!(
            file_references(&request()),
            vec!["files/aaa", "files/bbb", "files/aaa"]
        );
        assert!(file_references(&json!({"contents": [{"parts": [{"text": "hi"}]}]})).is_empty());
    }

    #[test]
    fn empty_uri_falls_through_to_file_name() {
        let payload = json!({"parts": [
            {"fileData": {"fileUri": "", "fileName": "files/ccc"}},
            {"fileData": {"fileUri": "  "}}
        ]});
        assert_eq!(file_references(&payload), vec!["files/ccc"]);
    }

    #[test]
    fn rewrite_replaces_uri_and_fixes_generic_media_type() {
        let mut payload = request();
        let rewritten = rewrite_file_data(&mut payload, |reference| {
            (reference == "files/aaa").then(|| FileRewrite {
                uri: "https://upstream/v1beta/files/remote-a".to_string(),
                media_type: "application/pdf".to_string(),
                display_name: "report.pdf".to_string(),
            })
        });
        assert_eq!(rewritten, 2);

        let parts = &payload["contents"][0]["parts"];
        assert_eq!(
            parts[1]["fileData"],
            json!({"fileUri": "https://upstream/v1beta/files/remote-a", "mimeType": "application/pdf"})
        );
        assert_eq!(parts[2]["file_data"], json!({"file_name": "files/bbb"}));
        assert_eq!(parts[3]["inlineData"]["data"], "AAAA");
        assert_eq!(parts[4]["fileData"]["mimeType"], "application/pdf");
    }

    #[test]
    fn specific_declared_media_type_is_kept() {
        let mut payload = json!({"fileData": {"fileUri": "files/x", "mimeType": "image/png"}});
        rewrite_file_data(&mut payload, |_| {
            Some(FileRewrite {
                uri: "files/remote".to_string(),
                media_type: "image/jpeg".to_string(),
                display_name: "photo.jpg".to_string(),
            })
        });
        assert_eq!(payload["fileData"]["mimeType"], "image/png");
        assert_eq!(payload["fileData"]["fileUri"], "files/remote");
    }
}
