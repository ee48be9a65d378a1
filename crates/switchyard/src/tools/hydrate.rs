use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::message::FileRef;

static FILE_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(file|image)_(\d+)$").expect("FILE_REFERENCE is a valid pattern"));

/// A conversation file as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReference {
    pub reference: String,
    pub name: String,
    pub mime: String,
}

/// References for every file in the conversation, oldest first, starting at `file_1`.
pub fn file_references(files: &[&FileRef]) -> Vec<FileReference> {
    files
        .iter()
        .enumerate()
        .map(|(i, f)| FileReference {
            reference: format!("file_{}", i + 1),
            name: f.name.clone(),
            mime: f.mime.clone(),
        })
        .collect()
}

fn resolve<'a>(reference: &str, files: &[&'a FileRef]) -> Option<&'a FileRef> {
    let captures = FILE_REFERENCE.captures(reference.trim())?;
    let index: usize = captures.get(2)?.as_str().parse().ok()?;
    let position = index.checked_sub(1)?;
    match captures.get(1)?.as_str() {
        "image" => files.iter().filter(|f| f.is_image()).nth(position).copied(),
        _ => files.get(position).copied(),
    }
}

/// Replace file references anywhere in `arguments` with the file's data URL.
/// `file_N` counts all files and `image_N` counts images only. Unknown
/// references are left as they are.
pub fn hydrate_arguments(arguments: Value, files: &[&FileRef]) -> Value {
    if files.is_empty() {
        return arguments;
    }
    match arguments {
        Value::String(s) => match resolve(&s, files) {
            Some(file) => Value::String(file.data_url()),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| hydrate_arguments(item, files))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, hydrate_arguments(v, files)))
                .collect(),
        ),
        other => other,
    }
}
