use ahash::AHashSet;
use serde::{Deserialize, Serialize};

/// A named, opaque payload riding on a request or a response. The engine
/// never looks inside except for the names it owns itself.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExtensionData {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl ExtensionData {
    pub fn new(name: &str, data: Vec<u8>) -> Self {
        ExtensionData {
            name: name.to_string(),
            data,
        }
    }
}

/// Returns the payload stored under `name`, if any.
pub fn find_extension<'a>(extensions: &'a [ExtensionData], name: &str) -> Option<&'a [u8]> {
    extensions
        .iter()
        .find(|extension| extension.name == name)
        .map(|extension| extension.data.as_slice())
}

/// Inserts `extension`, replacing an existing entry with the same name.
pub fn set_extension(extensions: &mut Vec<ExtensionData>, extension: ExtensionData) {
    match extensions.iter_mut().find(|e| e.name == extension.name) {
        Some(existing) => existing.data = extension.data,
        None => extensions.push(extension),
    }
}

/// Appends the entries of `incoming` whose names are not yet present.
pub fn merge_extensions(extensions: &mut Vec<ExtensionData>, incoming: Vec<ExtensionData>) {
    for extension in incoming {
        if find_extension(extensions, &extension.name).is_none() {
            extensions.push(extension);
        }
    }
}

pub fn has_unique_names(extensions: &[ExtensionData]) -> bool {
    let mut seen = AHashSet::new();
    extensions.iter().all(|extension| seen.insert(extension.name.as_str()))
}
