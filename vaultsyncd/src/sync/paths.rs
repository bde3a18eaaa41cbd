//! Key helpers. Keys are slash-separated relative paths; folder keys carry
//! a trailing separator to disambiguate them from same-named files.

use super::metadata::{METADATA_KEY, METADATA_KEY_LEGACY};

/// True when any path component starts with a dot (when `dot` is set) or
/// an underscore (when `underscore` is set).
pub fn is_hidden_path(key: &str, dot: bool, underscore: bool) -> bool {
    key.split('/')
        .filter(|part| !part.is_empty())
        .any(|part| (dot && part.starts_with('.')) || (underscore && part.starts_with('_')))
}

/// Parent folder key with its trailing separator; `/` for top-level keys.
/// The root pseudo-key never appears in a plan, so marking it kept is a
/// harmless no-op.
pub fn parent_folder(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/"),
        None => "/".to_string(),
    }
}

/// Folder depth of a key: `a.md` is level 1, `a/b/` is level 2.
pub fn key_level(key: &str) -> u32 {
    key.trim_end_matches('/').split('/').count() as u32
}

pub fn inside_config_dir(key: &str, config_dir: &str) -> bool {
    let dir = config_dir.trim_end_matches('/');
    key == dir
        || key
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[derive(Debug, Clone)]
pub struct SkipOptions {
    pub sync_config_dir: bool,
    pub config_dir: String,
    pub sync_underscore_items: bool,
}

/// The shared filter applied by every Record Merger overlay: hidden paths,
/// underscore paths unless opted in, and the reserved metadata keys. Paths
/// inside the config dir pass when that opt-in is set.
pub fn is_skip_item(key: &str, opts: &SkipOptions) -> bool {
    if opts.sync_config_dir && inside_config_dir(key, &opts.config_dir) {
        return false;
    }
    is_hidden_path(key, true, false)
        || (!opts.sync_underscore_items && is_hidden_path(key, false, true))
        || key == METADATA_KEY
        || key == METADATA_KEY_LEGACY
}
