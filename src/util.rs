//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to the home directory.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" {
        return Cow::Owned(home_dir());
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return Cow::Owned(join_dir(&home_dir(), rest));
    }
    Cow::Borrowed(path)
}

/// Home directory of the daemon user, `/` when `$HOME` is unset.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/".to_string())
}

/// Join a file name onto a directory, tolerating a missing trailing slash.
pub fn join_dir(dir: &str, file: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{file}")
    } else {
        format!("{dir}/{file}")
    }
}
