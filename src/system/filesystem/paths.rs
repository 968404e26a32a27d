extern crate alloc;

use alloc::{string::String, vec::Vec};

use crate::system::filesystem::FSError;

#[inline]
pub fn create_iter<'a>(path: &'a str) -> impl Iterator<Item = &'a str> {
    path.split('/')
}

/// Normalizes an absolute path: empty and `.` components vanish, `..`
/// drops its parent. Relative paths and escapes above `/` are illegal.
pub fn resolve(path: &str) -> Result<String, FSError> {
    if !path.starts_with('/') {
        return Err(FSError::IllegalPath);
    }

    let mut path_items: Vec<&str> = Vec::new();
    for path_item in create_iter(path) {
        match path_item {
            "" | "." => {}
            ".." => {
                if path_items.pop().is_none() {
                    return Err(FSError::IllegalPath);
                }
            }
            _ => path_items.push(path_item),
        }
    }

    let mut resolved = String::from("/");
    resolved.push_str(&path_items.join("/"));
    Ok(resolved)
}
