use std::path::{Component, Path};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Generate a random image identifier.
///
/// The identifier is 16 random bytes in hexadecimal form (32 characters),
/// unique with overwhelming probability across the store's lifetime.
pub fn random_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current time as seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Lexically normalize a path name before it enters the catalog.
///
/// Repeated separators, `.` components and trailing slashes are dropped and
/// `..` components are resolved without touching the filesystem. The empty
/// path normalizes to `.`.
pub(crate) fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<String> = Vec::new();

    for comp in Path::new(path).components() {
        match comp {
            Component::Normal(c) => parts.push(c.to_string_lossy().into_owned()),
            Component::ParentDir => {
                let last_is_up = parts.last().is_some_and(|p| p == "..");
                if last_is_up || (parts.is_empty() && !absolute) {
                    // nothing left to resolve against, keep the component
                    parts.push("..".to_string());
                } else {
                    // "/.." clamps at the root
                    parts.pop();
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}
