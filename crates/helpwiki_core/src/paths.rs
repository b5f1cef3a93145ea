use std::path::{Component, Path, PathBuf};

pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

pub fn display_path(path: &Path) -> String {
    normalize_separators(&path.to_string_lossy())
}

/// Resolve `.` and `..` components without touching the filesystem.
/// Leading `..` components of a relative path are kept.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                Some(Component::ParentDir | Component::CurDir) | None => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Whether an archive-internal path stays below the directory it is joined
/// onto. A leading `/` is tolerated; any `..` component or drive prefix is not.
pub fn is_enclosed(relative: &str) -> bool {
    let normalized = normalize_separators(relative);
    Path::new(normalized.trim_start_matches('/'))
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// `target` expressed relative to the directory `base`, with `/` separators.
pub fn relative_path(target: &Path, base: &Path) -> String {
    let target = normalize_lexically(target);
    let base = normalize_lexically(base);
    let target_parts = target.components().collect::<Vec<_>>();
    let base_parts = base.components().collect::<Vec<_>>();

    let common = target_parts
        .iter()
        .zip(&base_parts)
        .take_while(|(left, right)| left == right)
        .count();

    let mut segments = Vec::new();
    for _ in common..base_parts.len() {
        segments.push("..".to_string());
    }
    for part in &target_parts[common..] {
        segments.push(part.as_os_str().to_string_lossy().into_owned());
    }

    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

/// Last `/`-separated segment of a reference.
pub fn basename(reference: &str) -> &str {
    let trimmed = reference.trim_end_matches('/');
    match trimmed.rsplit_once(['/', '\\']) {
        Some((_, name)) => name,
        None => trimmed,
    }
}

/// Lowercased, normalized form used for case-insensitive path lookups.
pub fn lookup_key(path: &Path) -> String {
    display_path(&normalize_lexically(path)).to_lowercase()
}
