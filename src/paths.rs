use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Extension every capture file must carry.
pub const CAPTURE_EXT: &str = ".rdc";

static PROJECT_ID_RE: OnceLock<Regex> = OnceLock::new();
static UNSAFE_NAME_RE: OnceLock<Regex> = OnceLock::new();

/// Project ids double as sandbox directory names; the charset is restricted
/// so an id can never smuggle a path separator or traversal.
pub fn is_valid_project_id(id: &str) -> bool {
    let re = PROJECT_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static pattern"));
    re.is_match(id)
}

/// Collapse an uploaded filename to a safe charset.
pub fn sanitize_capture_name(name: &str) -> String {
    let re =
        UNSAFE_NAME_RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("static pattern"));
    re.replace_all(name, "_").into_owned()
}

/// Normalize a client-supplied relative path: forward slashes only, no
/// leading slash, no `..` anywhere.
pub fn normalize_relative(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    let normalized = input.replace('\\', "/");
    let normalized = normalized.trim_start_matches('/').to_string();
    if normalized.is_empty() || normalized.split('/').any(|seg| seg == "..") {
        return None;
    }
    Some(normalized)
}

/// The only relative paths a project sandbox will store or serve.
pub fn is_allowed_project_path(rel: &str) -> bool {
    if rel == "project.json" || rel == "history.json" {
        return true;
    }
    if let Some(rest) = rel.strip_prefix("captures/") {
        return !rest.is_empty() && rest.to_ascii_lowercase().ends_with(CAPTURE_EXT);
    }
    rel.strip_prefix("exports/").is_some_and(|rest| !rest.is_empty())
        || rel.strip_prefix("logs/").is_some_and(|rest| !rest.is_empty())
}

/// Flatten `.`/`..` components without touching the filesystem, so paths that
/// do not exist yet can still be containment-checked.
fn flatten(path: &Path) -> PathBuf {
    path.components().fold(PathBuf::new(), |mut acc, comp| {
        match comp {
            Component::ParentDir => {
                acc.pop();
            }
            Component::CurDir => {}
            other => acc.push(other.as_os_str()),
        }
        acc
    })
}

/// Resolve a relative path under a sandbox root, requiring containment.
/// No allow-list here; used for capture-path resolution.
pub fn resolve_under_project(root: &Path, rel: &str) -> Option<PathBuf> {
    let normalized = normalize_relative(rel)?;
    let root = root.canonicalize().ok()?;
    let resolved = flatten(&root.join(normalized));
    if resolved.starts_with(&root) { Some(resolved) } else { None }
}

/// Resolve a relative path for storage or retrieval: normalized, on the
/// allow-list, and contained in the sandbox. Re-derived on every call; a
/// previously resolved path is never trusted.
pub fn resolve_project_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let normalized = normalize_relative(rel)?;
    if !is_allowed_project_path(&normalized) {
        return None;
    }
    resolve_under_project(root, &normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn project_id_charset() {
        assert!(is_valid_project_id("proj-4f6a2c_1"));
        assert!(!is_valid_project_id(""));
        assert!(!is_valid_project_id("proj/evil"));
        assert!(!is_valid_project_id("proj..deep"));
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_capture_name("my scene!.rdc"), "my_scene_.rdc");
        assert_eq!(sanitize_capture_name("frame-01.rdc"), "frame-01.rdc");
        assert_eq!(sanitize_capture_name("../../x.rdc"), ".._.._x.rdc");
    }

    #[test]
    fn allow_list_rules() {
        assert!(is_allowed_project_path("project.json"));
        assert!(is_allowed_project_path("history.json"));
        assert!(is_allowed_project_path("captures/frame.rdc"));
        assert!(is_allowed_project_path("exports/color.png"));
        assert!(is_allowed_project_path("logs/run.log"));
        assert!(!is_allowed_project_path("captures/notes.txt"));
        assert!(!is_allowed_project_path("captures/"));
        assert!(!is_allowed_project_path("secret.txt"));
        assert!(!is_allowed_project_path("exports"));
    }

    #[test]
    fn resolve_denies_path_traversal() {
        let dir = tempdir().unwrap();
        assert!(resolve_project_path(dir.path(), "../../etc/passwd").is_none());
        assert!(resolve_project_path(dir.path(), "captures/../../evil.rdc").is_none());
        assert!(resolve_under_project(dir.path(), "../outside.rdc").is_none());
    }

    #[test]
    fn resolve_accepts_allowed_paths() {
        let dir = tempdir().unwrap();
        let resolved = resolve_project_path(dir.path(), "captures/frame.rdc").unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert!(resolve_project_path(dir.path(), "exports/sub/dir/out.json").is_some());
        assert!(resolve_project_path(dir.path(), "captures/notes.txt").is_none());
    }

    #[test]
    fn normalize_strips_and_rejects() {
        assert_eq!(normalize_relative("/captures/a.rdc").as_deref(), Some("captures/a.rdc"));
        assert_eq!(normalize_relative("captures\\a.rdc").as_deref(), Some("captures/a.rdc"));
        assert!(normalize_relative("captures/../a.rdc").is_none());
        assert!(normalize_relative("").is_none());
    }
}
