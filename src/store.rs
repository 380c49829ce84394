use async_trait::async_trait;
use ignore::WalkBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::AppError;
use crate::paths::{
    CAPTURE_EXT, is_valid_project_id, resolve_project_path, resolve_under_project,
    sanitize_capture_name,
};
use crate::record::{
    Capture, HistoryLog, Message, ProjectMeta, ProjectSummary, Resource, ResourceKind, Submission,
    iso_from_system_time, now_iso,
};

/// One incoming file from a project import; `path` is the client-supplied
/// relative path, validated before anything is written.
pub struct ImportFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// One method per project operation. The filesystem implementation below is
/// whole-file read/modify/write; the trait is narrow enough that a locking
/// or versioned implementation can replace it without touching callers.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn create(&self, name: Option<String>) -> Result<String, AppError>;
    async fn import(&self, files: Vec<ImportFile>) -> Result<String, AppError>;
    async fn get(&self, project_id: &str) -> Result<ProjectMeta, AppError>;
    async fn list(&self) -> Result<Vec<ProjectSummary>, AppError>;
    async fn upload_capture(
        &self,
        project_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, AppError>;
    async fn history(&self, project_id: &str) -> Result<HistoryLog, AppError>;
    async fn replace_history(
        &self,
        project_id: &str,
        submissions: Vec<Submission>,
        messages: Vec<Message>,
    ) -> Result<(), AppError>;
    async fn append_history(
        &self,
        project_id: &str,
        submission: Submission,
        message: Message,
    ) -> Result<(), AppError>;
    async fn resources(&self, project_id: &str) -> Result<Vec<Resource>, AppError>;
    async fn read_resource(&self, project_id: &str, rel_path: &str) -> Result<Vec<u8>, AppError>;

    /// Resolve a capture path for the pipeline: relative + valid project id
    /// becomes an absolute path inside that sandbox, anything else is
    /// returned as given.
    fn resolve_capture_path(&self, project_id: Option<&str>, capture_path: &str) -> String;
}

pub struct FsProjectStore {
    root: PathBuf,
}

const SANDBOX_DIRS: [&str; 3] = ["captures", "exports", "logs"];

impl FsProjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn project_dir(&self, project_id: &str) -> Result<PathBuf, AppError> {
        if !is_valid_project_id(project_id) {
            return Err(AppError::NotFound("project_not_found".to_string()));
        }
        let dir = self.root.join(project_id);
        if !dir.is_dir() {
            return Err(AppError::NotFound("project_not_found".to_string()));
        }
        Ok(dir)
    }

    fn read_meta(&self, dir: &Path) -> Result<ProjectMeta, AppError> {
        read_json_or::<ProjectMeta>(&dir.join("project.json"))
            .ok_or_else(|| AppError::NotFound("project_invalid".to_string()))
    }

    fn write_meta(&self, dir: &Path, meta: &ProjectMeta) -> Result<(), AppError> {
        write_json(&dir.join("project.json"), meta)
    }

    fn materialize(&self, project_id: &str) -> Result<PathBuf, AppError> {
        let dir = self.root.join(project_id);
        for sub in SANDBOX_DIRS {
            fs::create_dir_all(dir.join(sub))?;
        }
        Ok(dir)
    }
}

#[async_trait]
impl ProjectStore for FsProjectStore {
    async fn create(&self, name: Option<String>) -> Result<String, AppError> {
        let project_id = fresh_project_id();
        let dir = self.materialize(&project_id)?;
        let timestamp = now_iso();
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| project_id.clone());
        let meta = ProjectMeta {
            version: 1,
            id: project_id.clone(),
            name,
            created_at: timestamp.clone(),
            updated_at: timestamp,
            captures: Vec::new(),
        };
        self.write_meta(&dir, &meta)?;
        write_json(&dir.join("history.json"), &HistoryLog::default())?;
        Ok(project_id)
    }

    async fn import(&self, files: Vec<ImportFile>) -> Result<String, AppError> {
        let project_id = fresh_project_id();
        let dir = self.materialize(&project_id)?;
        for file in files {
            let Some(dest) = resolve_project_path(&dir, &file.path) else {
                tracing::warn!(path = %file.path, "import skipped disallowed entry");
                continue;
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, &file.data)?;
        }

        let timestamp = now_iso();
        let mut meta = read_json_or::<ProjectMeta>(&dir.join("project.json")).unwrap_or_else(|| {
            ProjectMeta {
                version: 1,
                id: project_id.clone(),
                name: project_id.clone(),
                created_at: timestamp.clone(),
                updated_at: timestamp.clone(),
                captures: Vec::new(),
            }
        });
        meta.id = project_id.clone();
        meta.updated_at = timestamp;
        if meta.name.trim().is_empty() {
            meta.name = project_id.clone();
        }
        if meta.captures.is_empty() {
            meta.captures = scan_captures(&dir)?;
        }
        self.write_meta(&dir, &meta)?;

        let history_path = dir.join("history.json");
        if !history_path.exists() {
            write_json(&history_path, &HistoryLog::default())?;
        }
        Ok(project_id)
    }

    async fn get(&self, project_id: &str) -> Result<ProjectMeta, AppError> {
        let dir = self.project_dir(project_id)?;
        self.read_meta(&dir)
    }

    async fn list(&self) -> Result<Vec<ProjectSummary>, AppError> {
        fs::create_dir_all(&self.root)?;
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            let meta = read_json_or::<ProjectMeta>(&entry.path().join("project.json"));
            let updated_at = meta
                .as_ref()
                .map(|m| m.updated_at.clone())
                .or_else(|| {
                    entry.metadata().ok().and_then(|m| m.modified().ok()).map(iso_from_system_time)
                })
                .unwrap_or_else(now_iso);
            out.push(ProjectSummary {
                name: meta.as_ref().map(|m| m.name.clone()).unwrap_or_else(|| id.clone()),
                has_capture: meta.map(|m| !m.captures.is_empty()).unwrap_or(false),
                id,
                updated_at,
            });
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn upload_capture(
        &self,
        project_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> Result<String, AppError> {
        let dir = self.project_dir(project_id)?;
        let safe_name = sanitize_capture_name(name);
        if !safe_name.to_ascii_lowercase().ends_with(CAPTURE_EXT) {
            return Err(AppError::Validation("invalid_capture_name".to_string()));
        }
        let captures_dir = dir.join("captures");
        fs::create_dir_all(&captures_dir)?;
        fs::write(captures_dir.join(&safe_name), bytes)?;

        let relative_path = format!("captures/{safe_name}");
        let timestamp = now_iso();
        let mut meta = self.read_meta(&dir)?;
        meta.updated_at = timestamp.clone();
        meta.captures.insert(
            0,
            Capture { name: safe_name, path: relative_path.clone(), added_at: timestamp },
        );
        self.write_meta(&dir, &meta)?;
        Ok(relative_path)
    }

    async fn history(&self, project_id: &str) -> Result<HistoryLog, AppError> {
        let dir = self.project_dir(project_id)?;
        Ok(read_json_or::<HistoryLog>(&dir.join("history.json")).unwrap_or_default())
    }

    async fn replace_history(
        &self,
        project_id: &str,
        submissions: Vec<Submission>,
        messages: Vec<Message>,
    ) -> Result<(), AppError> {
        let dir = self.project_dir(project_id)?;
        write_json(&dir.join("history.json"), &HistoryLog { version: 1, submissions, messages })?;
        let mut meta = self.read_meta(&dir)?;
        meta.updated_at = now_iso();
        self.write_meta(&dir, &meta)
    }

    async fn append_history(
        &self,
        project_id: &str,
        submission: Submission,
        message: Message,
    ) -> Result<(), AppError> {
        let dir = self.project_dir(project_id)?;
        let mut history = read_json_or::<HistoryLog>(&dir.join("history.json")).unwrap_or_default();
        history.submissions.insert(0, submission);
        history.messages.insert(0, message);
        write_json(&dir.join("history.json"), &history)?;
        let mut meta = self.read_meta(&dir)?;
        meta.updated_at = now_iso();
        self.write_meta(&dir, &meta)
    }

    async fn resources(&self, project_id: &str) -> Result<Vec<Resource>, AppError> {
        let dir = self.project_dir(project_id)?;
        let mut out = Vec::new();
        for name in ["project.json", "history.json"] {
            push_resource(&mut out, &dir.join(name), name);
        }
        for base in SANDBOX_DIRS {
            let base_dir = dir.join(base);
            if !base_dir.is_dir() {
                continue;
            }
            let walk = WalkBuilder::new(&base_dir)
                .hidden(false)
                .ignore(false)
                .git_ignore(false)
                .git_global(false)
                .git_exclude(false)
                .build();
            for dirent in walk.flatten() {
                let path = dirent.path();
                if !path.is_file() {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&dir) {
                    let rel = rel.to_string_lossy().replace('\\', "/");
                    push_resource(&mut out, path, &rel);
                }
            }
        }
        Ok(out)
    }

    async fn read_resource(&self, project_id: &str, rel_path: &str) -> Result<Vec<u8>, AppError> {
        let dir = self.project_dir(project_id)?;
        let abs = resolve_project_path(&dir, rel_path)
            .ok_or_else(|| AppError::NotFound("resource_not_found".to_string()))?;
        if !abs.is_file() {
            return Err(AppError::NotFound("resource_not_found".to_string()));
        }
        Ok(fs::read(abs)?)
    }

    fn resolve_capture_path(&self, project_id: Option<&str>, capture_path: &str) -> String {
        if capture_path.is_empty() || Path::new(capture_path).is_absolute() {
            return capture_path.to_string();
        }
        let Some(project_id) = project_id.filter(|id| is_valid_project_id(id)) else {
            return capture_path.to_string();
        };
        match resolve_under_project(&self.root.join(project_id), capture_path) {
            Some(abs) => abs.to_string_lossy().to_string(),
            None => capture_path.to_string(),
        }
    }
}

fn fresh_project_id() -> String {
    format!("proj-{}", Uuid::new_v4())
}

fn read_json_or<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let raw = serde_json::to_vec_pretty(value)?;
    fs::write(path, raw)?;
    Ok(())
}

/// Rebuild the capture registry by scanning `captures/` for capture files,
/// stamped with each file's modification time.
fn scan_captures(dir: &Path) -> Result<Vec<Capture>, AppError> {
    let captures_dir = dir.join("captures");
    if !captures_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(&captures_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.to_ascii_lowercase().ends_with(CAPTURE_EXT) {
            continue;
        }
        let added_at = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(iso_from_system_time)
            .unwrap_or_else(now_iso);
        out.push(Capture { path: format!("captures/{name}"), name, added_at });
    }
    Ok(out)
}

fn push_resource(out: &mut Vec<Resource>, abs: &Path, rel: &str) {
    let Ok(meta) = fs::metadata(abs) else { return };
    if !meta.is_file() {
        return;
    }
    let updated_at = meta.modified().map(iso_from_system_time).unwrap_or_else(|_| now_iso());
    out.push(Resource {
        path: rel.to_string(),
        kind: classify_resource(rel),
        size: meta.len(),
        updated_at,
    });
}

fn classify_resource(rel: &str) -> ResourceKind {
    let ext = Path::new(rel)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "rdc" => ResourceKind::Capture,
        "png" | "jpg" | "jpeg" | "gif" | "webp" => ResourceKind::Image,
        "json" => ResourceKind::Structured,
        "log" | "txt" => ResourceKind::Log,
        _ => ResourceKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Evidence, PipelineState, Role, SubmissionStatus};
    use std::time::Duration;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> FsProjectStore {
        FsProjectStore::new(dir.path().join("projects"))
    }

    fn submission(id: &str) -> Submission {
        Submission {
            id: id.to_string(),
            timestamp: now_iso(),
            title: format!("question {id}"),
            status: SubmissionStatus::Resolved,
            pipeline_state: PipelineState::default(),
            evidence: Evidence::default(),
        }
    }

    fn agent_message(id: &str, submission_id: &str) -> Message {
        Message {
            id: id.to_string(),
            role: Role::Agent,
            content: None,
            submission_id: Some(submission_id.to_string()),
            status: Some(SubmissionStatus::Resolved),
            steps: None,
            summary: None,
        }
    }

    #[tokio::test]
    async fn create_then_list_sorted_most_recent_first() {
        let dir = tempdir().unwrap();
        let store = store(&dir);

        let first = store.create(Some("alpha".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.create(None).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[1].id, first);
        assert_eq!(listed[1].name, "alpha");
        assert!(!listed[0].has_capture);

        // Touching the older project moves it to the front.
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.upload_capture(&first, "scene.rdc", b"bytes").await.unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed[0].id, first);
        assert!(listed[0].has_capture);
    }

    #[tokio::test]
    async fn upload_capture_prepends_and_sanitizes() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let id = store.create(None).await.unwrap();

        let path = store.upload_capture(&id, "scene.rdc", b"aaaa").await.unwrap();
        assert_eq!(path, "captures/scene.rdc");

        let path = store.upload_capture(&id, "my scene!.rdc", b"bbbb").await.unwrap();
        assert_eq!(path, "captures/my_scene_.rdc");

        let meta = store.get(&id).await.unwrap();
        assert_eq!(meta.captures.len(), 2);
        assert_eq!(meta.captures[0].name, "my_scene_.rdc");
        assert_eq!(meta.captures[1].path, "captures/scene.rdc");

        let err = store.upload_capture(&id, "notes.txt", b"x").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn read_resource_refuses_sandbox_escape() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let id = store.create(None).await.unwrap();
        store.upload_capture(&id, "scene.rdc", b"capture").await.unwrap();

        let ok = store.read_resource(&id, "captures/scene.rdc").await.unwrap();
        assert_eq!(ok, b"capture");

        for path in ["../../etc/passwd", "captures/../../../etc/passwd", "secret.txt"] {
            let err = store.read_resource(&id, path).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)), "expected not-found for {path}");
        }

        let err = store.read_resource("no-such-project", "project.json").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn append_history_twice_keeps_both_most_recent_first() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let id = store.create(None).await.unwrap();

        store.append_history(&id, submission("sub-1"), agent_message("msg-1", "sub-1")).await.unwrap();
        store.append_history(&id, submission("sub-2"), agent_message("msg-2", "sub-2")).await.unwrap();

        let history = store.history(&id).await.unwrap();
        assert_eq!(history.submissions.len(), 2);
        assert_eq!(history.submissions[0].id, "sub-2");
        assert_eq!(history.submissions[1].id, "sub-1");
        assert_eq!(history.messages[0].id, "msg-2");
    }

    #[tokio::test]
    async fn replace_then_get_round_trips_unmodified() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let id = store.create(None).await.unwrap();

        let submissions = vec![submission("sub-a"), submission("sub-b")];
        let messages = vec![agent_message("msg-a", "sub-a")];
        store.replace_history(&id, submissions.clone(), messages.clone()).await.unwrap();

        let history = store.history(&id).await.unwrap();
        assert_eq!(history.version, 1);
        assert_eq!(history.submissions, submissions);
        assert_eq!(history.messages, messages);
    }

    #[tokio::test]
    async fn import_filters_paths_and_rebuilds_capture_registry() {
        let dir = tempdir().unwrap();
        let store = store(&dir);

        let meta_json = serde_json::json!({
            "version": 1,
            "id": "stale-id",
            "name": "Imported",
            "createdAt": "2024-01-01T00:00:00.000Z",
            "updatedAt": "2024-01-01T00:00:00.000Z",
            "captures": []
        });
        let files = vec![
            ImportFile { path: "project.json".to_string(), data: meta_json.to_string().into_bytes() },
            ImportFile { path: "captures/frame.rdc".to_string(), data: b"capture".to_vec() },
            ImportFile { path: "captures/readme.txt".to_string(), data: b"nope".to_vec() },
            ImportFile { path: "../escape.rdc".to_string(), data: b"nope".to_vec() },
            ImportFile { path: "exports/color.png".to_string(), data: b"png".to_vec() },
        ];
        let id = store.import(files).await.unwrap();

        let meta = store.get(&id).await.unwrap();
        assert_eq!(meta.id, id, "imported id is forced to the new project id");
        assert_eq!(meta.name, "Imported");
        assert_eq!(meta.captures.len(), 1);
        assert_eq!(meta.captures[0].path, "captures/frame.rdc");

        let project_dir = dir.path().join("projects").join(&id);
        assert!(project_dir.join("exports/color.png").is_file());
        assert!(!project_dir.join("captures/readme.txt").exists());
        assert!(!dir.path().join("projects/escape.rdc").exists());
        assert!(!dir.path().join("escape.rdc").exists());

        // History materialized even though the import carried none.
        let history = store.history(&id).await.unwrap();
        assert!(history.submissions.is_empty());
    }

    #[tokio::test]
    async fn resources_walk_classifies_by_extension() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let id = store.create(None).await.unwrap();
        store.upload_capture(&id, "scene.rdc", b"capture").await.unwrap();

        let project_dir = dir.path().join("projects").join(&id);
        fs::create_dir_all(project_dir.join("exports/frames")).unwrap();
        fs::write(project_dir.join("exports/frames/color.png"), b"png").unwrap();
        fs::write(project_dir.join("logs/run.log"), b"log").unwrap();

        let resources = store.resources(&id).await.unwrap();
        let kind_of = |path: &str| {
            resources.iter().find(|r| r.path == path).map(|r| r.kind).unwrap_or_else(|| {
                panic!("missing resource {path}: {resources:?}")
            })
        };
        assert_eq!(kind_of("project.json"), ResourceKind::Structured);
        assert_eq!(kind_of("history.json"), ResourceKind::Structured);
        assert_eq!(kind_of("captures/scene.rdc"), ResourceKind::Capture);
        assert_eq!(kind_of("exports/frames/color.png"), ResourceKind::Image);
        assert_eq!(kind_of("logs/run.log"), ResourceKind::Log);
    }

    #[tokio::test]
    async fn resolve_capture_path_rules() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let id = store.create(None).await.unwrap();

        // Absolute paths pass through untouched.
        assert_eq!(store.resolve_capture_path(Some(&id), "/abs/frame.rdc"), "/abs/frame.rdc");
        // No project: relative path passes through.
        assert_eq!(store.resolve_capture_path(None, "captures/frame.rdc"), "captures/frame.rdc");

        // Relative + valid project resolves inside the sandbox.
        let resolved = store.resolve_capture_path(Some(&id), "captures/frame.rdc");
        let expected_root = dir.path().join("projects").join(&id).canonicalize().unwrap();
        assert!(Path::new(&resolved).starts_with(&expected_root));

        // Escaping paths are left as given rather than resolved outside.
        assert_eq!(store.resolve_capture_path(Some(&id), "../other/frame.rdc"), "../other/frame.rdc");
    }
}
