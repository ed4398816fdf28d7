//! Artifact capture and loading.
//!
//! After the poll loop exits, every observable piece of external state is
//! snapshotted into `artifacts/` so verification can run later, offline and
//! repeatably. Capture is best-effort: each artifact file is always
//! written, with a `capture failed: ...` note in place of content when the
//! underlying tool call failed. `capture.json` records which succeeded.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::config::CaptureConfig;
use crate::error::Result;
use crate::fixture;
use crate::tools::Toolbox;

pub const AGENT_LOG_TAIL: &str = "agent-log-tail.txt";
pub const CHANNEL_HISTORY: &str = "channel-history.txt";
pub const TASK_JSON: &str = "task.json";
pub const TASK_TEXT: &str = "task.txt";
pub const WORKSPACES_JSON: &str = "workspaces.json";
pub const CLAIMS_JSON: &str = "claims.json";
pub const TEST_OUTPUT: &str = "test-output.txt";
pub const REVIEW_JSON: &str = "review.json";
pub const SOURCE_DIR: &str = "source";
pub const MANIFEST: &str = "capture.json";

/// Prefix written in place of content when a capture failed.
pub const CAPTURE_FAILED: &str = "capture failed:";

/// What to capture for one eval.
#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    /// Project channel, captured into `channel-history.txt`.
    pub channel: String,
    /// Other channels, each captured into `channel-<name>.txt`.
    pub peer_channels: Vec<String>,
    pub task_id: Option<String>,
    pub track_review: bool,
    /// Agent stdout logs (stderr siblings are picked up too).
    pub agent_logs: Vec<PathBuf>,
    /// Files copied to `source/<project>/<path>`.
    pub sources: Vec<SourceFile>,
}

/// A project file to snapshot.
#[derive(Clone, Debug)]
pub struct SourceFile {
    pub project: String,
    pub project_dir: PathBuf,
    /// Path relative to the project's checkout.
    pub path: String,
}

/// Artifact name for a peer channel's history.
pub fn peer_channel_artifact(channel: &str) -> String {
    format!("channel-{channel}.txt")
}

/// One line of `capture.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CaptureEntry {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `capture.json`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CaptureManifest {
    pub entries: Vec<CaptureEntry>,
}

impl CaptureManifest {
    pub fn failures(&self) -> impl Iterator<Item = &CaptureEntry> {
        self.entries.iter().filter(|e| !e.ok)
    }

    pub fn all_ok(&self) -> bool {
        self.entries.iter().all(|e| e.ok)
    }
}

/// Last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let mut seen = 0;
    for (idx, byte) in text.trim_end_matches('\n').bytes().enumerate().rev() {
        if byte == b'\n' {
            seen += 1;
            if seen == n {
                return &text[idx + 1..];
            }
        }
    }
    text
}

struct Writer<'d> {
    dir: &'d Path,
    manifest: CaptureManifest,
}

impl Writer<'_> {
    /// Write `name` from `result`, substituting a failure note on error.
    fn put(&mut self, name: &str, result: std::result::Result<String, String>) {
        let (content, error) = match result {
            Ok(content) => (content, None),
            Err(e) => {
                tracing::warn!(artifact = name, error = %e, "capture failed");
                (format!("{CAPTURE_FAILED} {e}\n"), Some(e))
            }
        };
        let path = self.dir.join(name);
        let written = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::write(&path, content));
        let error = match (error, written) {
            (e, Ok(())) => e,
            (_, Err(io)) => {
                tracing::warn!(artifact = name, error = %io, "cannot write artifact");
                Some(format!("write: {io}"))
            }
        };
        self.manifest.entries.push(CaptureEntry {
            name: name.to_owned(),
            ok: error.is_none(),
            error,
        });
    }
}

fn pretty(value: &Value) -> std::result::Result<String, String> {
    serde_json::to_string_pretty(value)
        .map(|s| s + "\n")
        .map_err(|e| e.to_string())
}

/// Capture every artifact into `dir` and write `capture.json`.
///
/// Only failing to create `dir` or to write the manifest is an error.
pub fn capture_all(
    tools: &Toolbox<'_>,
    cfg: &CaptureConfig,
    request: &CaptureRequest,
    dir: &Path,
) -> Result<CaptureManifest> {
    std::fs::create_dir_all(dir)?;
    let _span = tracing::info_span!("capture", dir = %dir.display()).entered();
    let mut w = Writer {
        dir,
        manifest: CaptureManifest::default(),
    };

    w.put(AGENT_LOG_TAIL, Ok(agent_log_tail(&request.agent_logs, cfg.log_tail_lines)));

    w.put(
        CHANNEL_HISTORY,
        tools
            .bus()
            .history(&request.channel, cfg.history_limit)
            .map_err(|e| e.to_string()),
    );
    for peer in &request.peer_channels {
        w.put(
            &peer_channel_artifact(peer),
            tools
                .bus()
                .history(peer, cfg.history_limit)
                .map_err(|e| e.to_string()),
        );
    }

    match &request.task_id {
        Some(id) => {
            let tasks = tools.tasks();
            w.put(
                TASK_JSON,
                tasks.show_json(id).map_err(|e| e.to_string()).and_then(|v| pretty(&v)),
            );
            w.put(TASK_TEXT, tasks.show_text(id).map_err(|e| e.to_string()));
        }
        None => {
            w.put(TASK_JSON, Err("no task id recorded".to_owned()));
            w.put(TASK_TEXT, Err("no task id recorded".to_owned()));
        }
    }

    w.put(
        WORKSPACES_JSON,
        tools
            .maw()
            .ws_list_json()
            .map_err(|e| e.to_string())
            .and_then(|v| pretty(&v)),
    );
    w.put(
        CLAIMS_JSON,
        tools
            .bus()
            .claims_list()
            .map_err(|e| e.to_string())
            .and_then(|v| pretty(&v)),
    );

    if cfg.run_tests {
        w.put(TEST_OUTPUT, test_output(tools));
    }

    if request.track_review {
        w.put(REVIEW_JSON, review(tools));
    }

    for src in &request.sources {
        let name = format!("{SOURCE_DIR}/{}/{}", src.project, src.path);
        let content = fixture::check_relative(&src.path)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                let path = fixture::checkout_dir(&src.project_dir).join(&src.path);
                std::fs::read_to_string(path).map_err(|e| e.to_string())
            });
        w.put(&name, content);
    }

    let manifest = w.manifest;
    std::fs::write(dir.join(MANIFEST), serde_json::to_string_pretty(&manifest)?)?;
    let failed = manifest.failures().count();
    tracing::info!(artifacts = manifest.entries.len(), failed, "capture finished");
    Ok(manifest)
}

fn agent_log_tail(logs: &[PathBuf], n: usize) -> String {
    let mut out = String::new();
    for log in logs {
        let stderr = log.with_extension("stderr");
        for path in [log, &stderr] {
            let name = path.file_name().map_or_else(
                || path.display().to_string(),
                |f| f.to_string_lossy().into_owned(),
            );
            match std::fs::read_to_string(path) {
                Ok(text) if path == &stderr && text.trim().is_empty() => {}
                Ok(text) => {
                    let _ = writeln!(out, "=== {name} ===");
                    out.push_str(tail_lines(&text, n));
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                Err(e) => {
                    let _ = writeln!(out, "=== {name} ===\n{CAPTURE_FAILED} {e}");
                }
            }
        }
    }
    out
}

fn test_output(tools: &Toolbox<'_>) -> std::result::Result<String, String> {
    let cmd = tools
        .command(&tools.bins().cargo)
        .arg("test")
        .cwd(fixture::checkout_dir(tools.project_dir()));
    let out = tools.runner().run(&cmd).map_err(|e| e.to_string())?;
    let status = out
        .status
        .map_or_else(|| "signal".to_owned(), |c| c.to_string());
    Ok(format!("{}{}\nexit: {status}\n", out.stdout, out.stderr))
}

fn review(tools: &Toolbox<'_>) -> std::result::Result<String, String> {
    let crit = tools.crit();
    let list = crit.reviews_json().map_err(|e| e.to_string())?;
    let Some(id) = crate::tools::crit::review_ids(&list).pop() else {
        return Err("no review found".to_owned());
    };
    pretty(&crit.review_json(&id).map_err(|e| e.to_string())?)
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Every captured artifact, keyed by path relative to the artifacts dir.
#[derive(Clone, Debug, Default)]
pub struct ArtifactSet {
    dir: PathBuf,
    files: BTreeMap<String, String>,
}

impl ArtifactSet {
    /// Read every file under `dir`. Unreadable files are skipped; an
    /// unreadable directory is an error.
    pub fn load(dir: &Path) -> Result<Self> {
        fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) -> std::io::Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    walk(root, &path, files)?;
                    continue;
                }
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                match std::fs::read(&path) {
                    Ok(bytes) => {
                        files.insert(key, String::from_utf8_lossy(&bytes).into_owned());
                    }
                    Err(e) => tracing::warn!(artifact = %key, error = %e, "unreadable artifact"),
                }
            }
            Ok(())
        }

        let mut files = BTreeMap::new();
        walk(dir, dir, &mut files)?;
        Ok(Self {
            dir: dir.to_owned(),
            files,
        })
    }

    /// Build a set in memory.
    pub fn from_files<I, K, V>(files: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            dir: PathBuf::new(),
            files: files
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Artifact content; `None` when absent or when its capture failed.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.files
            .get(name)
            .map(String::as_str)
            .filter(|text| !text.starts_with(CAPTURE_FAILED))
    }

    /// Artifact parsed as JSON.
    pub fn json(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|text| serde_json::from_str(text).ok())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolsConfig;
    use crate::tools::ToolOutput;
    use crate::tools::fake::ScriptedRunner;

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb\nc", 5), "a\nb\nc");
        assert_eq!(tail_lines("a\nb\nc", 1), "c");
        assert_eq!(tail_lines("abc", 0), "");
    }

    fn request(root: &Path) -> CaptureRequest {
        let log = root.join("agent-eval-dev.log");
        std::fs::write(&log, "line 1\nline 2\nclosed bd-1\n").unwrap();
        std::fs::write(root.join("agent-eval-dev.stderr"), "").unwrap();
        std::fs::create_dir_all(root.join("evalproj/src")).unwrap();
        std::fs::write(root.join("evalproj/src/lib.rs"), "pub fn f() {}\n").unwrap();
        CaptureRequest {
            channel: "evalproj".to_owned(),
            peer_channels: vec!["other".to_owned()],
            task_id: Some("bd-1".to_owned()),
            track_review: false,
            agent_logs: vec![log],
            sources: vec![SourceFile {
                project: "evalproj".to_owned(),
                project_dir: root.join("evalproj"),
                path: "src/lib.rs".to_owned(),
            }],
        }
    }

    #[test]
    fn writes_every_artifact_even_when_tools_fail() {
        let project = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        // Nothing scripted: every tool call exits 127.
        let runner = ScriptedRunner::new();
        let tools = Toolbox::new(&runner, ToolsConfig::default(), project.path());

        let manifest =
            capture_all(&tools, &CaptureConfig::default(), &request(project.path()), out.path())
                .unwrap();

        for name in [
            AGENT_LOG_TAIL,
            CHANNEL_HISTORY,
            TASK_JSON,
            TASK_TEXT,
            WORKSPACES_JSON,
            CLAIMS_JSON,
            TEST_OUTPUT,
            "channel-other.txt",
            "source/evalproj/src/lib.rs",
            MANIFEST,
        ] {
            assert!(out.path().join(name).exists(), "{name} missing");
        }
        let task = std::fs::read_to_string(out.path().join(TASK_JSON)).unwrap();
        assert!(task.starts_with(CAPTURE_FAILED), "{task}");
        assert!(!manifest.all_ok());
        assert!(manifest.entries.iter().any(|e| e.name == AGENT_LOG_TAIL && e.ok));
    }

    #[test]
    fn successful_capture_loads_back() {
        let project = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new()
            .on("bus", &["history"], ToolOutput::ok("eval-dev: done\n"))
            .on("bus", &["claims", "list"], ToolOutput::ok("[]"))
            .on(
                "maw",
                &["exec", "default", "--", "br", "show", "bd-1", "--json"],
                ToolOutput::ok(r#"{"id":"bd-1","status":"closed"}"#),
            )
            .on(
                "maw",
                &["exec", "default", "--", "br", "show", "bd-1"],
                ToolOutput::ok("bd-1 closed"),
            )
            .on("maw", &["ws", "list"], ToolOutput::ok(r#"{"workspaces":[{"name":"default"}]}"#))
            .on("cargo", &["test"], ToolOutput::ok("test result: ok. 3 passed"));
        let tools = Toolbox::new(&runner, ToolsConfig::default(), project.path());

        let manifest =
            capture_all(&tools, &CaptureConfig::default(), &request(project.path()), out.path())
                .unwrap();
        assert!(manifest.all_ok(), "{manifest:?}");

        let set = ArtifactSet::load(out.path()).unwrap();
        assert_eq!(set.get(CHANNEL_HISTORY), Some("eval-dev: done\n"));
        assert_eq!(set.get("channel-other.txt"), Some("eval-dev: done\n"));
        assert_eq!(set.json(TASK_JSON).unwrap()["status"], "closed");
        assert!(set.get(TEST_OUTPUT).unwrap().contains("exit: 0"));
        assert!(set.get(AGENT_LOG_TAIL).unwrap().contains("closed bd-1"));
        assert!(!set.get(AGENT_LOG_TAIL).unwrap().contains(".stderr"));
        assert_eq!(set.get("source/evalproj/src/lib.rs"), Some("pub fn f() {}\n"));
    }

    #[test]
    fn failed_captures_read_as_missing() {
        let set = ArtifactSet::from_files([
            (TASK_JSON, "capture failed: br exited with code 1\n"),
            (CLAIMS_JSON, "[]"),
        ]);
        assert_eq!(set.get(TASK_JSON), None);
        assert_eq!(set.json(CLAIMS_JSON), Some(serde_json::json!([])));
        assert_eq!(set.get("nope"), None);
    }

    #[test]
    fn load_missing_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ArtifactSet::load(&dir.path().join("absent")).is_err());
    }
}
