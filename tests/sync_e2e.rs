use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mergin_sync::checksum::bytes_checksum;
use mergin_sync::{
    ApiRequest, ApiResponse, ApiVersionStatus, CancelFlag, ClientConfig, MerginClient, Method,
    ProjectFilter, ProjectMetadata, SyncError, SyncStatus, Transport,
};

const ROOT: &str = "http://fake.server";
const TOKEN: &str = "tok-e2e";
const BOUNDARY: &str = "f00dfeedf00dfeedf00dfeed";

/// Timestamps the fake server hands out. They sit far in the future so
/// "server newer than the last sync" situations are constructible against
/// the real clock used for sync stamps.
fn ts(seq: u32) -> String {
    format!("2099-01-01T00:{seq:02}:00.000Z")
}

struct ServerProject {
    namespace: String,
    name: String,
    version: u32,
    updated_seq: u32,
    files: BTreeMap<String, Vec<u8>>,
}

struct PendingPush {
    project: String,
    changes: serde_json::Value,
    chunks: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct ServerState {
    api_version: String,
    login: String,
    password: String,
    seq: u32,
    next_tx: u32,
    projects: HashMap<String, ServerProject>,
    transactions: HashMap<String, PendingPush>,
    log: Vec<ApiRequest>,
    /// Inject a socket failure into this many upcoming chunk exchanges.
    fail_next_chunks: u32,
    /// Answer raw downloads with one multipart batch of the whole project.
    batch_download: bool,
    /// Trip this flag when a push chunk arrives, as if the user cancelled
    /// mid-transfer.
    cancel_on_chunk: Option<CancelFlag>,
    offline: bool,
}

/// The whole server protocol in memory: versioned projects, chunked
/// ranged downloads, push transactions, login. One instance per test.
struct FakeServer {
    state: parking_lot::Mutex<ServerState>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(FakeServer {
            state: parking_lot::Mutex::new(ServerState {
                api_version: "2019.4".into(),
                login: "john".into(),
                password: "secret".into(),
                ..Default::default()
            }),
        })
    }

    fn seed(&self, namespace: &str, name: &str, files: &[(&str, &[u8])]) {
        let mut state = self.state.lock();
        state.seq += 1;
        let project = ServerProject {
            namespace: namespace.into(),
            name: name.into(),
            version: 2,
            updated_seq: state.seq,
            files: files
                .iter()
                .map(|(p, b)| (p.to_string(), b.to_vec()))
                .collect(),
        };
        state.projects.insert(format!("{namespace}/{name}"), project);
    }

    /// Another client's edit: replace a file and publish a new version.
    fn external_edit(&self, full_name: &str, path: &str, content: &[u8]) {
        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        let project = state.projects.get_mut(full_name).unwrap();
        project.files.insert(path.into(), content.to_vec());
        project.version += 1;
        project.updated_seq = seq;
    }

    fn file(&self, full_name: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .projects
            .get(full_name)
            .and_then(|p| p.files.get(path).cloned())
    }

    fn version(&self, full_name: &str) -> u32 {
        self.state.lock().projects.get(full_name).unwrap().version
    }

    fn open_transactions(&self) -> usize {
        self.state.lock().transactions.len()
    }

    fn hits(&self, needle: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|r| r.url.contains(needle))
            .count()
    }
}

fn info_json(project: &ServerProject) -> serde_json::Value {
    json!({
        "name": project.name,
        "namespace": project.namespace,
        "version": format!("v{}", project.version),
        "updated": ts(project.updated_seq),
        "files": project.files.iter().map(|(path, bytes)| json!({
            "path": path,
            "checksum": bytes_checksum(bytes),
            "size": bytes.len(),
            "mtime": "2019-08-01T00:00:00.000Z",
        })).collect::<Vec<_>>(),
    })
}

fn json_reply(status: u16, value: serde_json::Value) -> (u16, Vec<(String, String)>, Vec<u8>) {
    (status, Vec::new(), value.to_string().into_bytes())
}

fn error_reply(status: u16, detail: &str) -> (u16, Vec<(String, String)>, Vec<u8>) {
    json_reply(status, json!({ "detail": detail }))
}

fn path_of(url: &str) -> &str {
    let rest = url.strip_prefix(ROOT).unwrap_or(url);
    rest.split('?').next().unwrap_or(rest)
}

fn query_of(url: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    if let Some((_, query)) = url.split_once('?') {
        for pair in query.split('&') {
            if let Some((k, v)) = pair.split_once('=') {
                out.insert(k.to_string(), v.to_string());
            }
        }
    }
    out
}

/// Inclusive byte range from a `Range: bytes=a-b` header, clipped to the
/// file; past-the-end ranges are empty.
fn ranged(bytes: &[u8], range: Option<&str>) -> Vec<u8> {
    let Some(spec) = range.and_then(|r| r.strip_prefix("bytes=")) else {
        return bytes.to_vec();
    };
    let Some((a, b)) = spec.split_once('-') else {
        return bytes.to_vec();
    };
    let (a, b): (usize, usize) = (a.parse().unwrap(), b.parse().unwrap());
    if a >= bytes.len() {
        return Vec::new();
    }
    bytes[a..=b.min(bytes.len() - 1)].to_vec()
}

fn multipart_body(files: &BTreeMap<String, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::new();
    for (path, bytes) in files {
        out.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{path}\"\r\n\r\n"
            )
            .as_bytes(),
        );
        out.extend_from_slice(bytes);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    out
}

fn apply_finish(state: &mut ServerState, tx: &str) -> Option<serde_json::Value> {
    let pending = state.transactions.remove(tx)?;
    state.seq += 1;
    let seq = state.seq;
    let project = state.projects.get_mut(&pending.project)?;
    for bucket in ["added", "updated", "renamed"] {
        for entry in pending.changes[bucket].as_array()? {
            let path = entry["path"].as_str()?;
            let mut content = Vec::new();
            if let Some(ids) = entry["chunks"].as_array() {
                for id in ids {
                    content.extend_from_slice(pending.chunks.get(id.as_str()?)?);
                }
            }
            project.files.insert(path.to_string(), content);
        }
    }
    for entry in pending.changes["removed"].as_array()? {
        project.files.remove(entry["path"].as_str()?);
    }
    project.version += 1;
    project.updated_seq = seq;
    Some(info_json(project))
}

fn route(state: &mut ServerState, request: &ApiRequest) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let path = path_of(&request.url).to_string();
    let query = query_of(&request.url);

    if path == "/ping" {
        return json_reply(200, json!({ "version": state.api_version }));
    }
    if path == "/v1/auth/login" {
        let body: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(_) => return error_reply(400, "bad login body"),
        };
        if body["login"] == json!(state.login) && body["password"] == json!(state.password) {
            return json_reply(
                200,
                json!({
                    "session": { "token": TOKEN, "expire": "2099-06-01T00:00:00.000Z" },
                    "id": 42, "disk_usage": 17, "storage_limit": 1024,
                }),
            );
        }
        return error_reply(401, "Invalid username or password");
    }

    let expected = format!("Bearer {TOKEN}");
    if request.header_value("Authorization") != Some(expected.as_str()) {
        return error_reply(401, "missing or wrong token");
    }

    if let Some(rest) = path.strip_prefix("/v1/project/raw/") {
        let Some(project) = state.projects.get(rest) else {
            return error_reply(404, "no such project");
        };
        if state.batch_download {
            return (
                200,
                vec![(
                    "Content-Type".into(),
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )],
                multipart_body(&project.files),
            );
        }
        let Some(file) = query.get("file").and_then(|f| project.files.get(f)) else {
            return error_reply(404, "no such file");
        };
        let body = ranged(file, request.header_value("Range"));
        return (
            206,
            vec![("Content-Type".into(), "application/octet-stream".into())],
            body,
        );
    }
    if let Some(rest) = path.strip_prefix("/v1/project/push/chunk/") {
        let (tx, chunk_id) = rest.split_once('/').unwrap();
        let Some(pending) = state.transactions.get_mut(tx) else {
            return error_reply(404, "no such transaction");
        };
        pending
            .chunks
            .insert(chunk_id.to_string(), request.body.clone());
        return json_reply(200, json!({}));
    }
    if let Some(tx) = path.strip_prefix("/v1/project/push/finish/") {
        return match apply_finish(state, tx) {
            Some(info) => json_reply(200, info),
            None => error_reply(404, "no such transaction"),
        };
    }
    if let Some(tx) = path.strip_prefix("/v1/project/push/cancel/") {
        state.transactions.remove(tx);
        return json_reply(200, json!({}));
    }
    if let Some(full) = path.strip_prefix("/v1/project/push/") {
        let Some(project) = state.projects.get(full) else {
            return error_reply(404, "no such project");
        };
        let body: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(_) => return error_reply(400, "bad push body"),
        };
        if body["version"] != json!(format!("v{}", project.version)) {
            return error_reply(409, "version conflict");
        }
        state.next_tx += 1;
        let tx = format!("tx-{}", state.next_tx);
        state.transactions.insert(
            tx.clone(),
            PendingPush {
                project: full.to_string(),
                changes: body["changes"].clone(),
                chunks: HashMap::new(),
            },
        );
        return json_reply(200, json!({ "transaction": tx }));
    }
    if let Some(username) = path.strip_prefix("/v1/user/") {
        if username == state.login {
            return json_reply(200, json!({ "disk_usage": 17, "storage_limit": 1024 }));
        }
        return error_reply(404, "no such user");
    }
    if path == "/v1/project" {
        let listing: Vec<serde_json::Value> = state
            .projects
            .values()
            .map(|p| {
                json!({
                    "name": p.name, "namespace": p.namespace,
                    "creator": 42, "access": { "writers": [42] },
                    "tags": ["input_use"], "updated": ts(p.updated_seq),
                })
            })
            .collect();
        return json_reply(200, serde_json::Value::Array(listing));
    }
    if let Some(rest) = path.strip_prefix("/v1/project/") {
        match request.method {
            Method::Get => {
                return match state.projects.get(rest) {
                    Some(project) => json_reply(200, info_json(project)),
                    None => error_reply(404, "no such project"),
                };
            }
            Method::Delete => {
                return if state.projects.remove(rest).is_some() {
                    json_reply(200, json!({}))
                } else {
                    error_reply(404, "no such project")
                };
            }
            Method::Post => {
                // `rest` is the namespace; the body names the project.
                let body: serde_json::Value = match serde_json::from_slice(&request.body) {
                    Ok(v) => v,
                    Err(_) => return error_reply(400, "bad body"),
                };
                let name = body["name"].as_str().unwrap_or("").to_string();
                state.seq += 1;
                let project = ServerProject {
                    namespace: rest.to_string(),
                    name: name.clone(),
                    version: 1,
                    updated_seq: state.seq,
                    files: BTreeMap::new(),
                };
                state.projects.insert(format!("{rest}/{name}"), project);
                return json_reply(200, json!({}));
            }
        }
    }
    error_reply(404, "unrouted")
}

#[async_trait]
impl Transport for FakeServer {
    async fn execute(&self, request: ApiRequest) -> io::Result<ApiResponse> {
        let mut state = self.state.lock();
        state.log.push(request.clone());
        if state.offline {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "offline"));
        }
        let is_chunk_exchange = request.url.contains("/v1/project/raw/")
            || request.url.contains("/v1/project/push/chunk/");
        if is_chunk_exchange {
            if state.fail_next_chunks > 0 {
                state.fail_next_chunks -= 1;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected"));
            }
            if request.url.contains("/push/chunk/") {
                if let Some(flag) = &state.cancel_on_chunk {
                    flag.cancel();
                }
            }
        }
        let (status, headers, body) = route(&mut state, &request);
        Ok(ApiResponse::new(status, headers, body))
    }
}

fn test_client(server: &Arc<FakeServer>, data_dir: &Path) -> MerginClient {
    let mut cfg = ClientConfig::new(ROOT, data_dir);
    cfg.chunk_size = 5;
    cfg.retry_base_delay = Duration::from_millis(1);
    let transport: Arc<dyn Transport> = server.clone();
    MerginClient::new(cfg, transport)
}

async fn logged_in_client(server: &Arc<FakeServer>, data_dir: &Path) -> Result<MerginClient> {
    let client = test_client(server, data_dir);
    client.login("john", "secret").await?;
    Ok(client)
}

fn write_local(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fresh_pull_downloads_everything() -> Result<()> {
    let server = FakeServer::new();
    // 11 bytes: three chunks at chunk size 5, the last range degenerate.
    server.seed("john", "survey", &[("a.txt", b"hello world"), ("sub/geo.gpkg", b"geo")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;

    let report = client.pull_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(report.pulled.files, 2);
    assert_eq!(report.pulled.bytes, 14);
    assert_eq!(report.version, "v2");

    let dir = data.path().join("survey");
    assert_eq!(std::fs::read(dir.join("a.txt"))?, b"hello world");
    assert_eq!(std::fs::read(dir.join("sub/geo.gpkg"))?, b"geo");

    let meta = ProjectMetadata::load(&dir)?.expect("metadata written");
    assert_eq!(meta.version, "v2");
    assert_eq!(meta.files.len(), 2);
    assert!(meta.last_sync.is_some());
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::UpToDate)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_walks_through_the_lifecycle() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"one")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;

    // Listed but never downloaded.
    client.list_projects(&ProjectFilter::default()).await?;
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::NoVersion)
    );

    client.pull_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::UpToDate)
    );

    // A local edit flips it to modified.
    tokio::time::sleep(Duration::from_millis(50)).await;
    write_local(&data.path().join("survey/a.txt"), b"one edited")?;
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::Modified)
    );

    // Server news alone, with a clean local tree, reads as out of date.
    let server2 = FakeServer::new();
    server2.seed("john", "survey", &[("a.txt", b"one")]);
    let data2 = tempfile::tempdir()?;
    let client2 = logged_in_client(&server2, data2.path()).await?;
    client2.pull_project("john/survey", CancelFlag::new()).await?;
    server2.external_edit("john/survey", "a.txt", b"two");
    client2.list_projects(&ProjectFilter::default()).await?;
    assert_eq!(
        client2.project_status("john/survey"),
        Some(SyncStatus::OutOfDate)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_publishes_adds_edits_and_deletes() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("keep.txt", b"same"), ("old.txt", b"goes away")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    let dir = data.path().join("survey");
    write_local(&dir.join("new.bin"), b"fresh content")?; // 13 bytes, 3 chunks
    write_local(&dir.join("keep.txt"), b"same but longer")?;
    std::fs::remove_file(dir.join("old.txt"))?;

    let report = client.push_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(report.pushed.files, 2); // new.bin + keep.txt
    assert_eq!(report.version, "v3");

    assert_eq!(server.file("john/survey", "new.bin"), Some(b"fresh content".to_vec()));
    assert_eq!(
        server.file("john/survey", "keep.txt"),
        Some(b"same but longer".to_vec())
    );
    assert_eq!(server.file("john/survey", "old.txt"), None);
    assert_eq!(server.version("john/survey"), 3);
    assert_eq!(server.open_transactions(), 0);
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::UpToDate)
    );

    let meta = ProjectMetadata::load(&dir)?.expect("metadata");
    assert_eq!(meta.version, "v3");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_push_pulls_first_and_keeps_local_additions() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("base.txt", b"v one")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    // Someone else publishes, then we edit locally.
    server.external_edit("john/survey", "base.txt", b"v two, longer");
    let dir = data.path().join("survey");
    write_local(&dir.join("local_add.txt"), b"mine")?;

    let report = client.push_project("john/survey", CancelFlag::new()).await?;

    // The catch-up pull fetched the newer base file and spared the
    // not-yet-pushed local addition from the obsolete-file sweep.
    assert!(report.pulled.files >= 1);
    assert_eq!(std::fs::read(dir.join("base.txt"))?, b"v two, longer");
    assert_eq!(report.pushed.files, 1);
    assert_eq!(server.file("john/survey", "local_add.txt"), Some(b"mine".to_vec()));
    assert_eq!(server.version("john/survey"), 4);
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::UpToDate)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_pull_sweeps_files_gone_from_server() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"aaa")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    let dir = data.path().join("survey");
    write_local(&dir.join("leftover.txt"), b"not on server")?;
    server.external_edit("john/survey", "a.txt", b"aaa2");

    client.pull_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(std::fs::read(dir.join("a.txt"))?, b"aaa2");
    assert!(!dir.join("leftover.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_chunk_failures_are_retried() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"hello world")]);
    server.state.lock().fail_next_chunks = 1;
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;

    client.pull_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(
        std::fs::read(data.path().join("survey/a.txt"))?,
        b"hello world"
    );
    // Three chunks for 11 bytes, plus the one failed attempt.
    assert_eq!(server.hits("/v1/project/raw/"), 4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_chunk_failures_abort_without_metadata() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"hello world")]);
    server.state.lock().fail_next_chunks = 99;
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;

    let err = client
        .pull_project("john/survey", CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Transport(_)));
    // The sync never completed, so no metadata was stamped.
    assert!(ProjectMetadata::load(&data.path().join("survey"))?.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_push_drops_the_transaction() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    write_local(&data.path().join("survey/big.bin"), &[7u8; 12])?; // 3 chunks

    let cancel = CancelFlag::new();
    server.state.lock().cancel_on_chunk = Some(cancel.clone());
    let err = client
        .push_project("john/survey", cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(server.open_transactions(), 0);
    assert_eq!(server.hits("/push/cancel/"), 1);
    // Nothing was published.
    assert_eq!(server.file("john/survey", "big.bin"), None);
    assert_eq!(server.version("john/survey"), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_redownload_sets_existing_files_aside() -> Result<()> {
    let server = FakeServer::new();
    server.seed(
        "john",
        "survey",
        &[("data.gpkg", b"server truth"), ("survey.qgs", b"<qgis/>")],
    );
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    // Local and server edits diverge, then the server answers the next
    // download with one multipart batch of the whole project.
    let dir = data.path().join("survey");
    write_local(&dir.join("data.gpkg"), b"local edits")?;
    server.external_edit("john/survey", "data.gpkg", b"server newer");
    server.state.lock().batch_download = true;

    let before = server.hits("/v1/project/raw/");
    let report = client.pull_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(server.hits("/v1/project/raw/") - before, 1);
    assert_eq!(report.pulled.files, 2);

    assert_eq!(std::fs::read(dir.join("data.gpkg"))?, b"server newer");
    assert_eq!(std::fs::read(dir.join("data.gpkg_conflict_copy0"))?, b"local edits");
    assert_eq!(std::fs::read(dir.join("survey.qgs"))?, b"<qgis/>");
    // The batch rewrites every file it carries; existing ones are set
    // aside rather than overwritten, diverged or not.
    assert!(dir.join("survey.qgs_conflict_copy0").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_with_no_changes_skips_the_transaction() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"aaa")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    let report = client.push_project("john/survey", CancelFlag::new()).await?;
    assert_eq!(report.pushed.files, 0);
    assert_eq!(report.version, "v2");
    assert_eq!(server.version("john/survey"), 2);
    assert_eq!(server.hits("/v1/project/push/john/survey"), 0);
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::UpToDate)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_pull_edit_push_roundtrip() -> Result<()> {
    let server = FakeServer::new();
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;

    client.create_project("john", "fresh").await?;
    client.pull_project("john/fresh", CancelFlag::new()).await?;

    write_local(&data.path().join("fresh/readme.txt"), b"hello")?;
    let report = client.push_project("john/fresh", CancelFlag::new()).await?;
    assert_eq!(report.pushed.files, 1);
    assert_eq!(server.file("john/fresh", "readme.txt"), Some(b"hello".to_vec()));
    assert_eq!(server.version("john/fresh"), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_project_keeps_local_files() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"aaa")]);
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;
    client.pull_project("john/survey", CancelFlag::new()).await?;

    client.delete_project("john/survey").await?;
    assert!(server.state.lock().projects.is_empty());
    assert_eq!(
        client.project_status("john/survey"),
        Some(SyncStatus::NoVersion)
    );
    // Only the server side is gone.
    assert!(data.path().join("survey/a.txt").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn old_server_is_refused() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[]);
    server.state.lock().api_version = "2019.2".into();
    let data = tempfile::tempdir()?;
    let client = logged_in_client(&server, data.path()).await?;

    assert_eq!(client.ping().await?, ApiVersionStatus::Incompatible);
    let err = client
        .pull_project("john/survey", CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::VersionIncompatible { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_server_reads_as_not_found() -> Result<()> {
    let server = FakeServer::new();
    server.state.lock().offline = true;
    let data = tempfile::tempdir()?;
    let client = test_client(&server, data.path());

    assert!(client.ping().await.is_err());
    assert_eq!(client.api_version_status(), ApiVersionStatus::NotFound);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_credentials_are_cleared() -> Result<()> {
    let server = FakeServer::new();
    let data = tempfile::tempdir()?;
    let client = test_client(&server, data.path());

    let err = client.login("john", "nope").await.unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));
    assert!(!client.has_credentials().await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn email_logins_reach_the_user_resource_by_name() -> Result<()> {
    let server = FakeServer::new();
    server.state.lock().login = "john@example.com".into();
    let data = tempfile::tempdir()?;
    let client = test_client(&server, data.path());

    client.login("john@example.com", "secret").await?;
    // The fake server only knows the bare username.
    server.state.lock().login = "john".into();
    let info = client.user_info().await?;
    assert_eq!(info.disk_usage, 17);
    assert_eq!(info.storage_limit, 1024);
    assert_eq!(server.hits("/v1/user/john"), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_sync_of_same_project_is_refused() -> Result<()> {
    let server = FakeServer::new();
    server.seed("john", "survey", &[("a.txt", b"hello world")]);
    let data = tempfile::tempdir()?;

    // Park chunk requests so the second call overlaps the first pull.
    struct Slow {
        inner: Arc<FakeServer>,
    }
    #[async_trait]
    impl Transport for Slow {
        async fn execute(&self, request: ApiRequest) -> io::Result<ApiResponse> {
            if request.url.contains("/v1/project/raw/") {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            self.inner.execute(request).await
        }
    }
    let slow: Arc<dyn Transport> = Arc::new(Slow { inner: server.clone() });
    let mut cfg = ClientConfig::new(ROOT, data.path());
    cfg.chunk_size = 5;
    let client = Arc::new(MerginClient::new(cfg, slow));
    client.login("john", "secret").await?;

    let racing = client.clone();
    let first =
        tokio::spawn(async move { racing.pull_project("john/survey", CancelFlag::new()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.pull_project("john/survey", CancelFlag::new()).await;
    assert!(matches!(second, Err(SyncError::SyncInProgress(_))));

    first.await?.expect("first pull completes");
    Ok(())
}
