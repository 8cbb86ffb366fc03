use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use bytes::{Bytes, BytesMut};
use git_transport::{
    BackendSelector, RepoHandle,
    backend::BackendKind,
    config::{GitConfig, HttpConfig},
    hash::ObjectHash,
    internal::{
        object::{ObjectTrait, commit::Commit, tree::{Tree, TreeItem, TreeItemMode}, types::ObjectType},
        pack::{decode::Pack, encode::PackEncoder},
    },
    protocol::{
        AccessPolicy, Action, AllowAll, CapabilitySet, Identity, ProtocolError, RefCommand,
        RepositoryResolver, StorageResolver,
        http::{AppState, router},
        pktline::{PktLine, add_flush, add_pkt_line_string, read_all_pkt_lines, read_pkt_line},
        utils::{build_ref_commands, parse_advertisement},
    },
    storage::StorageMode,
};
use tower::ServiceExt;

const SIG: &str = "A U Thor <author@example.com> 1700000000 +0000";

struct ReadOnly;

impl AccessPolicy for ReadOnly {
    fn authorize(&self, _identity: &Identity, _repo: &RepoHandle, action: Action) -> bool {
        action == Action::Read
    }
}

/// Counts authorisation calls and denies everything.
#[derive(Default)]
struct Spy {
    calls: AtomicUsize,
}

impl AccessPolicy for Spy {
    fn authorize(&self, _identity: &Identity, _repo: &RepoHandle, _action: Action) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        false
    }
}

struct NoRepositories;

#[async_trait]
impl RepositoryResolver for NoRepositories {
    async fn resolve(&self, domain: &str, repo: &str) -> Result<RepoHandle, ProtocolError> {
        Err(ProtocolError::not_found(&format!("{domain}/{repo}")))
    }
}

fn mem_selector() -> Arc<BackendSelector> {
    Arc::new(BackendSelector::new(GitConfig {
        storage: StorageMode::Mem,
        ..GitConfig::default()
    }))
}

fn app(selector: Arc<BackendSelector>, policy: Arc<dyn AccessPolicy>) -> Router {
    router(AppState {
        resolver: Arc::new(StorageResolver::new(selector.clone())),
        selector,
        policy,
        config: Arc::new(HttpConfig::default()),
    })
}

async fn body_bytes(response: axum::response::Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

/// A commit with one file, packed, plus its id.
async fn one_commit_pack() -> (Vec<u8>, ObjectHash) {
    let blob = b"hello\n".to_vec();
    let blob_id = ObjectHash::from_type_and_data(ObjectType::Blob, &blob);
    let tree = Tree::from_tree_items(vec![TreeItem {
        mode: TreeItemMode::Blob,
        id: blob_id,
        name: b"README.md".to_vec(),
    }]);
    let commit = Commit::new(tree.id, vec![], SIG, "init");
    let mut pack = Vec::new();
    let mut encoder = PackEncoder::new(3, &mut pack).await.unwrap();
    encoder.add(ObjectType::Commit, &commit.to_data()).await.unwrap();
    encoder.add(ObjectType::Tree, &tree.to_data()).await.unwrap();
    encoder.add(ObjectType::Blob, &blob).await.unwrap();
    encoder.finish().await.unwrap();
    (pack, commit.id)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, service: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("application/x-{service}-request"))
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn missing_repository_is_404_without_access_check() {
    let dir = tempfile::tempdir().unwrap();
    let selector = Arc::new(BackendSelector::new(GitConfig {
        storage: StorageMode::Fs,
        storage_root: dir.path().to_path_buf(),
        ..GitConfig::default()
    }));
    let spy = Arc::new(Spy::default());
    let app = app(selector.clone(), spy.clone());

    let response = app
        .oneshot(get("/acme/widgets/info/refs?service=upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(spy.calls.load(Ordering::SeqCst), 0);
    assert!(!selector.repository_exists("acme", "widgets").await.unwrap());
    assert!(!dir.path().join("acme").exists());
}

#[tokio::test]
async fn custom_resolver_decides_existence() {
    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();
    let app = router(AppState {
        selector,
        resolver: Arc::new(NoRepositories),
        policy: Arc::new(AllowAll),
        config: Arc::new(HttpConfig::default()),
    });
    let response = app
        .oneshot(get("/acme/widgets.git/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bad_service_and_forbidden_push() {
    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();

    let response = app(selector.clone(), Arc::new(AllowAll))
        .oneshot(get("/acme/widgets/info/refs?service=git-frob"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(selector.clone(), Arc::new(AllowAll))
        .oneshot(get("/acme/widgets/info/refs"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(selector.clone(), Arc::new(ReadOnly))
        .oneshot(get("/acme/widgets/info/refs?service=git-receive-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(selector.clone(), Arc::new(ReadOnly))
        .oneshot(post("/acme/widgets/git-receive-pack", "git-receive-pack", b"0000".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(selector, Arc::new(ReadOnly))
        .oneshot(get("/acme/widgets/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn advertisement_headers() {
    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();
    let response = app(selector, Arc::new(AllowAll))
        .oneshot(get("/acme/widgets.git/info/refs?service=git-receive-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-receive-pack-advertisement"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let body = body_bytes(response).await;
    assert!(body.starts_with(b"001f# service=git-receive-pack\n0000"));
    let advertisement = parse_advertisement(body).unwrap();
    assert!(advertisement.refs.is_empty());
    assert_eq!(
        advertisement.capabilities.to_string(),
        CapabilitySet::for_service(git_transport::ServiceKind::ReceivePack).to_string()
    );
}

#[tokio::test]
async fn push_then_fetch_over_http() {
    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();
    let (pack, commit) = one_commit_pack().await;

    let commands = vec![RefCommand::new(ObjectHash::ZERO, commit, "refs/heads/main")];
    let mut request = build_ref_commands(&commands, &CapabilitySet::parse("report-status"))
        .unwrap()
        .to_vec();
    request.extend_from_slice(&pack);
    let response = app(selector.clone(), Arc::new(AllowAll))
        .oneshot(post("/acme/widgets.git/git-receive-pack", "git-receive-pack", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-git-receive-pack-result"
    );
    assert_eq!(
        &body_bytes(response).await[..],
        b"000eunpack ok\n0017ok refs/heads/main\n0000"
    );

    let response = app(selector.clone(), Arc::new(AllowAll))
        .oneshot(get("/acme/widgets/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    let advertisement = parse_advertisement(body_bytes(response).await).unwrap();
    let refs: Vec<_> = advertisement
        .refs
        .iter()
        .map(|r| (r.name.as_str(), r.id))
        .collect();
    assert_eq!(refs, vec![("HEAD", commit), ("refs/heads/main", commit)]);

    let mut fetch = BytesMut::new();
    add_pkt_line_string(&mut fetch, &format!("want {commit} no-thin\n")).unwrap();
    add_flush(&mut fetch);
    add_pkt_line_string(&mut fetch, "done\n").unwrap();
    let response = app(selector, Arc::new(AllowAll))
        .oneshot(post("/acme/widgets/git-upload-pack", "git-upload-pack", fetch.to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = body_bytes(response).await;
    assert_eq!(
        read_pkt_line(&mut body).unwrap(),
        Some(PktLine::Data(Bytes::from_static(b"NAK\n")))
    );
    let decoded = Pack::decode(std::io::Cursor::new(body.to_vec()), |_| Ok(None)).unwrap();
    assert_eq!(decoded.number, 3);
}

#[tokio::test]
async fn fetch_of_unknown_object_reports_err() {
    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();
    let mut fetch = BytesMut::new();
    add_pkt_line_string(&mut fetch, &format!("want {}\n", ObjectHash::new(b"nope"))).unwrap();
    add_flush(&mut fetch);
    add_pkt_line_string(&mut fetch, "done\n").unwrap();

    let response = app(selector, Arc::new(AllowAll))
        .oneshot(post("/acme/widgets/git-upload-pack", "git-upload-pack", fetch.to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // the ERR line is the whole answer and the body ends cleanly
    let mut body = body_bytes(response).await;
    let line = read_pkt_line(&mut body).unwrap().unwrap();
    assert!(line.text().unwrap().starts_with(b"ERR "));
    assert!(body.is_empty());
}

#[tokio::test]
async fn corrupt_push_delivers_report_status() {
    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();
    let (_, commit) = one_commit_pack().await;
    let commands = vec![RefCommand::new(ObjectHash::ZERO, commit, "refs/heads/main")];
    let mut request = build_ref_commands(&commands, &CapabilitySet::parse("report-status"))
        .unwrap()
        .to_vec();
    request.extend_from_slice(b"PACK\0\0\0\x02\0\0\0\x01garbage-that-is-not-zlib");

    let response = app(selector, Arc::new(AllowAll))
        .oneshot(post("/acme/widgets/git-receive-pack", "git-receive-pack", request))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let lines = read_all_pkt_lines(body_bytes(response).await).unwrap();
    let unpack = String::from_utf8_lossy(lines[0].text().unwrap()).into_owned();
    assert!(unpack.starts_with("unpack ") && unpack != "unpack ok", "{unpack}");
    assert_eq!(lines[1].text().unwrap(), b"ng refs/heads/main unpacker error");
    assert_eq!(lines.last(), Some(&PktLine::Flush));
}

#[tokio::test]
async fn subprocess_backend_on_memory_storage_is_rejected() {
    let selector = Arc::new(BackendSelector::new(GitConfig {
        storage: StorageMode::Mem,
        backend: BackendKind::Subprocess,
        ..GitConfig::default()
    }));
    selector.init_repository("acme", "widgets").await.unwrap();
    let response = app(selector, Arc::new(AllowAll))
        .oneshot(get("/acme/widgets/info/refs?service=git-upload-pack"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn gzipped_fetch_request_is_inflated() {
    use std::io::Write;

    let selector = mem_selector();
    selector.init_repository("acme", "widgets").await.unwrap();
    let (pack, commit) = one_commit_pack().await;
    let commands = vec![RefCommand::new(ObjectHash::ZERO, commit, "refs/heads/main")];
    let mut push = build_ref_commands(&commands, &CapabilitySet::parse("report-status"))
        .unwrap()
        .to_vec();
    push.extend_from_slice(&pack);
    app(selector.clone(), Arc::new(AllowAll))
        .oneshot(post("/acme/widgets/git-receive-pack", "git-receive-pack", push))
        .await
        .unwrap();

    let mut fetch = BytesMut::new();
    add_pkt_line_string(&mut fetch, &format!("want {commit}\n")).unwrap();
    add_flush(&mut fetch);
    add_pkt_line_string(&mut fetch, "done\n").unwrap();
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&fetch).unwrap();
    let mut request = post(
        "/acme/widgets/git-upload-pack",
        "git-upload-pack",
        encoder.finish().unwrap(),
    );
    request
        .headers_mut()
        .insert(header::CONTENT_ENCODING, "gzip".parse().unwrap());

    let response = app(selector, Arc::new(AllowAll)).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = body_bytes(response).await;
    assert_eq!(
        read_pkt_line(&mut body).unwrap(),
        Some(PktLine::Data(Bytes::from_static(b"NAK\n")))
    );
    let decoded = Pack::decode(std::io::Cursor::new(body.to_vec()), |_| Ok(None)).unwrap();
    assert_eq!(decoded.number, 3);
}
