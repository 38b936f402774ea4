//! Registry backends end to end: reference in, verified snapshot out.

use depot::config::Config;
use depot::digest::sha256_bytes;
use depot::oci::spec::DOCKER_MANIFEST_V2;
use depot::store::{FileKind, RefFile};
use depot::{Context, PathMode, Resolver};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn context(store: &Path, server: &str) -> Context {
    let mut config = Config::default();
    config.store.path = store.to_path_buf();
    config.engine.binary = Some("/nonexistent/depot-test-engine".to_string());
    config.network.huggingface_endpoint = server.to_string();
    config.network.modelscope_endpoint = server.to_string();
    config.network.ollama_registry = server.trim_start_matches("http://").to_string();
    config.network.ollama_models_dir = None;
    Context::new(config).unwrap().quiet(true)
}

fn lfs_pointer(body: &[u8]) -> String {
    format!(
        "version https://git-lfs.github.com/spec/v1\noid sha256:{}\nsize {}\n",
        sha256_bytes(body).encoded(),
        body.len()
    )
}

/// Resolve on a blocking thread, returning the ref file and host entry path
async fn pull(store: PathBuf, server: String, reference: String) -> depot::Result<(RefFile, Option<PathBuf>)> {
    tokio::task::spawn_blocking(move || {
        let ctx = context(&store, &server);
        let model = Resolver::new(&ctx)?.resolve(&reference)?;
        let entry = model.entry_path(PathMode::Host).ok();
        Ok((model.ref_file().cloned().unwrap(), entry))
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_huggingface_falls_back_to_direct_url() {
    let server = MockServer::start().await;
    let body = b"raw model bytes".to_vec();
    Mock::given(method("GET"))
        .and(path("/v2/acme/model-gguf/manifests/latest"))
        .and(header("user-agent", "llama-cpp"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/raw/main/model-gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_string(lfs_pointer(&body)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/resolve/main/model-gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (ref_file, _) = pull(dir.path().to_path_buf(), server.uri(), "hf://acme/model-gguf".to_string())
        .await
        .unwrap();

    assert_eq!(ref_file.files.len(), 1);
    assert_eq!(ref_file.files[0].name, "model-gguf");
    assert_eq!(ref_file.files[0].hash, sha256_bytes(&body));
    assert_eq!(ref_file.snapshot_hash, sha256_bytes(&body));
    let blob = dir.path().join("blobs").join(sha256_bytes(&body).file_name());
    assert_eq!(fs::read(blob).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_explicit_tag_is_not_masked_by_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/acme/model-gguf/manifests/Q8_0"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/raw/main/model-gguf"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let err = pull(dir.path().to_path_buf(), server.uri(), "hf://acme/model-gguf:q8_0".to_string())
        .await
        .unwrap_err();

    assert!(err.is_not_found(), "{err}");
    assert_eq!(err.http_status(), Some(404));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_huggingface_manifest_with_mmproj() {
    let server = MockServer::start().await;
    let model = b"gguf weights".to_vec();
    let mmproj = b"projector".to_vec();
    Mock::given(method("GET"))
        .and(path("/v2/acme/vision-GGUF/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ggufFile": { "rfilename": "vision-Q4_K_M.gguf", "blobId": sha256_bytes(&model).encoded() },
            "mmprojFile": { "rfilename": "mmproj-vision-f16.gguf", "blobId": sha256_bytes(&mmproj).encoded() },
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/vision-GGUF/resolve/main/vision-Q4_K_M.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(model.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/vision-GGUF/resolve/main/mmproj-vision-f16.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(mmproj.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/acme/vision-GGUF/resolve/main/config.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let (ref_file, entry) = pull(dir.path().to_path_buf(), server.uri(), "hf://acme/vision-GGUF".to_string())
        .await
        .unwrap();

    // Missing optional sidecars are dropped
    let names: Vec<&str> = ref_file.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["vision-Q4_K_M.gguf", "mmproj-vision-f16.gguf", "config.json"]);
    assert_eq!(ref_file.mmproj().unwrap().kind, FileKind::Mmproj);
    assert_eq!(fs::read(entry.unwrap()).unwrap(), model);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_url_reconstructs_all_parts() {
    let server = MockServer::start().await;
    for i in 1..=3 {
        Mock::given(method("GET"))
            .and(path(format!("/files/llm-{i:05}-of-00003.gguf")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("part {i}")))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let reference = format!("{}/files/llm-00001-of-00003.gguf", server.uri());
    let (ref_file, entry) = pull(dir.path().to_path_buf(), server.uri(), reference).await.unwrap();

    let names: Vec<&str> = ref_file.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(
        names,
        ["llm-00001-of-00003.gguf", "llm-00002-of-00003.gguf", "llm-00003-of-00003.gguf"]
    );
    assert!(ref_file.files.iter().all(|f| f.kind == FileKind::Model));
    assert_eq!(fs::read_to_string(entry.unwrap()).unwrap(), "part 1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_pull_downloads_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models/tiny.gguf"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tiny"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let reference = format!("{}/models/tiny.gguf", server.uri());
    let (first, _) = pull(dir.path().to_path_buf(), server.uri(), reference.clone()).await.unwrap();
    let ref_path = dir.path().join("models/url");
    let (second, _) = pull(dir.path().to_path_buf(), server.uri(), reference).await.unwrap();

    assert_eq!(first, second);
    assert!(ref_path.is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_identical_content_shares_one_blob() {
    let server = MockServer::start().await;
    for name in ["a.gguf", "b.gguf"] {
        Mock::given(method("GET"))
            .and(path(format!("/mirror/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_string("same bytes"))
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let (a, _) = pull(root.clone(), server.uri(), format!("{}/mirror/a.gguf", server.uri()))
        .await
        .unwrap();
    let (b, _) = pull(root.clone(), server.uri(), format!("{}/mirror/b.gguf", server.uri()))
        .await
        .unwrap();
    assert_eq!(a.files[0].hash, b.files[0].hash);

    let server_uri = server.uri();
    let report = tokio::task::spawn_blocking(move || {
        let ctx = context(&root, &server_uri);
        let resolver = Resolver::new(&ctx).unwrap();
        assert!(resolver.remove(&format!("{server_uri}/mirror/a.gguf")).unwrap());
        ctx.store().collect_garbage().unwrap()
    })
    .await
    .unwrap();

    assert!(report.removed_blobs.is_empty());
    assert!(dir.path().join("blobs").join(b.files[0].hash.file_name()).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ollama_pull_over_loopback_registry() {
    let server = MockServer::start().await;
    let config_blob = b"{\"model_format\":\"gguf\"}".to_vec();
    let model = b"ollama weights".to_vec();
    let template = b"{{ .Prompt }}".to_vec();
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": DOCKER_MANIFEST_V2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": sha256_bytes(&config_blob).to_string(),
            "size": config_blob.len(),
        },
        "layers": [
            { "mediaType": "application/vnd.ollama.image.model", "digest": sha256_bytes(&model).to_string(), "size": model.len() },
            { "mediaType": "application/vnd.ollama.image.template", "digest": sha256_bytes(&template).to_string(), "size": template.len() },
        ],
    });
    Mock::given(method("GET"))
        .and(path("/v2/library/tiny/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(serde_json::to_vec(&manifest).unwrap(), DOCKER_MANIFEST_V2),
        )
        .expect(1)
        .mount(&server)
        .await;
    for blob in [&config_blob, &model, &template] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/library/tiny/blobs/{}", sha256_bytes(blob))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let (ref_file, entry) = pull(dir.path().to_path_buf(), server.uri(), "ollama://tiny".to_string())
        .await
        .unwrap();

    let names: Vec<&str> = ref_file.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["config.json", "tiny.gguf", "chat_template"]);
    assert_eq!(ref_file.chat_template().unwrap().hash, sha256_bytes(&template));
    assert_eq!(fs::read(entry.unwrap()).unwrap(), model);
}
