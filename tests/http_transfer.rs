use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, post};
use mailvault::Error;
use mailvault::core::ResolvePolicy;
use mailvault::core::progress::CountingProgress;
use mailvault::core::transfer_engine::{Credentials, Endpoint, HttpTransfer, TransferTarget};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

const AUTH: &str = "Basic YWRtaW46c2VjcmV0";
const ARCHIVE_SIZE: usize = 100_000;

#[derive(Clone, Default)]
struct Received {
    uploads: Arc<Mutex<Vec<(String, usize, Option<String>)>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some(AUTH)
}

async fn export(Path(account): Path<String>, headers: HeaderMap) -> Result<Vec<u8>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if account == "missing@example.org" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(vec![0x1f; ARCHIVE_SIZE])
}

async fn import(
    State(received): State<Received>,
    Path(account): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received
        .uploads
        .lock()
        .unwrap()
        .push((account, body.len(), length));
    StatusCode::OK
}

async fn serve(received: Received) -> SocketAddr {
    let app = Router::new()
        .route("/home/{account}/", get(export))
        .route("/home/{account}", post(import))
        .with_state(received);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint {
        scheme: "http".to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}

fn engine(password: &str) -> HttpTransfer {
    HttpTransfer::new(
        Credentials {
            user: "admin".to_string(),
            password: password.to_string(),
        },
        false,
    )
    .unwrap()
}

#[tokio::test]
async fn test_download_streams_to_file() {
    let addr = serve(Received::default()).await;
    let temp = tempfile::tempdir().unwrap();
    let dest = temp.path().join("accounts/a@example.org.tgz");
    let url = endpoint(addr)
        .download_url("a@example.org", &[], None)
        .unwrap();
    let progress = Arc::new(CountingProgress::default());

    let bytes = engine("secret")
        .download(&url, &dest, progress.clone())
        .await
        .unwrap();

    assert_eq!(bytes, ARCHIVE_SIZE as u64);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), ARCHIVE_SIZE as u64);
    assert_eq!(progress.bytes(), ARCHIVE_SIZE as u64);
    assert!(progress.chunks() >= 1);
}

#[tokio::test]
async fn test_download_error_status() {
    let addr = serve(Received::default()).await;
    let temp = tempfile::tempdir().unwrap();
    let url = endpoint(addr)
        .download_url("missing@example.org", &[], None)
        .unwrap();

    let err = engine("secret")
        .download(
            &url,
            &temp.path().join("missing.tgz"),
            Arc::new(CountingProgress::default()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Transfer(_))));
}

#[tokio::test]
async fn test_download_rejected_credentials() {
    let addr = serve(Received::default()).await;
    let temp = tempfile::tempdir().unwrap();
    let url = endpoint(addr)
        .download_url("a@example.org", &[], None)
        .unwrap();

    let err = engine("wrong")
        .download(
            &url,
            &temp.path().join("a.tgz"),
            Arc::new(CountingProgress::default()),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("401"));
}

#[tokio::test]
async fn test_upload_streams_file_with_length() {
    let received = Received::default();
    let addr = serve(received.clone()).await;
    let temp = tempfile::tempdir().unwrap();
    let source = temp.path().join("a@example.org.tgz");
    std::fs::write(&source, vec![3u8; 50_000]).unwrap();

    let url = endpoint(addr)
        .restore_url("b@example.org", None, &[], ResolvePolicy::Ignore)
        .unwrap();
    let progress = Arc::new(CountingProgress::default());

    let bytes = engine("secret")
        .upload(&url, &source, progress.clone())
        .await
        .unwrap();

    assert_eq!(bytes, 50_000);
    assert_eq!(progress.bytes(), 50_000);
    assert!(progress.chunks() > 1);

    let uploads = received.uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![(
            "b@example.org".to_string(),
            50_000,
            Some("50000".to_string())
        )]
    );
}
