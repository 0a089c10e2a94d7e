//! Single-flight upload receiver
//!
//! Serves `POST /v1alpha1/upload` over TLS inside the receiver pod. The first
//! well-formed request claims the [`Session`], streams its body into the
//! destination file, and on success closes the session, which shuts the
//! server down. Concurrent requests get 503, requests after completion get
//! 409, and any other method on the upload path gets 404.

mod session;

pub use session::{Session, SessionState, Transition, UploadPermit};

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures::TryStreamExt;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

use crate::claim::ObjectKey;
use crate::config::{TokenVerification, UploadServerConfig};
use crate::token::{keys, open_token, RsaTokenCrypto, TokenCrypto};
use crate::{Error, UPLOAD_PATH};

/// Time in-flight responses get to finish once the upload is done
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Upload request failures, mapped onto HTTP status codes
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Wrong method on the upload path
    #[error("not found")]
    NotFound,

    /// Another upload is in progress; retry later
    #[error("upload in progress")]
    Busy,

    /// This receiver already accepted its upload
    #[error("upload already completed")]
    AlreadyCompleted,

    /// Missing or invalid upload token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The transfer failed
    #[error("internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// HTTP status for this error
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::NotFound => StatusCode::NOT_FOUND,
            UploadError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::AlreadyCompleted => StatusCode::CONFLICT,
            UploadError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Token check applied to every upload before the session is touched
pub struct UploadAuth {
    private_key: RsaPrivateKey,
    issuer: RsaPublicKey,
    claim: ObjectKey,
    crypto: Arc<dyn TokenCrypto>,
}

impl UploadAuth {
    /// Accept tokens sealed for `private_key`, signed by `issuer`, naming `claim`
    pub fn new(
        private_key: RsaPrivateKey,
        issuer: RsaPublicKey,
        claim: ObjectKey,
        crypto: Arc<dyn TokenCrypto>,
    ) -> Self {
        Self {
            private_key,
            issuer,
            claim,
            crypto,
        }
    }

    /// Load key material named by the receiver configuration
    pub fn load(settings: &TokenVerification) -> Result<Self, Error> {
        Ok(Self::new(
            keys::load_private_key(&settings.private_key_file)?,
            keys::load_public_key(&settings.issuer_public_key_file)?,
            settings.claim.clone(),
            Arc::new(RsaTokenCrypto),
        ))
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), UploadError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| UploadError::Unauthorized("missing bearer token".into()))?;

        let data = open_token(self.crypto.as_ref(), token.trim(), &self.private_key, &self.issuer)
            .map_err(|e| UploadError::Unauthorized(e.to_string()))?;

        if data.name != self.claim.name || data.namespace != self.claim.namespace {
            return Err(UploadError::Unauthorized(format!(
                "token is for {}/{}, not {}",
                data.namespace, data.name, self.claim
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    session: Arc<Session>,
    destination: Arc<PathBuf>,
    auth: Option<Arc<UploadAuth>>,
}

/// Build the receiver router around a session
pub fn router(session: Arc<Session>, destination: PathBuf, auth: Option<Arc<UploadAuth>>) -> Router {
    let state = AppState {
        session,
        destination: Arc::new(destination),
        auth,
    };
    Router::new()
        .route(UPLOAD_PATH, any(upload_handler))
        .with_state(state)
}

async fn upload_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, UploadError> {
    if method != Method::POST {
        return Err(UploadError::NotFound);
    }

    if let Some(auth) = &state.auth {
        auth.authorize(&headers).inspect_err(|e| {
            warn!(error = %e, "rejecting upload");
        })?;
    }

    let permit = state.session.begin().map_err(|current| match current {
        SessionState::Done => UploadError::AlreadyCompleted,
        _ => UploadError::Busy,
    })?;

    info!(destination = %state.destination.display(), "upload started");
    match save_stream(body, &state.destination).await {
        Ok(bytes) => {
            permit.finish();
            info!(bytes, "upload completed");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            // Dropping the permit returns the session to Idle
            drop(permit);
            error!(error = %e, "upload failed");
            Err(UploadError::Internal(e.to_string()))
        }
    }
}

/// Stream a request body into `destination`, returning the bytes written
pub async fn save_stream(body: Body, destination: &Path) -> io::Result<u64> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(destination).await?;

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    tokio::pin!(reader);
    let written = tokio::io::copy(&mut reader, &mut file).await?;

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Receiver process: one TLS listener, one session
pub struct UploadServer {
    config: UploadServerConfig,
    session: Arc<Session>,
    auth: Option<Arc<UploadAuth>>,
}

impl UploadServer {
    /// Prepare a receiver, loading token keys when verification is enabled
    pub fn new(config: UploadServerConfig) -> Result<Self, Error> {
        let auth = config
            .token
            .as_ref()
            .map(UploadAuth::load)
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            config,
            session: Arc::new(Session::new()),
            auth,
        })
    }

    /// The receiver's session
    pub fn session(&self) -> Arc<Session> {
        self.session.clone()
    }

    /// Serve until one upload completes or the listener fails
    pub async fn run(self) -> Result<(), Error> {
        let tls = RustlsConfig::from_pem_file(&self.config.tls.cert, &self.config.tls.key)
            .await
            .map_err(|e| Error::config(format!("TLS config error: {e}")))?;

        let app = router(
            self.session.clone(),
            self.config.destination.clone(),
            self.auth.clone(),
        );
        let handle = Handle::new();

        info!(
            addr = %self.config.listen_addr,
            pvc_dir = %self.config.pvc_dir.display(),
            destination = %self.config.destination.display(),
            token_auth = self.auth.is_some(),
            "starting upload server"
        );
        let server = axum_server::bind_rustls(self.config.listen_addr, tls)
            .handle(handle.clone())
            .serve(app.into_make_service());

        drive(server, handle, self.session).await
    }
}

/// Race the listener against upload completion
///
/// Completion triggers a graceful shutdown and success; the listener ending
/// first, with or without an error, is a failure.
pub(crate) async fn drive<F>(server: F, handle: Handle, session: Arc<Session>) -> Result<(), Error>
where
    F: Future<Output = io::Result<()>>,
{
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => match result {
            Ok(()) => Err(Error::server("listener stopped before an upload completed")),
            Err(e) => Err(Error::server(format!("listener failed: {e}"))),
        },
        _ = session.completed() => {
            info!("upload complete, shutting down");
            handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            server
                .await
                .map_err(|e| Error::server(format!("shutdown failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::issue_token;
    use crate::token::test_keys::{issuer, recipient, stranger};
    use axum::body::Bytes;
    use axum::http::Request;
    use tokio::io::AsyncReadExt;
    use tower::ServiceExt;

    fn post(body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(UPLOAD_PATH)
            .body(body.into())
            .unwrap()
    }

    fn setup() -> (tempfile::TempDir, PathBuf, Arc<Session>) {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("nested").join("disk.img");
        (dir, destination, Arc::new(Session::new()))
    }

    /// Story: one upload lands on disk, then the receiver refuses more
    #[tokio::test]
    async fn story_upload_then_conflict() {
        let (_dir, destination, session) = setup();
        let app = router(session.clone(), destination.clone(), None);

        let response = app.clone().oneshot(post("disk image bytes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(std::fs::read(&destination).unwrap(), b"disk image bytes");
        assert_eq!(session.state(), SessionState::Done);
        assert!(session.is_completed());

        let response = app.oneshot(post("again")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(std::fs::read(&destination).unwrap(), b"disk image bytes");
    }

    #[tokio::test]
    async fn concurrent_upload_is_busy() {
        let (_dir, destination, session) = setup();
        let app = router(session.clone(), destination, None);
        let _in_flight = session.begin().unwrap();

        let response = app.oneshot(post("second")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(session.state(), SessionState::Uploading);
    }

    #[tokio::test]
    async fn other_methods_are_not_found() {
        let (_dir, destination, session) = setup();
        let app = router(session.clone(), destination, None);

        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let request = Request::builder()
                .method(method)
                .uri(UPLOAD_PATH)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        assert_eq!(session.state(), SessionState::Idle);
    }

    /// Story: a transfer that breaks midway can be retried
    #[tokio::test]
    async fn story_failed_transfer_reverts_to_idle() {
        let (_dir, destination, session) = setup();
        let app = router(session.clone(), destination.clone(), None);

        let broken = Body::from_stream(futures::stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ]));
        let response = app.clone().oneshot(post(broken)).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_completed());

        let response = app.oneshot(post("complete image")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(std::fs::read(&destination).unwrap(), b"complete image");
    }

    fn auth() -> Arc<UploadAuth> {
        Arc::new(UploadAuth::new(
            recipient().clone(),
            issuer().to_public_key(),
            ObjectKey::new("ns1", "pvc1"),
            Arc::new(RsaTokenCrypto),
        ))
    }

    fn post_with_token(token: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(UPLOAD_PATH)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from("image"))
            .unwrap()
    }

    fn token_for(name: &str, signer: &RsaPrivateKey) -> String {
        issue_token(
            &RsaTokenCrypto,
            name,
            "ns1",
            &recipient().to_public_key(),
            signer,
        )
        .unwrap()
    }

    /// Story: bad or missing tokens never consume the session
    #[tokio::test]
    async fn story_tokens_gate_the_session() {
        let (_dir, destination, session) = setup();
        let app = router(session.clone(), destination, Some(auth()));

        let response = app.clone().oneshot(post("no token")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let forged = token_for("pvc1", stranger());
        let response = app.clone().oneshot(post_with_token(&forged)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let other_claim = token_for("pvc2", issuer());
        let response = app
            .clone()
            .oneshot(post_with_token(&other_claim))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(session.state(), SessionState::Idle);

        let valid = token_for("pvc1", issuer());
        let response = app.oneshot(post_with_token(&valid)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(session.state(), SessionState::Done);
    }

    #[tokio::test]
    async fn listener_failure_is_a_run_error() {
        let session = Arc::new(Session::new());
        let failed = async { Err(io::Error::other("address in use")) };
        let err = drive(failed, Handle::new(), session).await.unwrap_err();
        assert!(matches!(err, Error::Server(_)));
    }

    /// Story: the server process exits cleanly right after its one upload
    #[tokio::test]
    async fn story_server_shuts_down_after_upload() {
        let (_dir, destination, session) = setup();
        let app = router(session.clone(), destination.clone(), None);
        let handle = Handle::new();
        let server = axum_server::bind("127.0.0.1:0".parse().unwrap())
            .handle(handle.clone())
            .serve(app.into_make_service());
        let running = tokio::spawn(drive(server, handle.clone(), session));

        let addr = handle.listening().await.expect("server should bind");
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let body = "uploaded over the wire";
        let request = format!(
            "POST {UPLOAD_PATH} HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got {response}");

        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), body.as_bytes());
    }
}
