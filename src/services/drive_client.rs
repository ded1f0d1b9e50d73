//! Google Drive access for listing and downloading spreadsheets.
//!
//! [`DriveApi`] is the seam the worker and the handlers talk to;
//! [`GoogleDrive`] implements it over the Drive v3 REST API, authenticating
//! each service account with the OAuth2 JWT-bearer grant.

use crate::models::{
    credential::ServiceAccount,
    drive_file::{FileSummary, SPREADSHEET_MIME_TYPES, SpreadsheetKind, XLSX_MIME},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::StreamExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Scopes requested for every access token.
pub const DRIVE_SCOPES: &str = "https://www.googleapis.com/auth/drive.readonly \
                                https://www.googleapis.com/auth/spreadsheets.readonly";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Cached tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("cannot authenticate service account: {0}")]
    Auth(String),
    #[error("Drive API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("file `{0}` is not a spreadsheet")]
    NotSpreadsheet(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type DriveResult<T> = Result<T, DriveError>;

#[async_trait]
pub trait DriveApi: Send + Sync {
    /// List spreadsheet files visible to `account`, at most `page_size`.
    async fn list_spreadsheets(
        &self,
        account: &ServiceAccount,
        page_size: usize,
    ) -> DriveResult<Vec<FileSummary>>;

    /// Fetch the full content of `file`, exporting native sheets to XLSX.
    async fn download(&self, account: &ServiceAccount, file: &FileSummary) -> DriveResult<Bytes>;
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct GoogleDrive {
    http: reqwest::Client,
    base_url: String,
    default_token_url: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<FileSummary>,
}

impl GoogleDrive {
    /// `base_url` is the Drive v3 root; `default_token_url` is used for keys
    /// that do not carry a `token_uri`.
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        default_token_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_token_url: default_token_url.into(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn token_url<'a>(&'a self, account: &'a ServiceAccount) -> &'a str {
        account
            .token_uri
            .as_deref()
            .unwrap_or(&self.default_token_url)
    }

    /// Return a valid access token for `account`, exchanging a fresh signed
    /// assertion when the cached one is missing or about to expire.
    ///
    /// The cache lock is only held to read or insert, never across the
    /// exchange.
    async fn access_token(&self, account: &ServiceAccount) -> DriveResult<String> {
        if let Some(token) = self.cached_token(&account.client_email).await {
            return Ok(token);
        }

        let token_url = self.token_url(account);
        let assertion = sign_assertion(account, token_url, Utc::now().timestamp())?;
        debug!(client_email = %account.client_email, "exchanging JWT assertion for access token");

        let response = self
            .http
            .post(token_url)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(
            token
                .expires_in
                .unwrap_or(ASSERTION_LIFETIME_SECS as u64),
        );
        self.tokens.lock().await.insert(
            account.client_email.clone(),
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at: Instant::now() + lifetime,
            },
        );
        Ok(token.access_token)
    }

    async fn cached_token(&self, client_email: &str) -> Option<String> {
        let tokens = self.tokens.lock().await;
        tokens
            .get(client_email)
            .filter(|cached| cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN)
            .map(|cached| cached.access_token.clone())
    }

    async fn get(
        &self,
        account: &ServiceAccount,
        url: &str,
        query: &[(&str, String)],
    ) -> DriveResult<reqwest::Response> {
        let token = self.access_token(account).await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(api_error(status.as_u16(), &body))
        }
    }
}

#[async_trait]
impl DriveApi for GoogleDrive {
    async fn list_spreadsheets(
        &self,
        account: &ServiceAccount,
        page_size: usize,
    ) -> DriveResult<Vec<FileSummary>> {
        let url = format!("{}/files", self.base_url);
        let query = [
            ("q", spreadsheet_query()),
            ("pageSize", page_size.to_string()),
            ("fields", "files(id,name,mimeType,modifiedTime)".to_string()),
            ("supportsAllDrives", "true".to_string()),
            ("includeItemsFromAllDrives", "true".to_string()),
        ];
        let list: FileList = self.get(account, &url, &query).await?.json().await?;
        debug!(count = list.files.len(), "listed spreadsheet files");
        Ok(list.files)
    }

    async fn download(&self, account: &ServiceAccount, file: &FileSummary) -> DriveResult<Bytes> {
        let kind = file
            .spreadsheet_kind()
            .ok_or_else(|| DriveError::NotSpreadsheet(file.name.clone()))?;
        let response = match kind {
            SpreadsheetKind::GoogleSheet => {
                let url = format!("{}/files/{}/export", self.base_url, file.id);
                self.get(account, &url, &[("mimeType", XLSX_MIME.to_string())])
                    .await?
            }
            SpreadsheetKind::Workbook | SpreadsheetKind::Csv => {
                let url = format!("{}/files/{}", self.base_url, file.id);
                self.get(account, &url, &[("alt", "media".to_string())])
                    .await?
            }
        };

        // Hand back nothing until the last chunk has arrived.
        let mut buffer = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        debug!(file_id = %file.id, size = buffer.len(), "downloaded file");
        Ok(buffer.freeze())
    }
}

/// Drive `q` expression matching every supported spreadsheet type.
pub fn spreadsheet_query() -> String {
    let types = SPREADSHEET_MIME_TYPES
        .iter()
        .map(|mime| format!("mimeType='{}'", mime))
        .collect::<Vec<_>>()
        .join(" or ");
    format!("({}) and trashed = false", types)
}

/// Build the RS256-signed assertion for the JWT-bearer grant.
pub fn sign_assertion(account: &ServiceAccount, audience: &str, now: i64) -> DriveResult<String> {
    let pem = account.private_key.replace("\\n", "\n");
    let key = EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|err| DriveError::Auth(format!("invalid private key: {}", err)))?;

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(account.private_key_id.clone());
    let claims = Claims {
        iss: &account.client_email,
        scope: DRIVE_SCOPES,
        aud: audience,
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
    };

    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|err| DriveError::Auth(format!("failed to sign assertion: {}", err)))
}

/// Extract Google's error message from a failed response body.
///
/// Drive answers `{"error": {"message": ...}}`, the token endpoint answers
/// `{"error": "...", "error_description": ...}`; anything else is passed
/// through as text.
fn api_error(status: u16, body: &str) -> DriveError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error_description"))
                .or_else(|| v.get("error"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    DriveError::Api { status, message }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::drive_file::{CSV_MIME, GOOGLE_SHEET_MIME},
        services::credential_store::{CredentialStore, tests::sample_key},
    };
    use axum::{
        Form, Json, Router,
        body::Body,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    };
    use serde_json::json;
    use std::{
        convert::Infallible,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::net::TcpListener;

    const TEST_KEY: &str = include_str!("../../testdata/service_account_key.pem");
    const ACCESS_TOKEN: &str = "ya29.test-token";

    #[test]
    fn query_covers_all_spreadsheet_types() {
        let q = spreadsheet_query();
        for mime in SPREADSHEET_MIME_TYPES {
            assert!(q.contains(&format!("mimeType='{}'", mime)));
        }
        assert!(q.ends_with("and trashed = false"));
    }

    #[test]
    fn drive_error_message_is_passed_through() {
        let body = r#"{"error": {"code": 403, "message": "The caller does not have permission"}}"#;
        match api_error(403, body) {
            DriveError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "The caller does not have permission");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn token_endpoint_error_uses_description() {
        let body = r#"{"error": "invalid_grant", "error_description": "Invalid JWT Signature."}"#;
        let err = api_error(400, body);
        assert_eq!(err.to_string(), "Drive API returned 400: Invalid JWT Signature.");
    }

    #[test]
    fn plain_text_error_body_is_kept() {
        let err = api_error(502, "  upstream unavailable \n");
        assert_eq!(err.to_string(), "Drive API returned 502: upstream unavailable");
    }

    #[test]
    fn signing_with_a_malformed_key_is_an_auth_error() {
        let account = CredentialStore::validate(&sample_key("bot@demo.iam")).unwrap();
        let err = sign_assertion(&account, "https://oauth2.googleapis.com/token", 0).unwrap_err();
        assert!(matches!(err, DriveError::Auth(_)));
    }

    #[tokio::test]
    async fn download_rejects_non_spreadsheets_before_any_request() {
        let drive = GoogleDrive::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/drive/v3/",
            "http://127.0.0.1:9/token",
        );
        let account = CredentialStore::validate(&sample_key("bot@demo.iam")).unwrap();
        let file = FileSummary {
            id: "1".into(),
            name: "slides".into(),
            mime_type: "application/vnd.google-apps.presentation".into(),
            modified_time: None,
        };
        let err = drive.download(&account, &file).await.unwrap_err();
        assert!(matches!(err, DriveError::NotSpreadsheet(name) if name == "slides"));
        assert_eq!(drive.base_url, "http://127.0.0.1:9/drive/v3");
    }

    fn signed_account(client_email: &str, token_uri: Option<String>) -> ServiceAccount {
        let mut key = json!({
            "type": "service_account",
            "project_id": "demo-project",
            "private_key_id": "key-1",
            "private_key": TEST_KEY,
            "client_email": client_email,
        });
        if let Some(uri) = token_uri {
            key["token_uri"] = json!(uri);
        }
        CredentialStore::validate(&serde_json::to_vec(&key).unwrap()).unwrap()
    }

    #[derive(Clone, Default)]
    struct Recorded {
        token_requests: Arc<AtomicUsize>,
        list_query: Arc<std::sync::Mutex<Option<HashMap<String, String>>>>,
    }

    /// Canned token endpoint plus the Drive v3 routes the client uses.
    async fn serve_drive() -> (String, Recorded) {
        let recorded = Recorded::default();
        let app = Router::new()
            .route("/token", post(token_endpoint))
            .route("/denied-token", post(denied_token_endpoint))
            .route("/slow-token", post(slow_token_endpoint))
            .route("/drive/v3/files", get(list_endpoint))
            .route("/drive/v3/files/{id}", get(media_endpoint))
            .route("/drive/v3/files/{id}/export", get(export_endpoint))
            .with_state(recorded.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}", addr), recorded)
    }

    async fn token_endpoint(
        State(recorded): State<Recorded>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        recorded.token_requests.fetch_add(1, Ordering::SeqCst);
        let header = form
            .get("assertion")
            .and_then(|assertion| jsonwebtoken::decode_header(assertion).ok());
        let valid = form.get("grant_type").map(String::as_str) == Some(JWT_BEARER_GRANT)
            && header.is_some_and(|h| h.alg == Algorithm::RS256 && h.kid.as_deref() == Some("key-1"));
        if !valid {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_grant", "error_description": "bad assertion"})),
            )
                .into_response();
        }
        Json(json!({"access_token": ACCESS_TOKEN, "expires_in": 3600, "token_type": "Bearer"}))
            .into_response()
    }

    async fn slow_token_endpoint(
        state: State<Recorded>,
        form: Form<HashMap<String, String>>,
    ) -> Response {
        tokio::time::sleep(Duration::from_secs(3)).await;
        token_endpoint(state, form).await
    }

    async fn denied_token_endpoint() -> impl IntoResponse {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant", "error_description": "Invalid JWT Signature."})),
        )
    }

    fn unauthorized(headers: &HeaderMap) -> Option<Response> {
        let expected = format!("Bearer {}", ACCESS_TOKEN);
        let sent = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
        (sent != Some(expected.as_str())).then(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": {"code": 401, "message": "Request had invalid authentication credentials."}})),
            )
                .into_response()
        })
    }

    async fn list_endpoint(
        State(recorded): State<Recorded>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        if let Some(rejection) = unauthorized(&headers) {
            return rejection;
        }
        *recorded.list_query.lock().unwrap() = Some(query);
        Json(json!({
            "files": [
                {"id": "g1", "name": "Budget", "mimeType": GOOGLE_SHEET_MIME,
                 "modifiedTime": "2024-05-01T10:00:00.000Z"},
                {"id": "c1", "name": "people.csv", "mimeType": CSV_MIME},
                {"id": "locked", "name": "secret.csv", "mimeType": CSV_MIME},
            ]
        }))
        .into_response()
    }

    async fn export_endpoint(
        headers: HeaderMap,
        Path(id): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        if let Some(rejection) = unauthorized(&headers) {
            return rejection;
        }
        if id != "g1" || query.get("mimeType").map(String::as_str) != Some(XLSX_MIME) {
            return StatusCode::BAD_REQUEST.into_response();
        }
        let chunks = ["PK\u{3}\u{4}", "first-chunk|", "second-chunk"]
            .map(|part| Ok::<_, Infallible>(Bytes::from_static(part.as_bytes())));
        Response::new(Body::from_stream(futures::stream::iter(chunks)))
    }

    async fn media_endpoint(
        headers: HeaderMap,
        Path(id): Path<String>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        if let Some(rejection) = unauthorized(&headers) {
            return rejection;
        }
        if query.get("alt").map(String::as_str) != Some("media") {
            return StatusCode::BAD_REQUEST.into_response();
        }
        if id == "locked" {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"error": {"code": 403, "message": "The user does not have sufficient permissions for this file."}})),
            )
                .into_response();
        }
        Bytes::from_static(b"a,b\n1,2\n").into_response()
    }

    #[tokio::test]
    async fn lists_and_downloads_over_http() {
        let (base, recorded) = serve_drive().await;
        let drive = GoogleDrive::new(
            reqwest::Client::new(),
            format!("{}/drive/v3/", base),
            format!("{}/token", base),
        );
        let account = signed_account("bot@demo-project.iam.gserviceaccount.com", None);

        let files = drive.list_spreadsheets(&account, 25).await.unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].name, "Budget");
        assert_eq!(files[0].modified_time.as_deref(), Some("2024-05-01T10:00:00.000Z"));
        assert_eq!(files[1].modified_time, None);

        let query = recorded.list_query.lock().unwrap().clone().unwrap();
        assert_eq!(query["q"], spreadsheet_query());
        assert_eq!(query["pageSize"], "25");
        assert_eq!(query["fields"], "files(id,name,mimeType,modifiedTime)");
        assert_eq!(query["supportsAllDrives"], "true");
        assert_eq!(query["includeItemsFromAllDrives"], "true");

        let exported = drive.download(&account, &files[0]).await.unwrap();
        assert_eq!(&exported[..], b"PK\x03\x04first-chunk|second-chunk");

        let media = drive.download(&account, &files[1]).await.unwrap();
        assert_eq!(&media[..], b"a,b\n1,2\n");

        assert_eq!(recorded.token_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_errors_carry_google_messages() {
        let (base, _recorded) = serve_drive().await;
        let drive = GoogleDrive::new(
            reqwest::Client::new(),
            format!("{}/drive/v3", base),
            format!("{}/token", base),
        );
        let account = signed_account("bot@demo-project.iam.gserviceaccount.com", None);
        let locked = FileSummary {
            id: "locked".into(),
            name: "secret.csv".into(),
            mime_type: CSV_MIME.into(),
            modified_time: None,
        };
        match drive.download(&account, &locked).await.unwrap_err() {
            DriveError::Api { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(
                    message,
                    "The user does not have sufficient permissions for this file."
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let denied = signed_account(
            "revoked@demo-project.iam.gserviceaccount.com",
            Some(format!("{}/denied-token", base)),
        );
        let err = drive.list_spreadsheets(&denied, 10).await.unwrap_err();
        assert_eq!(err.to_string(), "Drive API returned 400: Invalid JWT Signature.");
    }

    #[tokio::test]
    async fn slow_token_exchange_does_not_block_other_accounts() {
        let (base, _recorded) = serve_drive().await;
        let drive = Arc::new(GoogleDrive::new(
            reqwest::Client::new(),
            format!("{}/drive/v3", base),
            format!("{}/token", base),
        ));
        let slow = signed_account(
            "slow@demo-project.iam.gserviceaccount.com",
            Some(format!("{}/slow-token", base)),
        );
        let fast = signed_account("fast@demo-project.iam.gserviceaccount.com", None);

        let pending = {
            let drive = drive.clone();
            tokio::spawn(async move { drive.list_spreadsheets(&slow, 10).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let files = tokio::time::timeout(Duration::from_secs(1), drive.list_spreadsheets(&fast, 10))
            .await
            .expect("fast account waited on the slow token exchange")
            .unwrap();
        assert_eq!(files.len(), 3);
        assert!(!pending.is_finished());
        pending.abort();
    }
}
