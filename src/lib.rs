//! Backend for a single-bucket S3 browser.
//!
//! [`vault`] keeps the one credential record on disk, encrypted with the OS
//! keychain when available. [`catalog`] browses the bucket one folder level
//! at a time. [`session`] ties the two together and [`rpc`] exposes them as
//! method-name requests for the application shell.

pub mod catalog;
pub mod config;
pub mod config_paths;
pub mod credentials;
pub mod error;
pub mod protector;
pub mod rpc;
pub mod session;
pub mod store;
pub mod vault;

use std::io;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub use catalog::{CatalogClient, DeleteReport, ListingResult, UploadReport, UploadRequest};
pub use config::AppConfig;
pub use credentials::{CredentialPatch, CredentialRecord};
pub use error::{CatalogError, Error, Result, ValidationError, VaultError};
pub use protector::{KeyringProtector, SecretProtector, StaticKeyProtector, UnavailableProtector};
pub use session::Session;
pub use store::{MemoryStore, ObjectStore, S3Object, S3Store};
pub use vault::{CredentialVault, StoredCredentials};

const DEFAULT_LOG_FILTER: &str = "bucketlens_lib=info,bucketlens=info";

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    payload: Value,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // Logs go to stderr; stdout carries responses.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

async fn handle_line(session: &Session, line: &str) -> Value {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return json!({
                "id": Value::Null,
                "ok": false,
                "error": { "code": rpc::ErrorCode::BadRequest, "message": format!("Invalid request: {err}") },
            })
        }
    };

    debug!(method = %request.method, "Handling request");
    match rpc::dispatch(session, &request.method, request.payload).await {
        Ok(result) => json!({ "id": request.id, "ok": true, "result": result }),
        Err(err) => {
            if err.code != rpc::ErrorCode::NotInitialized {
                warn!(method = %request.method, "Request failed: {err}");
            }
            json!({ "id": request.id, "ok": false, "error": err })
        }
    }
}

/// Serve line-delimited JSON requests from `reader`, writing one response
/// line per request to `writer`. Requests run concurrently, so responses may
/// arrive out of order and are matched by `id`. Returns once `reader` is
/// exhausted and every response has been written.
pub async fn serve<R, W>(session: Arc<Session>, reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = rx.recv().await {
            let mut line = response.to_string();
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, io::Error>(())
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let session = session.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle_line(&session, &line).await;
            let _ = tx.send(response);
        });
    }
    drop(tx);

    writer_task.await.map_err(io::Error::other)?
}

/// Run the backend over stdin/stdout with the OS keychain and real S3.
pub async fn run() -> io::Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    let vault = CredentialVault::open_default(Arc::new(KeyringProtector::default()))
        .map_err(io::Error::other)?;
    info!(path = %vault.path().display(), "Using credentials file");

    let session = Arc::new(Session::new(vault, config));
    match session.init().await {
        Ok(true) => info!("Connected with stored credentials"),
        Ok(false) => info!("No stored credentials"),
        Err(err) => warn!("Stored credentials are unusable: {err}"),
    }

    serve(session, tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::memory_session;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_serve_answers_every_request() {
        let temp = TempDir::new().unwrap();
        let (session, _) = memory_session(&temp);
        let input = "{\"id\":1,\"method\":\"credentials:has\"}\n\
                     not json\n\
                     \n\
                     {\"id\":2,\"method\":\"objects:list\",\"payload\":{\"prefix\":\"\"}}\n\
                     {\"id\":3,\"method\":\"objects:teleport\"}\n";
        let (client, server) = tokio::io::duplex(64 * 1024);

        serve(Arc::new(session), input.as_bytes(), server).await.unwrap();

        let mut output = String::new();
        let mut client = client;
        client.read_to_string(&mut output).await.unwrap();
        let responses: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 4);

        let by_id: HashMap<String, &Value> = responses
            .iter()
            .map(|response| (response["id"].to_string(), response))
            .collect();
        assert_eq!(by_id["1"]["result"], json!(false));
        assert_eq!(by_id["null"]["error"]["code"], "BAD_REQUEST");
        assert_eq!(by_id["2"]["error"]["code"], "NOT_INITIALIZED");
        assert_eq!(by_id["3"]["error"]["code"], "UNKNOWN_METHOD");
    }
}
