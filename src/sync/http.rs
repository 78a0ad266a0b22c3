//! JSON-over-HTTP sync transport.

use super::{PendingChanges, ServerVerdict, SyncAuth, SyncMeta, SyncTransport};
use crate::SyncError;
use log::trace;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Header carrying the session key on every request after login
pub const HOST_KEY_HEADER: &str = "x-sync-key";

#[derive(Serialize)]
struct HostKeyRequest<'a> {
    u: &'a str,
    p: &'a str,
}

#[derive(Deserialize)]
struct HostKeyResponse {
    key: String,
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Builds a client that gives up connecting after `connect_timeout`. Transfers
    /// themselves are never cut short.
    ///
    /// # Errors
    ///
    /// `NetworkError` if the HTTP client cannot be initialised
    pub fn new(connect_timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| SyncError::NetworkError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn url(endpoint: &str, method: &str) -> String {
    format!("{}/sync/{method}", endpoint.trim_end_matches('/'))
}

// The URL may embed credentials and must not reach error messages
fn network_error(e: reqwest::Error) -> SyncError {
    SyncError::NetworkError(e.without_url().to_string())
}

fn check_status(resp: Response) -> Result<Response, SyncError> {
    let status = resp.status();
    trace!("Sync server answered {status} for {}", resp.url().path());
    match status {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::AuthenticationFailed),
        s => {
            let body = resp.text().unwrap_or_default();
            Err(SyncError::Protocol(format!("HTTP {s}: {}", body.trim())))
        }
    }
}

fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, SyncError> {
    resp.json::<T>()
        .map_err(|e| SyncError::Protocol(format!("malformed response: {e}")))
}

impl SyncTransport for HttpTransport {
    fn login(&self, endpoint: &str, username: &str, password: &str) -> Result<SyncAuth, SyncError> {
        let resp = self
            .client
            .post(url(endpoint, "hostKey"))
            .json(&HostKeyRequest {
                u: username,
                p: password,
            })
            .send()
            .map_err(network_error)?;
        let HostKeyResponse { key } = read_json(check_status(resp)?)?;

        Ok(SyncAuth {
            hkey: key,
            endpoint: endpoint.to_string(),
        })
    }

    fn meta(&self, auth: &SyncAuth, local: &SyncMeta) -> Result<ServerVerdict, SyncError> {
        let resp = self
            .client
            .post(url(&auth.endpoint, "meta"))
            .header(HOST_KEY_HEADER, &auth.hkey)
            .json(local)
            .send()
            .map_err(network_error)?;
        read_json(check_status(resp)?)
    }

    fn push_changes(&self, auth: &SyncAuth, changes: &PendingChanges) -> Result<(), SyncError> {
        let resp = self
            .client
            .post(url(&auth.endpoint, "changes"))
            .header(HOST_KEY_HEADER, &auth.hkey)
            .json(changes)
            .send()
            .map_err(network_error)?;
        check_status(resp)?;
        Ok(())
    }

    fn upload(&self, auth: &SyncAuth, collection: Vec<u8>) -> Result<(), SyncError> {
        let resp = self
            .client
            .post(url(&auth.endpoint, "upload"))
            .header(HOST_KEY_HEADER, &auth.hkey)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(collection)
            .send()
            .map_err(network_error)?;
        check_status(resp)?;
        Ok(())
    }

    fn download(&self, auth: &SyncAuth) -> Result<Vec<u8>, SyncError> {
        let resp = self
            .client
            .post(url(&auth.endpoint, "download"))
            .header(HOST_KEY_HEADER, &auth.hkey)
            .send()
            .map_err(network_error)?;
        let bytes = check_status(resp)?.bytes().map_err(network_error)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Grave, GraveKind};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    // Answers a single request with `status_line` and `body`, handing back the request body
    fn serve_once(status_line: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut content_length: usize = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            String::from_utf8(request_body).unwrap()
        });

        (endpoint, handle)
    }

    // Local test servers must not be routed through a proxy from the environment
    fn transport() -> HttpTransport {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        HttpTransport::with_client(client)
    }

    #[test]
    fn url_joins_endpoint_and_method() {
        assert_eq!(url("https://sync.example.com/", "meta"), "https://sync.example.com/sync/meta");
        assert_eq!(url("http://localhost:8080", "hostKey"), "http://localhost:8080/sync/hostKey");
    }

    #[test]
    fn login_returns_host_key() {
        let (endpoint, server) = serve_once("200 OK", r#"{"key":"abc123"}"#);

        let auth = transport().login(&endpoint, "user", "pass").unwrap();
        assert_eq!(auth.hkey, "abc123");
        assert_eq!(auth.endpoint, endpoint);

        let sent: serde_json::Value = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(sent, serde_json::json!({"u": "user", "p": "pass"}));
    }

    #[test]
    fn rejected_login_is_authentication_failure() {
        let (endpoint, server) = serve_once("403 Forbidden", "{}");

        let err = transport().login(&endpoint, "user", "wrong").unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationFailed));
        server.join().unwrap();
    }

    #[test]
    fn meta_parses_verdict() {
        let (endpoint, server) =
            serve_once("200 OK", r#"{"required":2,"server_message":"hi","usn":5}"#);
        let auth = SyncAuth {
            hkey: "k".to_string(),
            endpoint,
        };
        let local = SyncMeta {
            modified: 1,
            schema_modified: 1,
            usn: 0,
            last_sync: 0,
            empty: true,
        };

        let verdict = transport().meta(&auth, &local).unwrap();
        assert_eq!(
            verdict,
            ServerVerdict {
                required: 2,
                server_message: Some("hi".to_string()),
                usn: 5
            }
        );
        let sent: SyncMeta = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(sent, local);
    }

    #[test]
    fn changes_are_posted_as_json() {
        let (endpoint, server) = serve_once("200 OK", "{}");
        let auth = SyncAuth {
            hkey: "k".to_string(),
            endpoint,
        };
        let changes = PendingChanges {
            graves: vec![Grave {
                oid: 77,
                kind: GraveKind::Note,
            }],
            ..PendingChanges::default()
        };

        transport().push_changes(&auth, &changes).unwrap();
        let sent: serde_json::Value = serde_json::from_str(&server.join().unwrap()).unwrap();
        assert_eq!(sent["graves"], serde_json::json!([{"oid": 77, "kind": "note"}]));
        assert_eq!(sent["notes"], serde_json::json!([]));
    }

    #[test]
    fn refused_changes_are_protocol_errors() {
        let (endpoint, server) = serve_once("409 Conflict", "stale usn");
        let auth = SyncAuth {
            hkey: "k".to_string(),
            endpoint,
        };

        let err = transport()
            .push_changes(&auth, &PendingChanges::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(msg) if msg.contains("stale usn")));
        server.join().unwrap();
    }

    #[test]
    fn unreachable_server_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let err = transport().login(&endpoint, "user", "pass").unwrap_err();
        assert!(matches!(&err, SyncError::NetworkError(_)));
        assert!(!err.to_string().contains("127.0.0.1"));
    }
}
