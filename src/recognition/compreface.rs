//! CompreFace recognition service client.
//!
//! Images go up as base64 JSON bodies; the API key travels in the
//! `x-api-key` header. Besides recognition, the client carries the handful of
//! admin calls the enrollment tool needs.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{RecognitionClient, ServiceSettings};
use crate::detection::{Detection, RecognizeResponse};
use crate::error::RecognitionError;

const RECOGNIZE_PATH: &str = "/api/v1/recognition/recognize";
const SUBJECTS_PATH: &str = "/api/v1/recognition/subjects";
const FACES_PATH: &str = "/api/v1/recognition/faces";
/// Service error code for "no face is found in the given image".
const NO_FACE_FOUND: u32 = 28;
const FACE_PAGE_SIZE: u32 = 1000;

pub struct CompreFaceClient {
    settings: ServiceSettings,
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SubjectList {
    #[serde(default)]
    subjects: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AddedFace {
    image_id: Option<String>,
}

/// One page of the saved-face listing.
#[derive(Debug, Deserialize)]
pub struct FacePage {
    #[serde(default)]
    pub faces: Vec<SavedFace>,
    pub page_number: u32,
    pub total_pages: u32,
}

#[derive(Debug, Deserialize)]
pub struct SavedFace {
    pub image_id: String,
    pub subject: String,
}

impl CompreFaceClient {
    pub fn new(settings: ServiceSettings) -> Result<Self> {
        let base_url = settings.base_url();
        Url::parse(&base_url).with_context(|| format!("invalid service url {}", base_url))?;
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Ok(Self {
            settings,
            base_url,
            agent,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Names of every subject registered with the service.
    pub fn list_subjects(&self) -> Result<BTreeSet<String>> {
        let list: SubjectList = self
            .agent
            .get(&self.url(SUBJECTS_PATH))
            .set("x-api-key", &self.settings.api_key)
            .call()
            .context("list subjects")?
            .into_json()
            .context("decode subject list")?;
        Ok(list.subjects.into_iter().collect())
    }

    pub fn add_subject(&self, name: &str) -> Result<()> {
        self.agent
            .post(&self.url(SUBJECTS_PATH))
            .set("x-api-key", &self.settings.api_key)
            .send_json(json!({ "subject": name }))
            .with_context(|| format!("add subject '{}'", name))?;
        Ok(())
    }

    pub fn list_faces_page(&self, page: u32) -> Result<FacePage> {
        self.agent
            .get(&self.url(FACES_PATH))
            .query("size", &FACE_PAGE_SIZE.to_string())
            .query("page", &page.to_string())
            .set("x-api-key", &self.settings.api_key)
            .call()
            .with_context(|| format!("list saved faces page {}", page))?
            .into_json()
            .context("decode saved face page")
    }

    /// Subjects that already own at least one saved face, across all pages.
    pub fn subjects_with_faces(&self) -> Result<BTreeSet<String>> {
        let mut subjects = BTreeSet::new();
        let mut page = 0;
        loop {
            let listing = self.list_faces_page(page)?;
            subjects.extend(listing.faces.into_iter().map(|face| face.subject));
            if listing.page_number + 1 >= listing.total_pages {
                break;
            }
            page = listing.page_number + 1;
        }
        Ok(subjects)
    }

    /// Upload one example image for `subject`. Returns the stored image id.
    pub fn add_face(&self, subject: &str, image: &[u8]) -> Result<String> {
        let added: AddedFace = self
            .agent
            .post(&self.url(FACES_PATH))
            .query("subject", subject)
            .query(
                "det_prob_threshold",
                &self.settings.det_prob_threshold.to_string(),
            )
            .set("x-api-key", &self.settings.api_key)
            .send_json(json!({ "file": STANDARD.encode(image) }))
            .with_context(|| format!("add face for '{}'", subject))?
            .into_json()
            .context("decode add-face response")?;
        added
            .image_id
            .ok_or_else(|| anyhow!("service stored no image for '{}'", subject))
    }
}

impl RecognitionClient for CompreFaceClient {
    fn name(&self) -> &'static str {
        "compreface"
    }

    fn recognize(&mut self, image: &[u8]) -> Result<Vec<Detection>, RecognitionError> {
        let response = self
            .agent
            .post(&self.url(RECOGNIZE_PATH))
            .query("limit", "0")
            .query(
                "det_prob_threshold",
                &self.settings.det_prob_threshold.to_string(),
            )
            .query("prediction_count", "1")
            .query("face_plugins", "age,gender")
            .set("x-api-key", &self.settings.api_key)
            .send_json(json!({ "file": STANDARD.encode(image) }));

        match response {
            Ok(response) => {
                let body: RecognizeResponse = response
                    .into_json()
                    .map_err(|e| RecognitionError::decode(e.to_string()))?;
                Ok(body.into_detections())
            }
            Err(ureq::Error::Status(status, response)) => {
                let raw = response.into_string().unwrap_or_default();
                let body: Option<ServiceErrorBody> = serde_json::from_str(&raw).ok();
                if body.as_ref().and_then(|b| b.code) == Some(NO_FACE_FOUND) {
                    return Ok(Vec::new());
                }
                let message = body.and_then(|b| b.message).unwrap_or(raw);
                Err(RecognitionError::Service { status, message })
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(RecognitionError::transport(transport.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// Serve exactly one canned HTTP response and hand back the request line
    /// and headers that were received.
    fn serve_once(status: &str, body: &str) -> (u16, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                head.push_str(&line);
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            head
        });
        (port, handle)
    }

    fn client(port: u16) -> CompreFaceClient {
        CompreFaceClient::new(ServiceSettings {
            port,
            api_key: "test-key".into(),
            ..ServiceSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn recognize_parses_faces_and_sends_key() {
        let (port, server) = serve_once(
            "200 OK",
            r#"{"result":[{"box":{"x_min":1,"y_min":2,"x_max":30,"y_max":40},
                "subjects":[{"subject":"Doe, Jane (1) [2]","similarity":0.9}]}]}"#,
        );
        let detections = client(port).recognize(b"jpeg").unwrap();
        let head = server.join().unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].subject(), Some("Doe, Jane (1) [2]"));
        assert!(head.starts_with("POST /api/v1/recognition/recognize?"));
        assert!(head.contains("face_plugins=age%2Cgender") || head.contains("face_plugins=age,gender"));
        assert!(head.to_ascii_lowercase().contains("x-api-key: test-key"));
    }

    #[test]
    fn no_face_found_is_an_empty_result() {
        let (port, server) = serve_once(
            "400 Bad Request",
            r#"{"message":"No face is found in the given image","code":28}"#,
        );
        let detections = client(port).recognize(b"jpeg").unwrap();
        server.join().unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn other_status_is_a_service_error() {
        let (port, server) = serve_once(
            "401 Unauthorized",
            r#"{"message":"Missing API key","code":1}"#,
        );
        let err = client(port).recognize(b"jpeg").unwrap_err();
        server.join().unwrap();
        match err {
            RecognitionError::Service { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Missing API key");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = client(port).recognize(b"jpeg").unwrap_err();
        assert!(err.is_transport(), "{err}");
    }
}
