use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

pub const DEFAULT_PINATA_API_URL: &str = "https://api.pinata.cloud/pinning/pinFileToIPFS";

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Pinata request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Pinata rejected the upload ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Pinata response had no IpfsHash")]
    MissingHash,
}

/// Pins uploaded content to remote content-addressed storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentUploader: Send + Sync {
    /// Returns the content identifier assigned by the remote store.
    async fn upload(&self, file_name: &str, content: Vec<u8>) -> Result<String, UploadError>;
}

#[derive(Deserialize)]
struct PinResponse {
    #[serde(rename = "IpfsHash")]
    ipfs_hash: Option<String>,
}

#[derive(Clone)]
pub struct PinataService {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    secret_api_key: String,
}

impl PinataService {
    pub fn new(api_url: String, api_key: String, secret_api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            secret_api_key,
        }
    }
}

#[async_trait]
impl ContentUploader for PinataService {
    async fn upload(&self, file_name: &str, content: Vec<u8>) -> Result<String, UploadError> {
        let size = content.len();
        let part = Part::bytes(content).file_name(file_name.to_string());
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(&self.api_url)
            .header("pinata_api_key", &self.api_key)
            .header("pinata_secret_api_key", &self.secret_api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Pinata upload of {} failed with {}: {}", file_name, status, body);
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let pinned: PinResponse = response.json().await?;
        let hash = pinned.ipfs_hash.ok_or(UploadError::MissingHash)?;
        log::info!("Pinned {} ({} bytes) as {}", file_name, size, hash);
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service_for(server: &MockServer) -> PinataService {
        PinataService::new(
            format!("{}/pinning/pinFileToIPFS", server.uri()),
            "key".to_string(),
            "secret".to_string(),
        )
    }

    #[actix_web::test]
    async fn returns_the_ipfs_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pinning/pinFileToIPFS"))
            .and(header("pinata_api_key", "key"))
            .and(header("pinata_secret_api_key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "IpfsHash": "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG",
                "PinSize": 3,
                "Timestamp": "2024-01-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hash = service_for(&server)
            .upload("face.png", b"png".to_vec())
            .await
            .unwrap();
        assert_eq!(hash, "QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG");
    }

    #[actix_web::test]
    async fn non_success_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid keys"))
            .mount(&server)
            .await;

        match service_for(&server).upload("a.mp4", vec![0; 16]).await {
            Err(UploadError::Rejected { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "invalid keys");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[actix_web::test]
    async fn missing_hash_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"PinSize": 3})))
            .mount(&server)
            .await;

        assert!(matches!(
            service_for(&server).upload("a.png", vec![1, 2, 3]).await,
            Err(UploadError::MissingHash)
        ));
    }
}
