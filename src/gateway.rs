use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::categories::CategoryRegistry;
use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::records::{ImageRecord, Records, SessionRecord, SessionStatus};
use crate::storage;
use crate::utils;

/// The image types the inference service accepts.
pub const ALLOWED_MIME: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/heic"];

#[derive(Debug, Default, Clone)]
pub struct UploadRequest {
    pub api_key: Option<String>,
    pub image_base64: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub session_id: String,
    pub blob_id: String,
    pub domain: String,
    pub category: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Accepts uploads and parks them in the store until they are analysed.
pub struct UploadGateway {
    cfg: Arc<RuntimeConfig>,
    records: Records,
}

impl UploadGateway {
    pub fn new(cfg: Arc<RuntimeConfig>, records: Records) -> Self {
        Self { cfg, records }
    }

    /// Validates the upload and writes the image and session records.
    ///
    /// Nothing is written unless every check passes.
    pub async fn upload(&self, req: UploadRequest) -> Result<UploadReceipt, PipelineError> {
        let registry = CategoryRegistry::load(&self.cfg.categories);
        let category = req
            .api_key
            .as_deref()
            .and_then(|key| registry.by_key(key))
            .ok_or(PipelineError::Unauthorized)?;

        let (image_base64, mime_type) = match (req.image_base64, req.mime_type) {
            (Some(image), Some(mime)) if !image.is_empty() && !mime.is_empty() => (image, mime),
            _ => return Err(PipelineError::invalid("image_base64 and mime_type are required")),
        };

        let mime_type = normalise_mime(&mime_type).ok_or_else(|| {
            PipelineError::invalid("Unsupported image type. Use JPG, PNG, WebP or HEIC.")
        })?;

        if image_base64.len() > self.cfg.max_encoded_size {
            return Err(PipelineError::invalid("Image too large. Max ~10MB."));
        }

        if base64::decode(&image_base64).is_err() {
            return Err(PipelineError::invalid("image_base64 is not valid base64"));
        }

        let session_id = utils::new_identifier();
        let blob_id = utils::new_identifier();
        let uploaded_at = Utc::now();
        let expires_at = uploaded_at + self.cfg.session_ttl();

        let image = ImageRecord {
            image_base64,
            mime_type,
            uploaded_at,
            expires_at,
            domain: category.domain.clone(),
            category: category.name.clone(),
        };
        self.records.put_image(&blob_id, &image).await?;

        let session = SessionRecord {
            blob_id: blob_id.clone(),
            domain: category.domain.clone(),
            category: category.name.clone(),
            uploaded_at,
            expires_at,
            status: SessionStatus::Uploaded,
            updated_at: None,
        };
        if let Err(e) = self.records.put_session(&session_id, &session).await {
            if let Err(cleanup) = self.records.delete(&storage::image_key(&blob_id)).await {
                warn!(blob_id = %blob_id, error = %cleanup, "Failed to remove orphaned image");
            }
            return Err(e);
        }

        info!(
            session_id = %session_id,
            blob_id = %blob_id,
            category = %category.name,
            encoded_size = image.image_base64.len(),
            "Upload stored"
        );

        Ok(UploadReceipt {
            session_id,
            blob_id,
            domain: category.domain.clone(),
            category: category.name.clone(),
            uploaded_at,
            expires_at,
        })
    }
}

/// Returns the canonical MIME essence if it is one we accept.
fn normalise_mime(mime_type: &str) -> Option<String> {
    let parsed: mime::Mime = mime_type.trim().parse().ok()?;
    let essence = parsed.essence_str().to_ascii_lowercase();

    if ALLOWED_MIME.contains(&essence.as_str()) {
        Some(essence)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backends::memory::MemoryBackend;
    use crate::storage::KeyValueStore;

    const CONFIG: &str = include_str!("../tests/configs/memory.yaml");

    fn gateway() -> (UploadGateway, Arc<dyn KeyValueStore>) {
        let cfg = Arc::new(RuntimeConfig::from_yaml(CONFIG).unwrap());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryBackend::default());
        (UploadGateway::new(cfg, Records::new(store.clone())), store)
    }

    fn request(mime: &str, image: &str) -> UploadRequest {
        UploadRequest {
            api_key: Some("vehicle-test-key".to_string()),
            image_base64: Some(image.to_string()),
            mime_type: Some(mime.to_string()),
        }
    }

    #[tokio::test]
    async fn test_expiry_is_exactly_one_ttl_after_upload() -> anyhow::Result<()> {
        let (gateway, store) = gateway();

        let receipt = gateway.upload(request("image/jpeg", "AAAA")).await?;
        assert_eq!(receipt.expires_at - receipt.uploaded_at, chrono::Duration::minutes(15));
        assert_eq!(receipt.category, "vehicle");
        assert_eq!(receipt.domain, "vehiclevibe.app");
        assert_ne!(receipt.session_id, receipt.blob_id);

        let mut keys = store.list().await?;
        keys.sort();
        assert_eq!(
            keys,
            vec![storage::image_key(&receipt.blob_id), storage::session_key(&receipt.session_id)],
        );

        let meta = store.get_metadata(&storage::image_key(&receipt.blob_id)).await?.unwrap();
        assert_eq!(meta.get("mime_type").map(String::as_str), Some("image/jpeg"));

        Ok(())
    }

    #[tokio::test]
    async fn test_rejections_write_nothing() -> anyhow::Result<()> {
        let (gateway, store) = gateway();

        for mime in ["image/gif", "image/svg+xml", "text/plain", "not a mime"] {
            let err = gateway.upload(request(mime, "AAAA")).await.unwrap_err();
            assert!(matches!(err, PipelineError::InvalidRequest(_)), "{} was accepted", mime);
        }

        let err = gateway.upload(request("image/png", "!!!not-base64!!!")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));

        let err = gateway
            .upload(UploadRequest { api_key: Some("vehicle-test-key".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));

        assert!(store.list().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected_before_writing() -> anyhow::Result<()> {
        let (gateway, store) = gateway();

        let oversized = "A".repeat(13_600_004);
        let err = gateway.upload(request("image/png", &oversized)).await.unwrap_err();
        assert_eq!(err.to_string(), "Image too large. Max ~10MB.");
        assert!(store.list().await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_key_is_unauthorized_before_payload_checks() {
        let (gateway, _) = gateway();

        let err = gateway
            .upload(UploadRequest { api_key: Some("nope".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Unauthorized));

        let err = gateway.upload(UploadRequest::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Unauthorized));
    }

    #[test]
    fn test_mime_normalisation() {
        assert_eq!(normalise_mime("IMAGE/JPEG").as_deref(), Some("image/jpeg"));
        assert_eq!(normalise_mime("image/png; charset=binary").as_deref(), Some("image/png"));
        assert_eq!(normalise_mime("image/heic").as_deref(), Some("image/heic"));
        assert!(normalise_mime("image/gif").is_none());
    }
}
