use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use shared::{FaceDetail, MediaKind, VerdictLabel};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::models::VerdictRecord;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid data format: {0}")]
    InvalidData(String),
}

/// Append-only history of verdicts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VerdictStore: Send + Sync {
    /// Stores the record and returns its id.
    async fn insert(&self, record: &VerdictRecord) -> Result<String, RepositoryError>;

    /// Every stored record, oldest first.
    async fn list(&self) -> Result<Vec<VerdictRecord>, RepositoryError>;
}

#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    verdicts_table: String,
}

impl DynamoDbRepository {
    pub fn new(client: Client, verdicts_table: String) -> Self {
        Self {
            client,
            verdicts_table,
        }
    }
}

#[async_trait]
impl VerdictStore for DynamoDbRepository {
    async fn insert(&self, record: &VerdictRecord) -> Result<String, RepositoryError> {
        let item = item_from_record(record)?;

        match self
            .client
            .put_item()
            .table_name(&self.verdicts_table)
            .set_item(Some(item))
            .send()
            .await
        {
            Ok(_) => {
                log::info!(
                    "Stored verdict {} in DynamoDB table '{}'",
                    record.id,
                    self.verdicts_table
                );
                Ok(record.id.to_string())
            }
            Err(e) => {
                log::error!("DynamoDB put_item failed for verdict {}: {:?}", record.id, e);
                Err(RepositoryError::DynamoDb(e.to_string()))
            }
        }
    }

    async fn list(&self) -> Result<Vec<VerdictRecord>, RepositoryError> {
        let mut records = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let result = self
                .client
                .scan()
                .table_name(&self.verdicts_table)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

            if let Some(items) = result.items {
                for item in items {
                    records.push(parse_record_from_item(item)?);
                }
            }

            match result.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

fn item_from_record(
    record: &VerdictRecord,
) -> Result<HashMap<String, AttributeValue>, RepositoryError> {
    let mut item = HashMap::new();
    item.insert("id".to_string(), AttributeValue::S(record.id.to_string()));
    item.insert(
        "user_id".to_string(),
        AttributeValue::S(record.user_id.clone()),
    );
    item.insert(
        "file_name".to_string(),
        AttributeValue::S(record.file_name.clone()),
    );
    item.insert(
        "file_size_mb".to_string(),
        AttributeValue::N(record.file_size_mb.to_string()),
    );
    item.insert(
        "media_kind".to_string(),
        AttributeValue::S(record.media_kind.to_string()),
    );
    if let Some(ipfs_hash) = &record.ipfs_hash {
        item.insert(
            "ipfs_hash".to_string(),
            AttributeValue::S(ipfs_hash.clone()),
        );
    }
    item.insert("sha256".to_string(), AttributeValue::S(record.sha256.clone()));
    item.insert(
        "prediction".to_string(),
        AttributeValue::S(record.prediction.to_string()),
    );
    item.insert(
        "confidence".to_string(),
        AttributeValue::N(record.confidence.to_string()),
    );
    item.insert(
        "total_faces_analyzed".to_string(),
        AttributeValue::N(record.total_faces_analyzed.to_string()),
    );
    item.insert(
        "processing_time".to_string(),
        AttributeValue::N(record.processing_time.to_string()),
    );
    item.insert(
        "details".to_string(),
        AttributeValue::S(serde_json::to_string(&record.details)?),
    );
    item.insert(
        "created_at".to_string(),
        AttributeValue::S(record.created_at.to_rfc3339()),
    );
    Ok(item)
}

fn string_attr<'a>(
    item: &'a HashMap<String, AttributeValue>,
    name: &str,
) -> Result<&'a String, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn number_attr<T: FromStr>(
    item: &HashMap<String, AttributeValue>,
    name: &str,
) -> Result<T, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<T>().ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn parse_record_from_item(
    item: HashMap<String, AttributeValue>,
) -> Result<VerdictRecord, RepositoryError> {
    let id = Uuid::parse_str(string_attr(&item, "id")?)
        .map_err(|_| RepositoryError::InvalidData("Invalid id".to_string()))?;

    let media_kind = MediaKind::from_str(string_attr(&item, "media_kind")?)
        .map_err(|_| RepositoryError::InvalidData("Invalid media_kind".to_string()))?;

    let prediction = VerdictLabel::from_str(string_attr(&item, "prediction")?)
        .map_err(|_| RepositoryError::InvalidData("Invalid prediction".to_string()))?;

    let details: Vec<FaceDetail> = serde_json::from_str(string_attr(&item, "details")?)?;

    let created_at = DateTime::parse_from_rfc3339(string_attr(&item, "created_at")?)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RepositoryError::InvalidData("Invalid created_at".to_string()))?;

    Ok(VerdictRecord {
        id,
        user_id: string_attr(&item, "user_id")?.clone(),
        file_name: string_attr(&item, "file_name")?.clone(),
        file_size_mb: number_attr(&item, "file_size_mb")?,
        media_kind,
        ipfs_hash: item.get("ipfs_hash").and_then(|v| v.as_s().ok()).cloned(),
        sha256: string_attr(&item, "sha256")?.clone(),
        prediction,
        confidence: number_attr(&item, "confidence")?,
        total_faces_analyzed: number_attr(&item, "total_faces_analyzed")?,
        processing_time: number_attr(&item, "processing_time")?,
        details,
        created_at,
    })
}
