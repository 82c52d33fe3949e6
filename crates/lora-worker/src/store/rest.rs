//! PostgREST-backed job table.

use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use super::error::{Result, StoreError};
use super::{CandidateQuery, Expectation, JobTable, Order, Row};
use crate::job::JobId;
use crate::sanitize::truncate_message;

/// Longest response body carried in an error.
const MAX_ERROR_BODY_LENGTH: usize = 300;

static RE_SCHEMA_CACHE_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']+)' column").unwrap());
static RE_PG_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"column "([^"]+)""#).unwrap());

pub struct PostgrestTable {
    client: Client,
    endpoint: String,
    root: String,
    table: String,
    key: SecretString,
}

impl PostgrestTable {
    /// `base_url` is the project URL; requests go to `<base_url>/rest/v1/<table>`.
    pub fn new(base_url: &str, table: &str, key: SecretString, timeout: Duration) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(StoreError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        let root = format!("{}/rest/v1", base);
        Ok(Self {
            client,
            endpoint: format!("{}/{}", root, table),
            root,
            table: table.to_string(),
            key,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let key = self.key.expose_secret();
        request
            .header("apikey", key)
            .header("Authorization", format!("Bearer {}", key))
    }

    async fn rows_from(&self, response: reqwest::Response) -> Result<Vec<Row>> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        let value: Value =
            serde_json::from_str(&body).map_err(|e| StoreError::Decode(e.to_string()))?;
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            other => Err(StoreError::Decode(format!(
                "expected a JSON array, got {}",
                truncate_message(&other.to_string(), MAX_ERROR_BODY_LENGTH)
            ))),
        }
    }

    async fn columns_from_openapi(&self) -> Result<Option<BTreeSet<String>>> {
        let response = self
            .authorized(self.client.get(format!("{}/", self.root)))
            .header("Accept", "application/openapi+json")
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let spec: Value = match response.json().await {
            Ok(spec) => spec,
            Err(_) => return Ok(None),
        };
        let properties = spec
            .get("definitions")
            .and_then(|d| d.get(&self.table))
            .and_then(|t| t.get("properties"))
            .and_then(Value::as_object);
        Ok(properties.map(|p| p.keys().cloned().collect()))
    }

    async fn columns_from_sample(&self) -> Result<Option<BTreeSet<String>>> {
        let response = self
            .authorized(self.client.get(&self.endpoint))
            .query(&[("select", "*"), ("limit", "1")])
            .send()
            .await?;
        let rows = self.rows_from(response).await?;
        Ok(rows.first().map(|row| row.keys().cloned().collect()))
    }
}

#[async_trait]
impl JobTable for PostgrestTable {
    async fn select(&self, query: &CandidateQuery) -> Result<Vec<Row>> {
        let params = select_params(query);
        debug!(table = %self.table, ?params, "Selecting job rows");
        let response = self
            .authorized(self.client.get(&self.endpoint))
            .query(&params)
            .send()
            .await?;
        self.rows_from(response).await
    }

    async fn update(&self, id: &JobId, expect: &Expectation, fields: &Row) -> Result<u64> {
        let params = update_params(id, expect);
        let response = self
            .authorized(self.client.patch(&self.endpoint))
            .query(&params)
            .header("Prefer", "return=representation")
            .json(fields)
            .send()
            .await?;
        let rows = self.rows_from(response).await?;
        Ok(rows.len() as u64)
    }

    async fn columns(&self) -> Result<Option<BTreeSet<String>>> {
        if let Some(columns) = self.columns_from_openapi().await? {
            return Ok(Some(columns));
        }
        self.columns_from_sample().await
    }
}

fn timestamp_filter(cutoff: DateTime<Utc>) -> String {
    format!("lt.{}", cutoff.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn select_params(query: &CandidateQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("select", "*".to_string())];
    if let Some(id) = &query.id {
        params.push(("id", format!("eq.{}", id.stored())));
    }
    match query.statuses.as_slice() {
        [] => {}
        [single] => params.push(("status", format!("eq.{}", single))),
        many => {
            let list: Vec<&str> = many.iter().map(|s| s.as_str()).collect();
            params.push(("status", format!("in.({})", list.join(","))));
        }
    }
    if let Some(cutoff) = query.updated_before {
        params.push(("updated_at", timestamp_filter(cutoff)));
    }
    let order = match query.order {
        Order::OldestFirst => "created_at.asc",
        Order::NewestFirst => "created_at.desc",
    };
    params.push(("order", order.to_string()));
    if let Some(limit) = query.limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

fn update_params(id: &JobId, expect: &Expectation) -> Vec<(&'static str, String)> {
    let mut params = vec![("id", format!("eq.{}", id.stored()))];
    if let Some(status) = expect.status {
        params.push(("status", format!("eq.{}", status)));
    }
    if let Some(cutoff) = expect.updated_before {
        params.push(("updated_at", timestamp_filter(cutoff)));
    }
    params
}

/// Maps a non-success response to a [`StoreError`], singling out unknown columns.
fn classify_error(status: StatusCode, body: &str) -> StoreError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(body);

    let column = match code {
        "PGRST204" => RE_SCHEMA_CACHE_COLUMN.captures(message),
        "42703" => RE_PG_COLUMN.captures(message),
        _ => None,
    }
    .and_then(|caps| caps.get(1))
    .map(|m| m.as_str().to_string());

    match column {
        Some(column) => StoreError::UnknownColumn {
            column,
            message: message.to_string(),
        },
        None => StoreError::Rejected {
            status: status.as_u16(),
            body: truncate_message(body, MAX_ERROR_BODY_LENGTH),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use mockito::Matcher;
    use serde_json::json;

    fn table(server: &mockito::Server) -> PostgrestTable {
        PostgrestTable::new(
            &server.url(),
            "user_loras",
            SecretString::from("service-key"),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_classify_schema_cache_error() {
        let body = r#"{"code":"PGRST204","message":"Could not find the 'repeat' column of 'user_loras' in the schema cache"}"#;
        match classify_error(StatusCode::BAD_REQUEST, body) {
            StoreError::UnknownColumn { column, .. } => assert_eq!(column, "repeat"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_postgres_error() {
        let body = r#"{"code":"42703","message":"column \"image_count\" of relation \"user_loras\" does not exist"}"#;
        match classify_error(StatusCode::BAD_REQUEST, body) {
            StoreError::UnknownColumn { column, .. } => assert_eq!(column, "image_count"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_classify_other_client_errors() {
        let body = r#"{"code":"23505","message":"duplicate key value"}"#;
        assert!(matches!(
            classify_error(StatusCode::CONFLICT, body),
            StoreError::Rejected { status: 409, .. }
        ));
        assert!(matches!(
            classify_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>"),
            StoreError::Rejected { status: 502, .. }
        ));
    }

    #[test]
    fn test_id_filters_use_stored_spelling() {
        let id = JobId::parse("0F8FAD5B-D9CB-469F-A165-70867728950E").unwrap();
        let expected = ("id", "eq.0F8FAD5B-D9CB-469F-A165-70867728950E".to_string());

        let update = update_params(&id, &Expectation::status(JobStatus::Queued));
        assert_eq!(update[0], expected);
        assert!(select_params(&CandidateQuery::by_id(&id)).contains(&expected));
    }

    #[test]
    fn test_rejects_non_http_url() {
        let err = PostgrestTable::new(
            "ftp://example.com",
            "user_loras",
            SecretString::from("k"),
            Duration::from_secs(1),
        );
        assert!(matches!(err, Err(StoreError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_select_sends_filters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/user_loras")
            .match_header("apikey", "service-key")
            .match_header("authorization", "Bearer service-key")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("status".into(), "eq.queued".into()),
                Matcher::UrlEncoded("order".into(), "created_at.asc".into()),
                Matcher::UrlEncoded("limit".into(), "10".into()),
            ]))
            .with_status(200)
            .with_body(json!([{"id": "a", "status": "queued"}]).to_string())
            .create_async()
            .await;

        let rows = table(&server)
            .select(&CandidateQuery::with_status(JobStatus::Queued).limit(10))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_select_multiple_statuses_uses_in_filter() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rest/v1/user_loras")
            .match_query(Matcher::UrlEncoded(
                "status".into(),
                "in.(queued,training)".into(),
            ))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let query = CandidateQuery {
            statuses: vec![JobStatus::Queued, JobStatus::Training],
            ..Default::default()
        };
        assert!(table(&server).select(&query).await.unwrap().is_empty());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_conditional_update_counts_returned_rows() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/rest/v1/user_loras")
            .match_header("prefer", "return=representation")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("id".into(), "eq.job1".into()),
                Matcher::UrlEncoded("status".into(), "eq.queued".into()),
            ]))
            .match_body(Matcher::PartialJson(json!({"status": "training"})))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let mut fields = Row::new();
        fields.insert("status".into(), json!("training"));
        let applied = table(&server)
            .update(
                &JobId::parse("job1").unwrap(),
                &Expectation::status(JobStatus::Queued),
                &fields,
            )
            .await
            .unwrap();
        assert_eq!(applied, 0, "lost race reports zero rows");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_update_surfaces_unknown_column() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PATCH", "/rest/v1/user_loras")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(
                json!({
                    "code": "PGRST204",
                    "message": "Could not find the 'repeat' column of 'user_loras' in the schema cache"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut fields = Row::new();
        fields.insert("repeat".into(), json!(60));
        let err = table(&server)
            .update(
                &JobId::parse("job1").unwrap(),
                &Expectation::status(JobStatus::Training),
                &fields,
            )
            .await
            .unwrap_err();
        assert!(err.is_unknown_column());
    }

    #[tokio::test]
    async fn test_columns_fall_back_to_sample_row() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/rest/v1/")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/rest/v1/user_loras")
            .match_query(Matcher::UrlEncoded("limit".into(), "1".into()))
            .with_status(200)
            .with_body(json!([{"id": "a", "status": "queued", "progress": 0}]).to_string())
            .create_async()
            .await;

        let columns = table(&server).columns().await.unwrap().unwrap();
        assert!(columns.contains("progress"));
        assert!(!columns.contains("repeat"));
    }

    #[tokio::test]
    async fn test_columns_from_openapi_definitions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/rest/v1/")
            .with_status(200)
            .with_body(
                json!({
                    "definitions": {
                        "user_loras": {"properties": {"id": {}, "status": {}, "image_count": {}}}
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let columns = table(&server).columns().await.unwrap().unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns.contains("image_count"));
    }
}
