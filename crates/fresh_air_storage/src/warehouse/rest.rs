//! BigQuery v2 REST client.
//!
//! Uses raw HTTP requests through `reqwest` (no SDK). Loads are multipart
//! NDJSON upload jobs; query and table reads decode the API's `f`/`v` row
//! encoding using the schema returned alongside the rows.

use super::client::{
    JobReference, QueryParameter, TableDefinition, TableRef, WarehouseClient, WriteDisposition,
};
use crate::config::Settings;
use crate::error::{StorageError, StorageResult};
use crate::mapping::TableFieldSchema;
use crate::resource::Record;
use reqwest::blocking::{Client, RequestBuilder, Response};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

const MULTIPART_BOUNDARY: &str = "fresh_air_load_boundary";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_START: Duration = Duration::from_millis(500);
const POLL_MAX: Duration = Duration::from_secs(5);
/// Refresh cached tokens this long before they expire.
const TOKEN_SLACK: Duration = Duration::from_secs(60);
const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Lifetime of a signed assertion, in seconds; the token endpoint caps it at one hour.
const ASSERTION_LIFETIME: i64 = 3600;

/// Where access tokens come from.
pub enum TokenSource {
    /// Fixed OAuth2 access token
    Static(String),
    /// Service-account key, exchanged for tokens with a signed JWT
    ServiceAccount {
        key: ServiceAccountKey,
        cache: Mutex<Option<CachedToken>>,
    },
    /// GCE/GKE metadata server, cached until shortly before expiry
    Metadata {
        endpoint: String,
        cache: Mutex<Option<CachedToken>>,
    },
}

impl TokenSource {
    pub fn metadata(endpoint: impl Into<String>) -> Self {
        TokenSource::Metadata {
            endpoint: endpoint.into(),
            cache: Mutex::new(None),
        }
    }

    /// Token source backed by a service-account JSON key file.
    pub fn service_account(path: &Path) -> StorageResult<Self> {
        Ok(TokenSource::ServiceAccount {
            key: ServiceAccountKey::from_file(path)?,
            cache: Mutex::new(None),
        })
    }
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenSource::Static(_) => f.write_str("TokenSource::Static(..)"),
            TokenSource::ServiceAccount { key, .. } => f
                .debug_struct("TokenSource::ServiceAccount")
                .field("client_email", &key.client_email)
                .finish(),
            TokenSource::Metadata { endpoint, .. } => f
                .debug_struct("TokenSource::Metadata")
                .field("endpoint", endpoint)
                .finish(),
        }
    }
}

pub struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Token endpoint and metadata server response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// The parts of a service-account key file used for the JWT bearer grant.
pub struct ServiceAccountKey {
    client_email: String,
    private_key_id: Option<String>,
    token_uri: String,
    signing_key: EncodingKey,
}

#[derive(Deserialize)]
struct ServiceAccountFile {
    client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl ServiceAccountKey {
    /// Read and validate a key file. The private key is parsed here so a bad
    /// key fails before the first request.
    pub fn from_file(path: &Path) -> StorageResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
        let file: ServiceAccountFile = serde_json::from_str(&content).map_err(|e| {
            StorageError::config(format!(
                "Invalid service-account key file {}: {}",
                path.display(),
                e
            ))
        })?;
        let signing_key = EncodingKey::from_rsa_pem(file.private_key.as_bytes()).map_err(|e| {
            StorageError::config(format!(
                "Invalid private key in {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self {
            client_email: file.client_email,
            private_key_id: file.private_key_id,
            token_uri: file
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            signing_key,
        })
    }

    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }

    /// RS256-signed assertion issued at `issued_at` (epoch seconds).
    fn assertion(&self, issued_at: i64) -> StorageResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: BIGQUERY_SCOPE,
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME,
        };
        jsonwebtoken::encode(&header, &claims, &self.signing_key).map_err(|e| {
            StorageError::config(format!(
                "Failed to sign token request for {}: {}",
                self.client_email, e
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct TableSchemaBody {
    #[serde(default)]
    fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Deserialize)]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchemaBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RowsPage {
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    schema: Option<TableSchemaBody>,
}

/// Blocking BigQuery REST client.
#[derive(Debug)]
pub struct BigQueryRestClient {
    http: Client,
    endpoint: String,
    location: Option<String>,
    token: TokenSource,
}

impl BigQueryRestClient {
    pub fn new(
        endpoint: impl Into<String>,
        location: Option<String>,
        token: TokenSource,
    ) -> StorageResult<Self> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            location,
            token,
        })
    }

    /// Static token when configured, then the service-account key file,
    /// then the metadata server.
    pub fn from_settings(settings: &Settings) -> StorageResult<Self> {
        let token = match (
            &settings.credentials.access_token,
            settings.service_account_key_path(),
        ) {
            (Some(token), _) => TokenSource::Static(token.clone()),
            (None, Some(path)) => TokenSource::service_account(&path)?,
            (None, None) => TokenSource::metadata(settings.credentials.metadata_endpoint.clone()),
        };
        Self::new(
            settings.storage.bigquery.endpoint.clone(),
            settings.storage.bigquery.location.clone(),
            token,
        )
    }

    fn api_url(&self, path: &str) -> StorageResult<Url> {
        let raw = format!("{}/bigquery/v2/{}", self.endpoint, path);
        Url::parse(&raw).map_err(|e| StorageError::config(format!("Invalid API URL {}: {}", raw, e)))
    }

    fn access_token(&self) -> StorageResult<String> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::ServiceAccount { key, cache } => {
                cached_token(cache, || self.exchange_assertion(key))
            }
            TokenSource::Metadata { endpoint, cache } => {
                cached_token(cache, || self.metadata_token(endpoint))
            }
        }
    }

    fn metadata_token(&self, endpoint: &str) -> StorageResult<TokenResponse> {
        debug!("Fetching access token from metadata server");
        let response = self
            .http
            .get(endpoint)
            .header("Metadata-Flavor", "Google")
            .send()?;
        Ok(check(response)?.json()?)
    }

    fn exchange_assertion(&self, key: &ServiceAccountKey) -> StorageResult<TokenResponse> {
        debug!("Requesting access token for {}", key.client_email);
        let assertion = key.assertion(Utc::now().timestamp())?;
        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()?;
        Ok(check(response)?.json()?)
    }

    fn send(&self, request: RequestBuilder) -> StorageResult<Response> {
        let response = request.bearer_auth(self.access_token()?).send()?;
        check(response)
    }

    fn job_reference(&self, project_id: &str) -> JobReference {
        JobReference {
            project_id: project_id.to_string(),
            job_id: format!("fresh_air_{}", Uuid::new_v4().simple()),
            location: self.location.clone(),
        }
    }

    fn job_url(&self, job: &JobReference, prefix: &str) -> StorageResult<Url> {
        let mut url = self.api_url(&format!(
            "projects/{}/{}/{}",
            job.project_id, prefix, job.job_id
        ))?;
        if let Some(location) = &job.location {
            url.query_pairs_mut().append_pair("location", location);
        }
        Ok(url)
    }

    fn job_status(&self, job: &JobReference) -> StorageResult<JobStatus> {
        let url = self.job_url(job, "jobs")?;
        let resource: JobResource = self.send(self.http.get(url))?.json()?;
        resource
            .status
            .ok_or_else(|| StorageError::warehouse(format!("Job {} has no status", job.job_id)))
    }

    /// Follow `pageToken` until the last page.
    fn fetch_pages(&self, base: Url) -> StorageResult<(Vec<Value>, Option<TableSchemaBody>)> {
        let mut rows = Vec::new();
        let mut schema = None;
        let mut page_token: Option<String> = None;
        loop {
            let mut url = base.clone();
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let page: RowsPage = self.send(self.http.get(url))?.json()?;
            rows.extend(page.rows);
            if schema.is_none() {
                schema = page.schema;
            }
            match page.page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok((rows, schema))
    }
}

impl WarehouseClient for BigQueryRestClient {
    fn create_dataset(&self, project_id: &str, dataset_id: &str) -> StorageResult<()> {
        let url = self.api_url(&format!("projects/{}/datasets", project_id))?;
        let mut body = json!({
            "datasetReference": {"projectId": project_id, "datasetId": dataset_id},
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }
        let response = self
            .http
            .post(url)
            .bearer_auth(self.access_token()?)
            .json(&body)
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Dataset {}.{} already exists", project_id, dataset_id);
            return Ok(());
        }
        check(response)?;
        info!("Created dataset {}.{}", project_id, dataset_id);
        Ok(())
    }

    fn create_table(&self, table: &TableRef, definition: &TableDefinition) -> StorageResult<()> {
        let url = self.api_url(&format!(
            "projects/{}/datasets/{}/tables",
            table.project_id, table.dataset_id
        ))?;
        let response = self
            .http
            .post(url)
            .bearer_auth(self.access_token()?)
            .json(&table_body(table, definition))
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Table {} already exists", table);
            return Ok(());
        }
        check(response)?;
        info!("Created table {}", table);
        Ok(())
    }

    fn load_rows(
        &self,
        table: &TableRef,
        definition: &TableDefinition,
        rows: &[Record],
        disposition: WriteDisposition,
    ) -> StorageResult<()> {
        if rows.is_empty() && disposition == WriteDisposition::Append {
            debug!("Nothing to append to {}", table);
            return Ok(());
        }

        let job = self.job_reference(&table.project_id);
        let config = json!({
            "jobReference": job_reference_json(&job),
            "configuration": {"load": load_config(table, definition, disposition)},
        });
        let body = multipart_body(&config, rows)?;

        let mut url = Url::parse(&format!(
            "{}/upload/bigquery/v2/projects/{}/jobs",
            self.endpoint, table.project_id
        ))
        .map_err(|e| StorageError::config(format!("Invalid upload URL: {}", e)))?;
        url.query_pairs_mut().append_pair("uploadType", "multipart");

        let request = self
            .http
            .post(url)
            .header(
                "Content-Type",
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body);
        self.send(request)?;
        debug!("Submitted load job {} for {}", job.job_id, table);

        self.wait_job(&job)?;
        info!(
            "Loaded {} rows into {} ({})",
            rows.len(),
            table,
            disposition.as_str()
        );
        Ok(())
    }

    fn list_rows(&self, table: &TableRef) -> StorageResult<Vec<Record>> {
        let table_path = format!(
            "projects/{}/datasets/{}/tables/{}",
            table.project_id, table.dataset_id, table.table_id
        );
        let resource: TableResource = self
            .send(self.http.get(self.api_url(&table_path)?))?
            .json()?;
        let fields = resource.schema.unwrap_or_default().fields;

        let (rows, _) = self.fetch_pages(self.api_url(&format!("{}/data", table_path))?)?;
        rows.iter().map(|row| decode_row(&fields, row)).collect()
    }

    fn submit_query(
        &self,
        project_id: &str,
        query: &str,
        params: &[QueryParameter],
    ) -> StorageResult<JobReference> {
        let job = self.job_reference(project_id);
        let body = json!({
            "jobReference": job_reference_json(&job),
            "configuration": {"query": query_config(query, params)},
        });
        let url = self.api_url(&format!("projects/{}/jobs", project_id))?;
        self.send(self.http.post(url).json(&body))?;
        debug!("Submitted query job {}", job.job_id);
        Ok(job)
    }

    fn job_done(&self, job: &JobReference) -> StorageResult<bool> {
        Ok(self.job_status(job)?.state == "DONE")
    }

    fn wait_job(&self, job: &JobReference) -> StorageResult<()> {
        let mut delay = POLL_START;
        loop {
            let status = self.job_status(job)?;
            if status.state == "DONE" {
                return match status.error_result {
                    Some(error) => Err(StorageError::warehouse(error.message)),
                    None => Ok(()),
                };
            }
            debug!("Job {} is {}, polling again in {:?}", job.job_id, status.state, delay);
            thread::sleep(delay);
            delay = (delay * 2).min(POLL_MAX);
        }
    }

    fn query_rows(&self, job: &JobReference) -> StorageResult<Vec<Record>> {
        self.wait_job(job)?;
        let (rows, schema) = self.fetch_pages(self.job_url(job, "queries")?)?;
        let fields = schema.unwrap_or_default().fields;
        rows.iter().map(|row| decode_row(&fields, row)).collect()
    }
}

/// Error text for a failed response: the API's own message when present.
/// Cached token, or a fresh one from `fetch` once the cached one is near expiry.
fn cached_token(
    cache: &Mutex<Option<CachedToken>>,
    fetch: impl FnOnce() -> StorageResult<TokenResponse>,
) -> StorageResult<String> {
    let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(cached) = cache.as_ref() {
        if Instant::now() < cached.expires_at {
            return Ok(cached.token.clone());
        }
    }
    let token = fetch()?;
    let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_SLACK);
    *cache = Some(CachedToken {
        token: token.access_token.clone(),
        expires_at: Instant::now() + lifetime,
    });
    Ok(token.access_token)
}

fn check(response: Response) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(StorageError::warehouse(api_error_message(status, &body)))
}

fn api_error_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => format!("HTTP {}: {}", status, body.trim()),
    }
}

fn table_reference_json(table: &TableRef) -> Value {
    json!({
        "projectId": table.project_id,
        "datasetId": table.dataset_id,
        "tableId": table.table_id,
    })
}

fn job_reference_json(job: &JobReference) -> Value {
    let mut value = json!({"projectId": job.project_id, "jobId": job.job_id});
    if let Some(location) = &job.location {
        value["location"] = json!(location);
    }
    value
}

fn add_layout(body: &mut Value, definition: &TableDefinition) {
    if let Some(partitioning) = &definition.partitioning {
        body["timePartitioning"] = json!({
            "type": partitioning.scale.as_str(),
            "field": partitioning.field,
        });
    }
    if !definition.clustering.is_empty() {
        body["clustering"] = json!({"fields": definition.clustering});
    }
}

fn table_body(table: &TableRef, definition: &TableDefinition) -> Value {
    let mut body = json!({
        "tableReference": table_reference_json(table),
        "schema": {"fields": definition.schema},
    });
    add_layout(&mut body, definition);
    body
}

fn load_config(
    table: &TableRef,
    definition: &TableDefinition,
    disposition: WriteDisposition,
) -> Value {
    let mut load = json!({
        "destinationTable": table_reference_json(table),
        "sourceFormat": "NEWLINE_DELIMITED_JSON",
        "createDisposition": "CREATE_IF_NEEDED",
        "writeDisposition": disposition.as_str(),
        "schema": {"fields": definition.schema},
    });
    if disposition == WriteDisposition::Append {
        load["schemaUpdateOptions"] = json!(["ALLOW_FIELD_ADDITION"]);
    }
    add_layout(&mut load, definition);
    load
}

fn query_config(query: &str, params: &[QueryParameter]) -> Value {
    let parameters: Vec<Value> = params
        .iter()
        .map(|p| match &p.array_type {
            Some(element_type) => {
                let values: Vec<Value> = p
                    .array_values()
                    .into_iter()
                    .map(|v| json!({"value": v}))
                    .collect();
                json!({
                    "name": p.name,
                    "parameterType": {"type": "ARRAY", "arrayType": {"type": element_type}},
                    "parameterValue": {"arrayValues": values},
                })
            }
            None => json!({
                "name": p.name,
                "parameterType": {"type": p.param_type},
                "parameterValue": {"value": p.value_string()},
            }),
        })
        .collect();
    json!({
        "query": query,
        "useLegacySql": false,
        "parameterMode": "NAMED",
        "queryParameters": parameters,
    })
}

fn multipart_body(config: &Value, rows: &[Record]) -> StorageResult<Vec<u8>> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            MULTIPART_BOUNDARY
        )
        .as_bytes(),
    );
    serde_json::to_writer(&mut body, config)?;
    body.extend_from_slice(
        format!(
            "\r\n--{}\r\nContent-Type: application/octet-stream\r\n\r\n",
            MULTIPART_BOUNDARY
        )
        .as_bytes(),
    );
    for row in rows {
        serde_json::to_writer(&mut body, row)?;
        body.push(b'\n');
    }
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    Ok(body)
}

/// Decode one `{"f": [{"v": ...}, ...]}` row.
fn decode_row(fields: &[TableFieldSchema], row: &Value) -> StorageResult<Record> {
    let cells = row
        .get("f")
        .and_then(Value::as_array)
        .ok_or_else(|| StorageError::warehouse(format!("Malformed row: {}", row)))?;
    let mut record = Map::with_capacity(fields.len());
    for (field, cell) in fields.iter().zip(cells) {
        let value = cell.get("v").unwrap_or(&Value::Null);
        record.insert(field.name.clone(), decode_cell(field, value)?);
    }
    Ok(record)
}

fn decode_cell(field: &TableFieldSchema, value: &Value) -> StorageResult<Value> {
    if value.is_null() {
        return Ok(if field.is_repeated() {
            Value::Array(Vec::new())
        } else {
            Value::Null
        });
    }
    if field.is_repeated() {
        let items = value
            .as_array()
            .ok_or_else(|| StorageError::warehouse(format!("Malformed repeated cell: {}", value)))?;
        return items
            .iter()
            .map(|item| decode_single(field, item.get("v").unwrap_or(&Value::Null)))
            .collect::<StorageResult<Vec<_>>>()
            .map(Value::Array);
    }
    decode_single(field, value)
}

fn decode_single(field: &TableFieldSchema, value: &Value) -> StorageResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if field.is_record() {
        let children = field.fields.as_deref().unwrap_or_default();
        return decode_row(children, value).map(Value::Object);
    }
    let Some(raw) = value.as_str() else {
        return Ok(value.clone());
    };
    let bad = || {
        StorageError::warehouse(format!(
            "Cannot decode {} value '{}' for field {}",
            field.field_type, raw, field.name
        ))
    };
    match field.field_type.as_str() {
        "INTEGER" | "INT64" => raw.parse::<i64>().map(Value::from).map_err(|_| bad()),
        "FLOAT" | "FLOAT64" | "TIMESTAMP" => raw.parse::<f64>().map(Value::from).map_err(|_| bad()),
        "BOOLEAN" | "BOOL" => match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        _ => Ok(Value::String(raw.to_string())),
    }
}
