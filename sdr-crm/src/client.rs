use crate::error::{CrmError, Result};
use crate::types::{CrmOperation, LeadId};
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;

const LEAD_TAG: &str = "SDR_IA";
const ERROR_BODY_LIMIT: usize = 512;

/// One async method per operation kind. Implementations classify failures
/// through `CrmError` so the queue can decide between retry and give-up.
#[async_trait]
pub trait CrmApi: Send + Sync {
    async fn create_lead(&self, name: &str, phone: &str, fields: &Value) -> Result<Value>;

    async fn update_lead(&self, lead_id: LeadId, fields: &Value) -> Result<Value>;

    async fn update_stage(&self, lead_id: LeadId, stage: &str) -> Result<Value>;

    /// Returns the first matching lead, or `Value::Null` when none exists.
    async fn fetch_by_phone(&self, phone: &str) -> Result<Value>;

    async fn fetch_by_id(&self, lead_id: LeadId) -> Result<Value>;

    async fn add_note(&self, lead_id: LeadId, text: &str) -> Result<Value>;

    async fn upsert(&self, phone: &str, name: Option<&str>, fields: &Value) -> Result<Value> {
        let existing = self.fetch_by_phone(phone).await?;
        if let Some(lead_id) = existing.get("id").and_then(Value::as_u64) {
            let mut update = match fields {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            if let Some(name) = name {
                update.insert("name".to_string(), Value::String(name.to_string()));
            }
            if update.is_empty() {
                return Ok(existing);
            }
            return self.update_lead(lead_id, &Value::Object(update)).await;
        }
        self.create_lead(name.unwrap_or(phone), phone, fields).await
    }
}

/// Routes a typed operation to the matching `CrmApi` method.
pub async fn dispatch(api: &dyn CrmApi, operation: &CrmOperation) -> Result<Value> {
    match operation {
        CrmOperation::CreateLead { name, phone, fields } => {
            api.create_lead(name, phone, fields).await
        }
        CrmOperation::UpdateLead { lead_id, fields } => api.update_lead(*lead_id, fields).await,
        CrmOperation::UpdateStage { lead_id, stage } => api.update_stage(*lead_id, stage).await,
        CrmOperation::FetchByPhone { phone } => api.fetch_by_phone(phone).await,
        CrmOperation::FetchById { lead_id } => api.fetch_by_id(*lead_id).await,
        CrmOperation::AddNote { lead_id, text } => api.add_note(*lead_id, text).await,
        CrmOperation::Upsert {
            phone,
            name,
            fields,
        } => api.upsert(phone, name.as_deref(), fields).await,
    }
}

#[derive(Debug, Clone, Default)]
pub struct KommoSettings {
    pub base_url: String,
    pub access_token: String,
    pub pipeline_id: Option<u64>,
    /// Normalized stage name -> Kommo status id.
    pub stage_ids: HashMap<String, u64>,
    pub phone_field_id: Option<u64>,
    pub request_timeout: Option<Duration>,
}

#[derive(Clone)]
pub struct KommoClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    pipeline_id: Option<u64>,
    stage_ids: HashMap<String, u64>,
    phone_field_id: Option<u64>,
}

impl KommoClient {
    pub fn new(settings: KommoSettings) -> Result<Self> {
        let base_url = settings.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CrmError::Permanent("kommo base_url is required".to_string()));
        }
        let access_token = settings.access_token.trim().to_string();
        if access_token.is_empty() {
            return Err(CrmError::Permanent(
                "kommo access token is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout.unwrap_or(Duration::from_secs(30)))
            .build()?;
        let stage_ids = settings
            .stage_ids
            .into_iter()
            .map(|(name, id)| (normalize_stage_name(&name), id))
            .collect();
        Ok(Self {
            http,
            base_url,
            access_token,
            pipeline_id: settings.pipeline_id,
            stage_ids,
            phone_field_id: settings.phone_field_id,
        })
    }

    fn resolve_stage(&self, stage: &str) -> Result<u64> {
        let normalized = normalize_stage_name(stage);
        if let Some(id) = self.stage_ids.get(&normalized) {
            return Ok(*id);
        }
        normalized
            .parse::<u64>()
            .map_err(|_| CrmError::Permanent(format!("unknown kommo stage: {stage}")))
    }

    #[tracing::instrument(level = "debug", skip(self, query, body))]
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&self.access_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(CrmError::from_status(status, truncate(&text)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl CrmApi for KommoClient {
    async fn create_lead(&self, name: &str, phone: &str, fields: &Value) -> Result<Value> {
        let body = Value::Array(vec![build_lead_payload(
            name,
            phone,
            fields,
            self.pipeline_id,
            self.phone_field_id,
        )]);
        let response = self
            .request(Method::POST, "/api/v4/leads", &[], Some(&body))
            .await?;
        first_embedded_lead(&response).ok_or_else(|| {
            CrmError::ResponseFormat("kommo create response missing _embedded.leads".to_string())
        })
    }

    async fn update_lead(&self, lead_id: LeadId, fields: &Value) -> Result<Value> {
        self.request(
            Method::PATCH,
            &format!("/api/v4/leads/{lead_id}"),
            &[],
            Some(fields),
        )
        .await
    }

    async fn update_stage(&self, lead_id: LeadId, stage: &str) -> Result<Value> {
        let status_id = self.resolve_stage(stage)?;
        let mut entry = json!({ "id": lead_id, "status_id": status_id });
        if let Some(pipeline_id) = self.pipeline_id {
            entry["pipeline_id"] = json!(pipeline_id);
        }
        self.request(
            Method::PATCH,
            "/api/v4/leads",
            &[],
            Some(&Value::Array(vec![entry])),
        )
        .await
    }

    async fn fetch_by_phone(&self, phone: &str) -> Result<Value> {
        let response = self
            .request(Method::GET, "/api/v4/leads", &[("query", phone)], None)
            .await?;
        Ok(first_embedded_lead(&response).unwrap_or(Value::Null))
    }

    async fn fetch_by_id(&self, lead_id: LeadId) -> Result<Value> {
        self.request(Method::GET, &format!("/api/v4/leads/{lead_id}"), &[], None)
            .await
    }

    async fn add_note(&self, lead_id: LeadId, text: &str) -> Result<Value> {
        let body = json!([{ "note_type": "common", "params": { "text": text } }]);
        self.request(
            Method::POST,
            &format!("/api/v4/leads/{lead_id}/notes"),
            &[],
            Some(&body),
        )
        .await
    }
}

fn build_lead_payload(
    name: &str,
    phone: &str,
    fields: &Value,
    pipeline_id: Option<u64>,
    phone_field_id: Option<u64>,
) -> Value {
    let mut lead = match fields {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    lead.insert("name".to_string(), Value::String(name.to_string()));
    if let Some(pipeline_id) = pipeline_id {
        lead.insert("pipeline_id".to_string(), json!(pipeline_id));
    }
    lead.insert(
        "_embedded".to_string(),
        json!({ "tags": [{ "name": LEAD_TAG }] }),
    );
    if let Some(field_id) = phone_field_id {
        let entry = json!({ "field_id": field_id, "values": [{ "value": phone }] });
        match lead.get_mut("custom_fields_values") {
            Some(Value::Array(values)) => values.push(entry),
            _ => {
                lead.insert("custom_fields_values".to_string(), json!([entry]));
            }
        }
    }
    Value::Object(lead)
}

fn first_embedded_lead(response: &Value) -> Option<Value> {
    response
        .get("_embedded")
        .and_then(|e| e.get("leads"))
        .and_then(Value::as_array)
        .and_then(|leads| leads.first())
        .cloned()
}

/// Lowercase, accents folded, separators collapsed to `_`.
pub fn normalize_stage_name(stage: &str) -> String {
    let mut out = String::with_capacity(stage.len());
    for ch in stage.trim().chars().flat_map(char::to_lowercase) {
        let folded = match ch {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            ' ' | '-' => '_',
            other => other,
        };
        if folded == '_' && out.ends_with('_') {
            continue;
        }
        out.push(folded);
    }
    out
}

fn truncate(body: &str) -> &str {
    if body.len() <= ERROR_BODY_LIMIT {
        return body;
    }
    let mut end = ERROR_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
