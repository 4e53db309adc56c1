//! SDR agent configuration loader.

use sdr_crm::OperationKind;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdrConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub kommo: KommoConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub followup: FollowUpConfig,
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_data_dir_string")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir_string(),
        }
    }
}

fn default_data_dir_string() -> String {
    "~/.sdr-agent/data".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub instance: String,
    /// Prepended to numbers that arrive without a country code.
    #[serde(default = "default_country_prefix")]
    pub country_prefix: String,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            instance: String::new(),
            country_prefix: default_country_prefix(),
        }
    }
}

fn default_country_prefix() -> String {
    "55".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KommoConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub pipeline_id: Option<u64>,
    /// Stage name -> Kommo status id. Names are normalized on load.
    #[serde(default)]
    pub stage_ids: HashMap<String, u64>,
    #[serde(default)]
    pub phone_field_id: Option<u64>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_budget_per_second")]
    pub budget_per_second: usize,
    #[serde(default = "default_throttle_base_seconds")]
    pub throttle_base_seconds: u64,
    #[serde(default = "default_throttle_ceiling_seconds")]
    pub throttle_ceiling_seconds: u64,
    #[serde(default = "default_block_base_seconds")]
    pub block_base_seconds: u64,
    #[serde(default = "default_block_ceiling_seconds")]
    pub block_ceiling_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            budget_per_second: default_budget_per_second(),
            throttle_base_seconds: default_throttle_base_seconds(),
            throttle_ceiling_seconds: default_throttle_ceiling_seconds(),
            block_base_seconds: default_block_base_seconds(),
            block_ceiling_seconds: default_block_ceiling_seconds(),
        }
    }
}

// Kommo documents 7 req/s.
fn default_budget_per_second() -> usize {
    6
}

fn default_throttle_base_seconds() -> u64 {
    5
}

fn default_throttle_ceiling_seconds() -> u64 {
    60
}

fn default_block_base_seconds() -> u64 {
    30
}

fn default_block_ceiling_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ceiling_seconds")]
    pub backoff_ceiling_seconds: u64,
    #[serde(default = "default_result_timeout_seconds")]
    pub result_timeout_seconds: u64,
    /// Operation kind (snake_case) -> priority, overriding the built-in tiers.
    #[serde(default)]
    pub priorities: HashMap<OperationKind, u8>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_queue_max_attempts(),
            backoff_ceiling_seconds: default_backoff_ceiling_seconds(),
            result_timeout_seconds: default_result_timeout_seconds(),
            priorities: HashMap::new(),
        }
    }
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_backoff_ceiling_seconds() -> u64 {
    60
}

fn default_result_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_enabled")]
    pub enabled: bool,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: f64,
    #[serde(default = "default_max_fragments")]
    pub max_fragments: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: default_buffer_enabled(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            max_fragments: default_max_fragments(),
        }
    }
}

fn default_buffer_enabled() -> bool {
    true
}

fn default_idle_timeout_seconds() -> f64 {
    10.0
}

fn default_max_fragments() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct FollowUpConfig {
    #[serde(default = "default_followup_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval_seconds")]
    pub scheduler_interval_seconds: u64,
    #[serde(default = "default_tick_lock_ttl_seconds")]
    pub tick_lock_ttl_seconds: u64,
    #[serde(default = "default_record_lock_ttl_seconds")]
    pub record_lock_ttl_seconds: u64,
    /// Executed or failed follow-ups per owner inside the window before new ones are cancelled.
    #[serde(default = "default_followup_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_attempt_window_hours")]
    pub attempt_window_hours: u64,
    #[serde(default = "default_dedup_tolerance_minutes")]
    pub dedup_tolerance_minutes: u64,
    #[serde(default = "default_worker_pop_timeout_seconds")]
    pub worker_pop_timeout_seconds: u64,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_sequence")]
    pub sequence: Vec<SequenceStepConfig>,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            enabled: default_followup_enabled(),
            scheduler_interval_seconds: default_scheduler_interval_seconds(),
            tick_lock_ttl_seconds: default_tick_lock_ttl_seconds(),
            record_lock_ttl_seconds: default_record_lock_ttl_seconds(),
            max_attempts: default_followup_max_attempts(),
            attempt_window_hours: default_attempt_window_hours(),
            dedup_tolerance_minutes: default_dedup_tolerance_minutes(),
            worker_pop_timeout_seconds: default_worker_pop_timeout_seconds(),
            queue_name: default_queue_name(),
            sequence: default_sequence(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequenceStepConfig {
    pub delay_hours: u64,
    /// `{name}` is replaced with the lead's name.
    pub template: String,
}

fn default_followup_enabled() -> bool {
    true
}

fn default_scheduler_interval_seconds() -> u64 {
    60
}

fn default_tick_lock_ttl_seconds() -> u64 {
    120
}

fn default_record_lock_ttl_seconds() -> u64 {
    60
}

fn default_followup_max_attempts() -> u32 {
    3
}

fn default_attempt_window_hours() -> u64 {
    48
}

fn default_dedup_tolerance_minutes() -> u64 {
    30
}

fn default_worker_pop_timeout_seconds() -> u64 {
    5
}

fn default_queue_name() -> String {
    "followup_tasks".to_string()
}

fn default_sequence() -> Vec<SequenceStepConfig> {
    vec![
        SequenceStepConfig {
            delay_hours: 4,
            template: "Oi {name}! Vi que nossa conversa ficou parada. Ficou alguma dúvida sobre o programa de sócios?".to_string(),
        },
        SequenceStepConfig {
            delay_hours: 24,
            template: "{name}, passando para lembrar das vantagens de ser sócio. Posso te ajudar a concluir sua adesão?".to_string(),
        },
        SequenceStepConfig {
            delay_hours: 48,
            template: "{name}, esta é minha última mensagem por aqui. Se quiser retomar, é só responder!".to_string(),
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusinessHoursConfig {
    #[serde(default = "default_business_start")]
    pub start: String,
    #[serde(default = "default_business_end")]
    pub end: String,
    /// Fixed UTC offset of the business location, e.g. "-03:00".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default)]
    pub weekend_support: bool,
    #[serde(default = "default_mid_morning")]
    pub mid_morning: String,
    #[serde(default = "default_midday")]
    pub midday: String,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            start: default_business_start(),
            end: default_business_end(),
            utc_offset: default_utc_offset(),
            weekend_support: false,
            mid_morning: default_mid_morning(),
            midday: default_midday(),
        }
    }
}

fn default_business_start() -> String {
    "08:00".to_string()
}

fn default_business_end() -> String {
    "18:00".to_string()
}

fn default_utc_offset() -> String {
    "-03:00".to_string()
}

fn default_mid_morning() -> String {
    "10:00".to_string()
}

fn default_midday() -> String {
    "12:00".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Business-layer endpoint that receives coalesced conversation batches.
    #[serde(default)]
    pub forward_url: Option<String>,
    #[serde(default = "default_forward_timeout_seconds")]
    pub forward_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            forward_url: None,
            forward_timeout_seconds: default_forward_timeout_seconds(),
        }
    }
}

fn default_forward_timeout_seconds() -> u64 {
    60
}

impl SdrConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(v) = get("SDR_DATA_DIR") {
            self.general.data_dir = v;
        }
        if let Some(v) = get("SDR_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = get("EVOLUTION_API_URL") {
            self.evolution.base_url = v;
        }
        if let Some(v) = get("EVOLUTION_API_KEY") {
            self.evolution.api_key = v;
        }
        if let Some(v) = get("EVOLUTION_INSTANCE") {
            self.evolution.instance = v;
        }
        if let Some(v) = get("KOMMO_BASE_URL") {
            self.kommo.base_url = v;
        }
        if let Some(v) = get("KOMMO_ACCESS_TOKEN") {
            self.kommo.access_token = v;
            self.kommo.enabled = true;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(anyhow::anyhow!("server.bind_addr is required"));
        }
        if self.kommo.enabled {
            if self.kommo.base_url.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "kommo.base_url is required when kommo is enabled"
                ));
            }
            if self.kommo.access_token.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "kommo.access_token is required when kommo is enabled"
                ));
            }
        }
        if self.rate_limit.budget_per_second == 0 {
            return Err(anyhow::anyhow!("rate_limit.budget_per_second must be > 0"));
        }
        if self.queue.max_attempts == 0 {
            return Err(anyhow::anyhow!("queue.max_attempts must be > 0"));
        }
        if !(self.buffer.idle_timeout_seconds > 0.0) {
            return Err(anyhow::anyhow!("buffer.idle_timeout_seconds must be > 0"));
        }
        if self.buffer.max_fragments == 0 {
            return Err(anyhow::anyhow!("buffer.max_fragments must be > 0"));
        }
        if self.followup.enabled {
            if self.followup.scheduler_interval_seconds == 0 {
                return Err(anyhow::anyhow!(
                    "followup.scheduler_interval_seconds must be > 0"
                ));
            }
            if self.followup.queue_name.trim().is_empty() {
                return Err(anyhow::anyhow!("followup.queue_name is required"));
            }
            if self.followup.max_attempts == 0 {
                return Err(anyhow::anyhow!("followup.max_attempts must be > 0"));
            }
        }
        crate::followup::BusinessHours::from_config(&self.business_hours)?;
        Ok(())
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_home(&self.general.data_dir)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".sdr-agent").join("config.toml")
}

fn expand_home(path: &str) -> anyhow::Result<PathBuf> {
    let trimmed = path.trim();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen('~', &home, 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_documented_defaults() {
        let cfg = SdrConfig::from_toml_str("").expect("parse empty config");
        assert_eq!(cfg.rate_limit.budget_per_second, 6);
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.queue.result_timeout_seconds, 120);
        assert_eq!(cfg.buffer.idle_timeout_seconds, 10.0);
        assert_eq!(cfg.buffer.max_fragments, 10);
        assert_eq!(cfg.followup.scheduler_interval_seconds, 60);
        assert_eq!(cfg.followup.attempt_window_hours, 48);
        assert_eq!(cfg.followup.queue_name, "followup_tasks");
        assert_eq!(cfg.followup.sequence.len(), 3);
        assert_eq!(cfg.business_hours.start, "08:00");
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn env_overrides_enable_kommo() {
        let mut cfg = SdrConfig::from_toml_str(
            r#"
[kommo]
base_url = "https://club.kommo.com"

[followup]
dedup_tolerance_minutes = 15
"#,
        )
        .expect("parse config");
        assert!(!cfg.kommo.enabled);
        cfg.apply_env_overrides(|key| match key {
            "KOMMO_ACCESS_TOKEN" => Some("secret".to_string()),
            "SDR_BIND_ADDR" => Some("   ".to_string()),
            _ => None,
        });
        assert!(cfg.kommo.enabled);
        assert_eq!(cfg.kommo.access_token, "secret");
        assert_eq!(cfg.server.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.followup.dedup_tolerance_minutes, 15);
        cfg.validate().expect("valid config");
    }

    #[test]
    fn queue_priorities_are_keyed_by_operation_kind() {
        let cfg = SdrConfig::from_toml_str(
            r#"
[queue.priorities]
add_note = 1
fetch_by_phone = 3
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.queue.priorities.get(&OperationKind::AddNote), Some(&1));
        assert_eq!(cfg.queue.priorities.get(&OperationKind::FetchByPhone), Some(&3));
        assert!(SdrConfig::from_toml_str("[queue.priorities]\nunknown_kind = 1\n").is_err());
    }

    #[test]
    fn validate_rejects_bad_business_hours() {
        let cfg = SdrConfig::from_toml_str(
            r#"
[business_hours]
start = "19:00"
end = "08:00"
"#,
        )
        .expect("parse config");
        assert!(cfg.validate().is_err());
    }
}
