use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Synthetic,
    Torch,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "synthetic" | "stub" => Ok(Self::Synthetic),
            "torch" | "tch" => Ok(Self::Torch),
            other => Err(format!("unknown engine '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub device: String,
    pub engine: EngineKind,
    pub tokenizer_path: PathBuf,
    pub module_path: PathBuf,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub tokenizer_workers: usize,
    /// Upper bound on concurrently running producer threads; 0 disables the bound.
    pub generation_workers: usize,
    pub channel_capacity: usize,
    pub fragment_timeout: Duration,
    pub producer_join_timeout: Duration,
    pub synthetic_prefill_delay: Duration,
    pub synthetic_token_delay: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            model_id: "Qwen/Qwen2.5-1.5B-Instruct".to_string(),
            device: "cpu".to_string(),
            engine: EngineKind::Synthetic,
            tokenizer_path: PathBuf::from("models/tokenizer.json"),
            module_path: PathBuf::from("models/model.ts"),
            max_new_tokens: 128,
            temperature: 0.7,
            top_p: 0.95,
            tokenizer_workers: 4,
            generation_workers: 0,
            channel_capacity: 64,
            fragment_timeout: Duration::from_secs(120),
            producer_join_timeout: Duration::from_secs(120),
            synthetic_prefill_delay: Duration::from_millis(40),
            synthetic_token_delay: Duration::from_millis(15),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let parsed = |key: &str| var(key).and_then(|v| v.parse::<u64>().ok());
        let positive = |key: &str| parsed(key).filter(|n| *n > 0);

        let listen_addr = var("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let model_id = var("MODEL_ID").unwrap_or(defaults.model_id);
        let device = var("DEVICE").unwrap_or(defaults.device);

        let engine = match var("ENGINE") {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => defaults.engine,
        };

        let tokenizer_path = var("TOKENIZER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tokenizer_path);
        let module_path = var("MODULE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.module_path);

        Ok(Self {
            listen_addr,
            model_id,
            device,
            engine,
            tokenizer_path,
            module_path,
            max_new_tokens: positive("MAX_NEW_TOKENS")
                .map(|n| n as usize)
                .unwrap_or(defaults.max_new_tokens),
            temperature: var("TEMPERATURE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.temperature),
            top_p: var("TOP_P")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.top_p),
            tokenizer_workers: positive("TOKENIZER_WORKERS")
                .map(|n| n as usize)
                .unwrap_or(defaults.tokenizer_workers),
            generation_workers: parsed("GENERATION_WORKERS")
                .map(|n| n as usize)
                .unwrap_or(defaults.generation_workers),
            channel_capacity: positive("CHANNEL_CAPACITY")
                .map(|n| n as usize)
                .unwrap_or(defaults.channel_capacity),
            // A zero wait would end every request before its first fragment.
            fragment_timeout: positive("FRAGMENT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fragment_timeout),
            producer_join_timeout: positive("PRODUCER_JOIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.producer_join_timeout),
            synthetic_prefill_delay: parsed("SYNTHETIC_PREFILL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.synthetic_prefill_delay),
            synthetic_token_delay: parsed("SYNTHETIC_TOKEN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.synthetic_token_delay),
        })
    }
}
