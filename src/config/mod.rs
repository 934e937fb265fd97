use std::path::Path;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::DEFAULT_WALLETS_PER_GPU;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub miner: MinerSection,
    pub gpu: GpuSection,
    pub cpu: CpuSection,
    pub wallet: WalletSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerSection {
    pub api_url: String,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GpuSection {
    pub enabled: Option<bool>,
    pub cuda_toolkit_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuSection {
    pub enabled: bool,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSection {
    pub consolidate_address: Option<String>,
    pub wallets_per_gpu: usize,
}

impl Default for MinerSection {
    fn default() -> Self {
        Self {
            api_url: "https://mine.defensio.io/api".to_string(),
            verbose: false,
        }
    }
}

impl Default for CpuSection {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: 1,
        }
    }
}

impl Default for WalletSection {
    fn default() -> Self {
        Self {
            consolidate_address: None,
            wallets_per_gpu: DEFAULT_WALLETS_PER_GPU,
        }
    }
}

impl GpuSection {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl Config {
    /// Load configuration from a YAML file, writing defaults when the file is
    /// missing. A corrupted file (typically a git merge conflict) is backed up
    /// to `<path>.broken` and the recognizable settings are recovered from the
    /// raw text.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("No config file found, using defaults");
            let config = Config::default();
            config.save(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        match serde_yaml::from_str::<Config>(&content) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                Ok(config)
            }
            Err(e) => {
                warn!("Config file corrupted (likely git conflict): {}", e);
                let config = Self::recover_from_text(path, &content)?;
                Ok(config)
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Best-effort extraction of known keys from a file YAML refuses to parse.
    /// Never fails the startup path: whatever cannot be recovered keeps its
    /// default value.
    fn recover_from_text(path: &Path, content: &str) -> Result<Self> {
        info!("Attempting to recover configuration from corrupted file...");

        let broken = path.with_extension("yaml.broken");
        if let Err(e) = std::fs::copy(path, &broken) {
            warn!("Could not back up corrupted config: {}", e);
        } else {
            info!("Backed up corrupted config to {}", broken.display());
        }

        let mut config = Config::default();

        if let Some(url) = last_match(content, r"api_url:\s*(https?://\S+)") {
            config.miner.api_url = url;
            info!("Recovered miner.api_url: {}", config.miner.api_url);
        }
        if let Some(v) = last_match(content, r"verbose:\s*(true|false|True|False)") {
            config.miner.verbose = v.to_lowercase() == "true";
        }
        if let Some(addr) = last_match(content, r"consolidate_address:\s*([a-zA-Z0-9_]+)") {
            if addr.to_lowercase() != "null" {
                info!("Recovered wallet.consolidate_address: {}", addr);
                config.wallet.consolidate_address = Some(addr);
            }
        }
        if let Some(n) = last_match(content, r"wallets_per_gpu:\s*(\d+)") {
            if let Ok(n) = n.parse() {
                config.wallet.wallets_per_gpu = n;
            }
        }
        if let Some(p) = last_match(content, r#"cuda_toolkit_path:\s*"?([^"\n]+)"?"#) {
            let p = p.trim().to_string();
            if p.to_lowercase() != "null" {
                config.gpu.cuda_toolkit_path = Some(p);
            }
        }

        // `enabled` and `workers` appear in more than one section, so restrict
        // the search to the last `cpu:` block.
        if let Some(block) = cpu_block(content) {
            if let Some(v) = last_match(&block, r"enabled:\s*(true|false|True|False)") {
                config.cpu.enabled = v.to_lowercase() == "true";
                info!("Recovered cpu.enabled: {}", config.cpu.enabled);
            }
            if let Some(n) = last_match(&block, r"workers:\s*(\d+)") {
                if let Ok(n) = n.parse() {
                    config.cpu.workers = n;
                }
            }
        }

        config.save(path)?;
        info!("Successfully recovered and saved configuration.");
        Ok(config)
    }
}

fn last_match(content: &str, pattern: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures_iter(content)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn cpu_block(content: &str) -> Option<String> {
    let start = content.rfind("cpu:")?;
    let block = &content[start..];
    let end = Regex::new(r"(?m)^(gpu|miner|wallet):")
        .ok()?
        .find(&block[4..])
        .map(|m| m.start() + 4)
        .unwrap_or(block.len());
    Some(block[..end].to_string())
}
