//! Dev-fee routing: roughly 5% of dispatches go to dev-marked wallets whose
//! earnings consolidate to a fixed address. Dev solutions are tracked
//! separately and kept out of user-facing session statistics.

use rand::Rng;

use crate::constants::DEV_FEE_PERCENTAGE;
use crate::error::MinerError;

// Stored as hex chunks so the plain address does not show up in config files
// or simple text searches.
const DEV_ADDR_HEX_SEGMENTS: [&str; 7] = [
    "616464723171397937647770346d6465",
    "3877766c3237726d797a777171767965",
    "32796a3436746c7235636478356d686b",
    "33796c787765356d30713974796c7832",
    "727936656d3467356338683974656a71",
    "76676e64356b76736636646b30377735",
    "73763068786675",
];

fn decode_dev_address() -> Result<String, MinerError> {
    let hex_string: String = DEV_ADDR_HEX_SEGMENTS.concat();
    let bytes = hex::decode(hex_string)
        .map_err(|e| MinerError::Config(format!("bad dev address encoding: {}", e)))?;
    let decoded = String::from_utf8(bytes)
        .map_err(|e| MinerError::Config(format!("bad dev address encoding: {}", e)))?;
    if !decoded.starts_with("addr1") {
        return Err(MinerError::Config("invalid dev address format".to_string()));
    }
    Ok(decoded)
}

pub struct DevFeeManager {
    dev_address: String,
    fee_probability: f64,
}

impl DevFeeManager {
    pub fn new() -> Result<Self, MinerError> {
        Ok(Self {
            dev_address: decode_dev_address()?,
            fee_probability: DEV_FEE_PERCENTAGE,
        })
    }

    /// Draw whether the next dispatch should use a dev wallet.
    pub fn should_use_dev_wallet(&self) -> bool {
        rand::thread_rng().gen::<f64>() < self.fee_probability
    }

    pub fn dev_consolidate_address(&self) -> &str {
        &self.dev_address
    }

    pub fn fee_percentage(&self) -> f64 {
        self.fee_probability
    }
}
