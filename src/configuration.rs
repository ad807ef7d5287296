use std::path::PathBuf;

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Deserializer};
use serde_aux::field_attributes::deserialize_number_from_string;

const DEFAULT_TARGET_URL: &str =
    "https://immi.homeaffairs.gov.au/visas/getting-a-visa/fees-and-charges/current-visa-pricing#";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub target_url: String,
    pub output_file: PathBuf,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_pages: u32,
    #[serde(deserialize_with = "deserialize_truthy")]
    pub headless: bool,
    pub user_agent: Option<String>,
    pub webdriver_url: String,
    pub chromedriver_path: Option<String>,
    #[serde(deserialize_with = "deserialize_truthy")]
    pub save_page_snapshots: bool,
    pub snapshot_dir: PathBuf,
}

/// Environment variables override the defaults field by field, e.g.
/// `HEADLESS=1`, `USER_AGENT=...`, `CHROMEDRIVER_PATH=/usr/bin/chromedriver`.
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let settings = Config::builder()
        .set_default("target_url", DEFAULT_TARGET_URL)?
        .set_default("output_file", "visa_fees.json")?
        .set_default("max_pages", 20)?
        .set_default("headless", false)?
        .set_default("webdriver_url", "http://localhost:9515")?
        .set_default("save_page_snapshots", true)?
        .set_default("snapshot_dir", ".")?
        .add_source(Environment::default())
        .build()?;

    settings.try_deserialize()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Truthy {
    Bool(bool),
    Number(i64),
    Text(String),
}

// Accepts "1", "true" and "yes" in any casing, like HEADLESS in the wild.
fn deserialize_truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Truthy::deserialize(deserializer)? {
        Truthy::Bool(value) => Ok(value),
        Truthy::Number(value) => Ok(value != 0),
        Truthy::Text(value) => Ok(matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes"
        )),
    }
}
