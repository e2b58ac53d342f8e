use anyhow::{anyhow, bail, Result};
use chrono_tz::Tz;
use std::time::Duration;

use crate::schedule::{DailyTime, Window};

// --- Process ---

pub const LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
pub const API_KEY_ENV: &str = "VULTR_API_KEY";
pub const SHUTDOWN_TOKEN_ENV: &str = "SHUTDOWN_BEARER_TOKEN";

// --- Schedule (all in SCHEDULE_TIME_ZONE) ---

pub const SCHEDULE_TIME_ZONE: &str = "Asia/Seoul";
pub const CLEANUP_AT: DailyTime = DailyTime::new(0, 10);
pub const CLEANUP_WINDOW: Window = Window::new(DailyTime::new(0, 0), DailyTime::new(7, 0));
pub const PROVISION_AT: DailyTime = DailyTime::new(7, 10);

pub const CLEANUP_SETTLE_DELAY: Duration = Duration::from_secs(20);
pub const CLEANUP_BACKOFF_MIN: Duration = Duration::from_secs(15);
pub const CLEANUP_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);
pub const CLEANUP_DELETE_INTERVAL: Duration = Duration::from_secs(2);
pub const PROVISION_BACKOFF_MIN: Duration = Duration::from_secs(15);
pub const PROVISION_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

// --- Provision target ---

pub const LABEL_TIME_ZONE: &str = "Asia/Tokyo";
pub const CLOUD_INIT_TIME_ZONE: &str = "Asia/Tokyo";
pub const CLOUD_INIT_LOCALE: &str = "en_US.UTF-8";
pub const PROVISION_REGION: &str = "nrt";
pub const PROVISION_PLAN: &str = "vhp-2c-2gb-amd";
pub const PROVISION_OS_ID: u32 = 2625;
pub const PROVISION_USER_SCHEME: &str = "limited";
pub const PROVISION_SSH_KEY_ID: &str = "c426659e-454e-40de-8a8b-6b9820fe72f2";
pub const PROVISION_BLOCK_STORAGE_ID: &str = "52cb7c3a-42fd-47e1-b120-6e8cf6b2ddd1";
pub const PROVISION_BLOCK_ATTACH_LIVE: bool = false;
pub const PROVISION_PRIMARY_USER: &str = "linuxuser";

/// Runtime settings: secrets from the environment plus resolved time zones.
#[derive(Clone, Debug)]
pub struct Settings {
    pub api_key: String,
    pub shutdown_token: String,
    pub schedule_tz: Tz,
    pub label_tz: Tz,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key: required_env(API_KEY_ENV)?,
            shutdown_token: required_env(SHUTDOWN_TOKEN_ENV)?,
            schedule_tz: parse_time_zone(SCHEDULE_TIME_ZONE)?,
            label_tz: parse_time_zone(LABEL_TIME_ZONE)?,
        })
    }
}

fn required_env(name: &str) -> Result<String> {
    let value = std::env::var(name).unwrap_or_default();
    let value = value.trim();
    if value.is_empty() {
        bail!("{name} environment variable is required");
    }
    Ok(value.to_string())
}

pub fn parse_time_zone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow!("invalid time zone {name:?}: {e}"))
}
