//! Built-in run profiles.
//!
//! Each profile is a complete [`Config`] against the booking API under
//! `http://localhost:8080/api/v1`; `surge generate-config` writes one out as
//! a starting point for custom runs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde_json::json;

use crate::config::{
    AuthConfig, Config, LoggingConfig, ReportConfig, RunSettings, StepConfig,
};
use crate::stage::Stage;
use crate::threshold::ThresholdSpec;

const PASSWORD: &str = "password123";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    /// Authenticated mixed traffic up to 50 users.
    Load,
    /// Sudden jump from 10 to 500 users and back.
    Spike,
    /// Sustained 100 then 200 users on the hotel listing.
    Stress,
}

impl Profile {
    pub const ALL: [Profile; 3] = [Profile::Load, Profile::Spike, Profile::Stress];

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Spike => "spike",
            Self::Stress => "stress",
        }
    }

    #[must_use]
    pub fn config(&self) -> Config {
        match self {
            Self::Load => load(),
            Self::Spike => spike(),
            Self::Stress => stress(),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown profile `{s}`, expected one of: load, spike, stress")
            })
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn mins(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn base(name: &str, stages: Vec<Stage>, steps: Vec<StepConfig>) -> Config {
    Config {
        run: RunSettings {
            name: name.to_string(),
            ..RunSettings::default()
        },
        stages,
        thresholds: BTreeMap::new(),
        auth: AuthConfig::default(),
        setup: Vec::new(),
        steps,
        logging: LoggingConfig::default(),
        report: ReportConfig::default(),
    }
}

fn list_hotels() -> StepConfig {
    StepConfig::get("list_hotels", "/hotels").pause(secs(1))
}

fn thresholds(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<ThresholdSpec>> {
    let mut map: BTreeMap<String, Vec<ThresholdSpec>> = BTreeMap::new();
    for (key, expression) in entries {
        map.entry((*key).to_string())
            .or_default()
            .push(ThresholdSpec::Expression((*expression).to_string()));
    }
    map
}

fn load() -> Config {
    let stages = vec![
        Stage::new(secs(30), 20),
        Stage::new(mins(1), 20),
        Stage::new(secs(30), 50),
        Stage::new(mins(1), 50),
        Stage::new(secs(30), 0),
    ];

    let steps = vec![
        StepConfig::get("health_check", "{{origin}}/health")
            .expect_json("/status", Some(json!("ok")))
            .pause(secs(1)),
        list_hotels().expect_json("/success", Some(json!(true))),
        StepConfig::get("get_bookings", "/bookings")
            .with_auth()
            .pause(secs(1)),
        StepConfig::post(
            "register_user",
            "/auth/register",
            json!({
                "name": "Load Test User {{vu}}-{{iter}}",
                "email": "{{unique_email}}",
                "password": PASSWORD,
                "role": "CUSTOMER",
            }),
        )
        .expect_status(201)
        .expect_json("/success", Some(json!(true)))
        .expect_json("/data/email", None)
        .pause(secs(1)),
    ];

    let mut config = base("load", stages, steps);
    config.setup = vec![
        StepConfig::post(
            "setup_register",
            "/auth/register",
            json!({
                "name": "Surge Load Test User",
                "email": "{{unique_email}}",
                "password": PASSWORD,
                "role": "CUSTOMER",
            }),
        )
        .expect_status(201)
        .extract("email", "/data/email"),
        StepConfig::post(
            "setup_login",
            "/auth/login",
            json!({
                "email": "{{setup.email}}",
                "password": PASSWORD,
            }),
        )
        .requires("email")
        .extract("token", "/data/token"),
    ];
    config.thresholds = thresholds(&[
        ("http_req_duration", "p(95)<500"),
        ("http_req_failed", "rate<0.01"),
        ("errors", "rate<0.1"),
    ]);
    config
}

fn spike() -> Config {
    let stages = vec![
        Stage::new(secs(10), 10),
        Stage::new(mins(1), 10),
        Stage::new(secs(10), 500),
        Stage::new(mins(3), 500),
        Stage::new(secs(10), 10),
        Stage::new(mins(3), 10),
        Stage::new(secs(10), 0),
    ];
    base("spike", stages, vec![list_hotels()])
}

fn stress() -> Config {
    let stages = vec![
        Stage::new(mins(2), 100),
        Stage::new(mins(5), 100),
        Stage::new(mins(2), 200),
        Stage::new(mins(5), 200),
        Stage::new(mins(2), 0),
    ];
    let mut config = base("stress", stages, vec![list_hotels()]);
    config.thresholds = thresholds(&[("http_req_duration", "p(99)<1000")]);
    config
}
