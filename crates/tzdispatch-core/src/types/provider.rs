//! Carrier providers. Each provider is its own queue partition.

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Outbound carrier a message is routed through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Twilio,
    Vonage,
    Plivo,
    Sinch,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Twilio,
        Provider::Vonage,
        Provider::Plivo,
        Provider::Sinch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Twilio => "twilio",
            Provider::Vonage => "vonage",
            Provider::Plivo => "plivo",
            Provider::Sinch => "sinch",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| DispatchError::validation(format!("Unsupported provider: {s}")))
    }
}
