//! Broker identities, nicknames and group aliases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Every broker the dispatcher knows about.
///
/// Declaration order is the order `all` expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerId {
    Chase,
    Fennel,
    Fidelity,
    Firstrade,
    Public,
    Robinhood,
    Schwab,
    Tastytrade,
    Tradier,
    Vanguard,
    Webull,
}

/// Brokers that settle trades on day one.
const DAY1: [BrokerId; 8] = [
    BrokerId::Chase,
    BrokerId::Fennel,
    BrokerId::Firstrade,
    BrokerId::Public,
    BrokerId::Schwab,
    BrokerId::Tastytrade,
    BrokerId::Tradier,
    BrokerId::Webull,
];

impl BrokerId {
    pub const ALL: [BrokerId; 11] = [
        BrokerId::Chase,
        BrokerId::Fennel,
        BrokerId::Fidelity,
        BrokerId::Firstrade,
        BrokerId::Public,
        BrokerId::Robinhood,
        BrokerId::Schwab,
        BrokerId::Tastytrade,
        BrokerId::Tradier,
        BrokerId::Vanguard,
        BrokerId::Webull,
    ];

    /// Lowercase key used in commands and the credential table.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Chase => "chase",
            Self::Fennel => "fennel",
            Self::Fidelity => "fidelity",
            Self::Firstrade => "firstrade",
            Self::Public => "public",
            Self::Robinhood => "robinhood",
            Self::Schwab => "schwab",
            Self::Tastytrade => "tastytrade",
            Self::Tradier => "tradier",
            Self::Vanguard => "vanguard",
            Self::Webull => "webull",
        }
    }

    /// Name shown to users in report lines.
    pub const fn display_name(&self) -> &'static str {
        match self {
            Self::Chase => "Chase",
            Self::Fennel => "Fennel",
            Self::Fidelity => "Fidelity",
            Self::Firstrade => "Firstrade",
            Self::Public => "Public",
            Self::Robinhood => "Robinhood",
            Self::Schwab => "Schwab",
            Self::Tastytrade => "Tastytrade",
            Self::Tradier => "Tradier",
            Self::Vanguard => "Vanguard",
            Self::Webull => "Webull",
        }
    }

    /// Environment variable holding plain credentials in CLI mode.
    pub const fn env_var(&self) -> &'static str {
        match self {
            Self::Chase => "CHASE",
            Self::Fennel => "FENNEL",
            Self::Fidelity => "FIDELITY",
            Self::Firstrade => "FIRSTRADE",
            Self::Public => "PUBLIC_BROKER",
            Self::Robinhood => "ROBINHOOD",
            Self::Schwab => "SCHWAB",
            Self::Tastytrade => "TASTYTRADE",
            Self::Tradier => "TRADIER",
            Self::Vanguard => "VANGUARD",
            Self::Webull => "WEBULL",
        }
    }

    /// Number of colon-separated fields one credential set must have.
    pub fn credential_fields(&self) -> RangeInclusive<usize> {
        match self {
            Self::Fennel | Self::Tradier => 1..=1,
            Self::Robinhood | Self::Vanguard => 3..=3,
            Self::Webull => 4..=4,
            Self::Fidelity | Self::Schwab => 2..=3,
            _ => 2..=2,
        }
    }

    /// Human description of the credential format, used in error replies.
    pub fn credential_format(&self) -> &'static str {
        match self {
            Self::Fennel => "email",
            Self::Tradier => "access_token",
            Self::Robinhood => "username:password:totp_secret (NA if none)",
            Self::Vanguard => "username:password:phone_last_four",
            Self::Webull => "username:password:device_id:trading_pin",
            Self::Fidelity | Self::Schwab => "username:password[:totp_secret]",
            _ => "username:password",
        }
    }

    /// Resolve a broker name or nickname.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        let canonical = match name.as_str() {
            "fid" | "fido" => "fidelity",
            "ft" => "firstrade",
            "rh" => "robinhood",
            "tasty" => "tastytrade",
            "vg" => "vanguard",
            "wb" => "webull",
            other => other,
        };
        Self::ALL.into_iter().find(|b| b.as_str() == canonical)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown broker: {s}"))
    }
}

/// Named broker groups accepted wherever a broker list is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerGroup {
    All,
    /// All brokers except Vanguard
    Most,
    /// Day-one brokers plus Robinhood
    Fast,
    Day1,
}

impl BrokerGroup {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "all" => Some(Self::All),
            "most" => Some(Self::Most),
            "fast" => Some(Self::Fast),
            "day1" => Some(Self::Day1),
            _ => None,
        }
    }

    /// Expand the group into an ordered broker list.
    pub fn expand(&self) -> Vec<BrokerId> {
        match self {
            Self::All => BrokerId::ALL.to_vec(),
            Self::Most => BrokerId::ALL
                .into_iter()
                .filter(|b| *b != BrokerId::Vanguard)
                .collect(),
            Self::Fast => {
                let mut brokers = DAY1.to_vec();
                brokers.push(BrokerId::Robinhood);
                brokers
            }
            Self::Day1 => DAY1.to_vec(),
        }
    }
}
