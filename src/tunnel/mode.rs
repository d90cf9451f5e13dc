//! Tunnel routing mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the dispatcher picks a proxy for new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Evaluate the rule set.
    #[default]
    Rule,
    /// Send everything through the `GLOBAL` selector.
    Global,
    /// Send everything through `DIRECT`.
    Direct,
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelMode::Rule => "rule",
            TunnelMode::Global => "global",
            TunnelMode::Direct => "direct",
        };
        f.write_str(s)
    }
}

impl FromStr for TunnelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rule" => Ok(TunnelMode::Rule),
            "global" => Ok(TunnelMode::Global),
            "direct" => Ok(TunnelMode::Direct),
            other => Err(format!("unknown mode {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Global".parse::<TunnelMode>().unwrap(), TunnelMode::Global);
        assert!("script".parse::<TunnelMode>().is_err());
        assert_eq!(TunnelMode::Direct.to_string(), "direct");
    }
}
