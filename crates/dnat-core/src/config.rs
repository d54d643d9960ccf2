//! Rule configuration sources
//!
//! Two on-disk formats feed the compiler: the legacy line format
//! (`kind,port1,port2,domain[,protocol]`, one rule per line) and a
//! structured TOML variant. Both reduce to ordered [`Declaration`] rows,
//! so everything downstream is format-agnostic.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ruleset::{Protocol, RuleKind};

/// Example legacy rules, logged when the config file is missing so the
/// operator knows what to write.
pub const EXAMPLE_LEGACY: &str = "SINGLE,10000,443,example.com\n\
                                  RANGE,1000,2000,example.com";

/// Example TOML rules file for the structured format
pub const EXAMPLE_TOML: &str = r#"[[rules]]
type = "single"
sport = 10000
dport = 443
domain = "example.com"
protocol = "tcp"

[[rules]]
type = "range"
port_start = 1000
port_end = 2000
domain = "example.com"
"#;

/// One configuration line: the raw trimmed text plus its ordered
/// comma-split fields.
///
/// Interpretation into kind/protocol happens in the compiler, so a
/// malformed kind surfaces as a lookup failure there rather than a parse
/// error here. The raw line is echoed verbatim as a document comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Trimmed source line
    pub line: String,
    /// Comma-split fields of `line`, order preserved, not trimmed
    pub fields: Vec<String>,
}

impl Declaration {
    fn from_line(line: &str) -> Self {
        Self {
            line: line.to_string(),
            fields: line.split(',').map(str::to_string).collect(),
        }
    }
}

/// Split configuration text into declaration rows.
///
/// Lines are whitespace-trimmed (CRLF input tolerated) and blank lines
/// skipped. Nothing else is validated: short rows are kept and the
/// compiler decides what they mean.
pub fn parse_lines(content: &str) -> Vec<Declaration> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Declaration::from_line)
        .collect()
}

/// Where rule declarations come from.
///
/// Re-read on every reconciliation cycle so edits take effect without a
/// restart. The path itself is fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    /// Legacy line format
    Legacy(PathBuf),
    /// Structured TOML (`[[rules]]` tables)
    Toml(PathBuf),
}

impl RuleSource {
    /// The file backing this source
    pub fn path(&self) -> &Path {
        match self {
            Self::Legacy(path) | Self::Toml(path) => path,
        }
    }

    /// Read and parse the source into declaration rows.
    ///
    /// An unreadable file is [`Error::ConfigNotFound`] and a TOML file
    /// that fails to parse is [`Error::InvalidConfig`]; both are fatal.
    pub async fn load(&self) -> Result<Vec<Declaration>> {
        match self {
            RuleSource::Legacy(path) => {
                let content = read_source(path).await?;
                Ok(parse_lines(&content))
            }
            RuleSource::Toml(path) => {
                let content = read_source(path).await?;
                let config: TomlConfig = toml::from_str(&content).map_err(|err| {
                    Error::invalid_config(format!("{}: {err}", path.display()))
                })?;
                Ok(config
                    .rules
                    .iter()
                    .map(TomlRule::to_declaration)
                    .collect())
            }
        }
    }
}

impl std::fmt::Display for RuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Legacy(path) => write!(f, "rules file {}", path.display()),
            Self::Toml(path) => write!(f, "TOML rules file {}", path.display()),
        }
    }
}

async fn read_source(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| Error::config_not_found(path, err))
}

/// Top-level structure of the TOML rules file
#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Forwarding rules, applied in file order
    pub rules: Vec<TomlRule>,
}

/// One `[[rules]]` table.
///
/// Unlike the legacy format, ports are typed here: a structurally invalid
/// file fails parsing up front instead of producing rule text the filter
/// tool would reject every cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TomlRule {
    /// One external port forwarded to one internal port
    Single {
        /// External (listening) port
        sport: u16,
        /// Internal port at the target host
        dport: u16,
        /// Target domain, re-resolved every cycle
        domain: String,
        /// Omitted means both TCP and UDP
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<Protocol>,
    },
    /// A contiguous port range forwarded as-is
    Range {
        /// First port of the range
        port_start: u16,
        /// Last port of the range
        port_end: u16,
        /// Target domain, re-resolved every cycle
        domain: String,
        /// Omitted means both TCP and UDP
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<Protocol>,
    },
}

impl TomlRule {
    /// Canonical legacy-format row for this rule. Both formats meet here,
    /// so the document comment echoes this canonical line.
    fn to_declaration(&self) -> Declaration {
        let line = match self {
            TomlRule::Single {
                sport,
                dport,
                domain,
                protocol,
            } => canonical_line(RuleKind::Single, &sport.to_string(), &dport.to_string(), domain, *protocol),
            TomlRule::Range {
                port_start,
                port_end,
                domain,
                protocol,
            } => canonical_line(
                RuleKind::Range,
                &port_start.to_string(),
                &port_end.to_string(),
                domain,
                *protocol,
            ),
        };
        Declaration::from_line(&line)
    }
}

fn canonical_line(
    kind: RuleKind,
    port1: &str,
    port2: &str,
    domain: &str,
    protocol: Option<Protocol>,
) -> String {
    match protocol {
        Some(p) => format!("{},{port1},{port2},{domain},{}", kind.as_str(), p.as_str()),
        None => format!("{},{port1},{port2},{domain}", kind.as_str()),
    }
}
