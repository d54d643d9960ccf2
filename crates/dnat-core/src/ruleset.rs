//! Rule-set rendering and change detection
//!
//! The compiler turns declaration rows into one complete nftables script:
//!
//! ```text
//! #!/usr/sbin/nft -f          <- fixed preamble (table reset, chains)
//! ...
//! # SINGLE,8080,80,example.com,tcp     <- comment echoing the declaration
//! add rule ip nat PREROUTING ...       <- inbound (dnat) rule
//! add rule ip nat POSTROUTING ...      <- return-path (snat) rule
//! ```
//!
//! Rendering is purely textual: port fields are carried through verbatim
//! and never re-validated, and the only notion of "changed" between two
//! documents is byte inequality. Determinism therefore falls out of the
//! declaration order in the file plus the fixed template text.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Declaration;
use crate::error::{Error, Result};
use crate::traits::AddressResolver;

/// Fixed document preamble: interpreter marker, table reset, chain setup.
///
/// The add/delete/add sequence makes the delete valid even on a first run
/// and leaves the table empty afterwards, so every load starts from a
/// clean slate regardless of what was active before.
pub const PREAMBLE: &str = "#!/usr/sbin/nft -f\n\
\n\
add table ip nat\n\
delete table ip nat\n\
add table ip nat\n\
add chain nat PREROUTING { type nat hook prerouting priority -100 ; }\n\
add chain nat POSTROUTING { type nat hook postrouting priority 100 ; }\n\n";

/// A complete rendered rule set, treated as an opaque, order-sensitive
/// value. Two documents are "the same" exactly when their bytes are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RulesetDocument(String);

impl RulesetDocument {
    /// The empty baseline a process starts with. Compares unequal to any
    /// compiled document (those always carry the preamble), so the first
    /// successful compile is always treated as a change.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Document text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Document bytes, the unit of comparison
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Whether this is the initial empty baseline
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for RulesetDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compare a freshly compiled document against the previous baseline.
///
/// Exact byte equality, no semantic diffing: re-ordering two equivalent
/// rule blocks counts as a change. The compiler is deterministic for a
/// given config and set of resolved addresses, so anything beyond byte
/// comparison would buy nothing.
pub fn has_changed(new_doc: &RulesetDocument, last_doc: &RulesetDocument) -> bool {
    new_doc.as_bytes() != last_doc.as_bytes()
}

/// Declaration kind, the first field of a rule line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// One external port forwarded to one (possibly different) port
    Single,
    /// A contiguous port range forwarded to the same range
    Range,
}

impl RuleKind {
    /// Parse the kind field. `None` for anything outside the closed set,
    /// which the compiler escalates to a fatal error.
    pub fn from_field(field: &str) -> Option<Self> {
        match field {
            "SINGLE" => Some(Self::Single),
            "RANGE" => Some(Self::Range),
            _ => None,
        }
    }

    /// Canonical spelling used in declaration lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Range => "RANGE",
        }
    }
}

/// Transport protocol selector for a declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Lowercase token as it appears in declarations and rule text
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// The closed set of rule templates: `{Single, Range} x {tcp, udp}`.
///
/// Each variant is a pure function from (ports, addresses) to one inbound
/// plus one return-path rule line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTemplate {
    SingleTcp,
    SingleUdp,
    RangeTcp,
    RangeUdp,
}

impl RuleTemplate {
    /// Map a declaration's (kind, protocol field) to the templates it
    /// renders, in emission order. An absent protocol means both, TCP
    /// first. A protocol token outside {tcp, udp} selects nothing: the
    /// declaration keeps only its comment line.
    pub fn select(kind: RuleKind, protocol: Option<&str>) -> &'static [RuleTemplate] {
        match (kind, protocol) {
            (RuleKind::Single, None) => &[Self::SingleTcp, Self::SingleUdp],
            (RuleKind::Single, Some("tcp")) => &[Self::SingleTcp],
            (RuleKind::Single, Some("udp")) => &[Self::SingleUdp],
            (RuleKind::Range, None) => &[Self::RangeTcp, Self::RangeUdp],
            (RuleKind::Range, Some("tcp")) => &[Self::RangeTcp],
            (RuleKind::Range, Some("udp")) => &[Self::RangeUdp],
            (_, Some(_)) => &[],
        }
    }

    /// Render this template's rule block.
    ///
    /// Ports arrive as the literal field text from the configuration; for
    /// `Single` they are (external port, internal port), for `Range`
    /// (range start, range end).
    pub fn render(
        &self,
        port1: &str,
        port2: &str,
        remote_ip: IpAddr,
        local_ip: IpAddr,
    ) -> String {
        match self {
            Self::SingleTcp => Self::single("tcp", port1, port2, remote_ip, local_ip),
            Self::SingleUdp => Self::single("udp", port1, port2, remote_ip, local_ip),
            Self::RangeTcp => Self::range("tcp", port1, port2, remote_ip, local_ip),
            Self::RangeUdp => Self::range("udp", port1, port2, remote_ip, local_ip),
        }
    }

    fn single(proto: &str, port1: &str, port2: &str, remote_ip: IpAddr, local_ip: IpAddr) -> String {
        format!(
            "add rule ip nat PREROUTING {proto} dport {port1} counter dnat to {remote_ip}:{port2}\n\
             add rule ip nat POSTROUTING ip daddr {remote_ip} {proto} dport {port2} counter snat to {local_ip}\n"
        )
    }

    fn range(proto: &str, port1: &str, port2: &str, remote_ip: IpAddr, local_ip: IpAddr) -> String {
        format!(
            "add rule ip nat PREROUTING {proto} dport {port1}-{port2} counter dnat to {remote_ip}:{port1}-{port2}\n\
             add rule ip nat POSTROUTING ip daddr {remote_ip} {proto} dport {port1}-{port2} counter snat to {local_ip}\n"
        )
    }
}

/// Compile declaration rows into one rule-set document.
///
/// For each row, in file order:
///
/// 1. Rows with fewer than 4 fields are syntactically invalid and
///    contribute nothing (not an error for the run).
/// 2. The domain (field 4) is resolved. On failure the row contributes
///    only its comment line; the rest of the document still renders.
/// 3. On success the comment line is followed by the selected template
///    blocks. An unrecognized kind fails the whole compilation: a corrupt
///    config must surface loudly, and the line format offers no other
///    validation point.
///
/// `local_ip` is the cycle-wide local outbound address; the caller has
/// already established it.
pub async fn compile(
    declarations: &[Declaration],
    local_ip: IpAddr,
    resolver: &dyn AddressResolver,
) -> Result<RulesetDocument> {
    let mut text = String::from(PREAMBLE);

    for decl in declarations {
        if decl.fields.len() < 4 {
            continue;
        }

        let domain = &decl.fields[3];
        let Some(remote_ip) = resolver.resolve_domain(domain).await else {
            warn!("cannot resolve {domain}, emitting comment only");
            text.push_str("# ");
            text.push_str(&decl.line);
            text.push('\n');
            continue;
        };

        text.push_str("# ");
        text.push_str(&decl.line);
        text.push('\n');

        let kind_field = &decl.fields[0];
        let kind = RuleKind::from_field(kind_field)
            .ok_or_else(|| Error::unknown_rule_kind(kind_field, &decl.line))?;

        let port1 = &decl.fields[1];
        let port2 = &decl.fields[2];
        let protocol = decl.fields.get(4).map(String::as_str);

        for template in RuleTemplate::select(kind, protocol) {
            text.push_str(&template.render(port1, port2, remote_ip, local_ip));
        }
    }

    Ok(RulesetDocument(text))
}
