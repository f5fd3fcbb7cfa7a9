//! Flow filtering.
//!
//! Rules are evaluated in order and the first rule whose criteria all match
//! decides the flow's fate; a matching rule may also attach a tag for
//! downstream consumers. Nothing else about the rule language lives here:
//! rules arrive already structured from the configuration.

use std::fmt;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::flow::{FlowRecord, field};

/// What happens to a flow once a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Accept,
    Discard,
}

/// Criteria of one rule. Absent criteria always hold; present criteria must
/// all hold for the rule to match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterMatch {
    /// Exporter address prefix.
    pub agent: Option<IpNetwork>,
    /// Flow source address prefix.
    pub src: Option<IpNetwork>,
    /// Flow destination address prefix.
    pub dst: Option<IpNetwork>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Option<u8>,
    pub tos: Option<u8>,
}

/// One ordered filter rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterRule {
    pub action: FilterAction,
    /// Tag attached to the record when this rule matches.
    #[serde(default)]
    pub tag: Option<u32>,
    #[serde(default, rename = "match")]
    pub criteria: FilterMatch,
}

impl FilterMatch {
    fn matches(&self, flow: &FlowRecord) -> bool {
        if let Some(net) = &self.agent {
            if !addr_in(net, flow, field::AGENT_ADDR, &flow.agent_addr) {
                return false;
            }
        }
        if let Some(net) = &self.src {
            if !addr_in(net, flow, field::SRC_ADDR, &flow.src_addr) {
                return false;
            }
        }
        if let Some(net) = &self.dst {
            if !addr_in(net, flow, field::DST_ADDR, &flow.dst_addr) {
                return false;
            }
        }
        if let Some(port) = self.src_port {
            if !flow.has(field::SRC_DST_PORT) || flow.src_port != port {
                return false;
            }
        }
        if let Some(port) = self.dst_port {
            if !flow.has(field::SRC_DST_PORT) || flow.dst_port != port {
                return false;
            }
        }
        if let Some(proto) = self.protocol {
            if !flow.has(field::PROTO_FLAGS_TOS) || flow.protocol != proto {
                return false;
            }
        }
        if let Some(tos) = self.tos {
            if !flow.has(field::PROTO_FLAGS_TOS) || flow.tos != tos {
                return false;
            }
        }
        true
    }
}

/// A prefix criterion holds when the record carries the address (either
/// family bit) and the prefix contains it. Family disagreement is a
/// non-match, not an error.
fn addr_in(
    net: &IpNetwork,
    flow: &FlowRecord,
    bits: u32,
    addr: &Option<crate::address::Xaddr>,
) -> bool {
    if flow.fields & bits == 0 {
        return false;
    }
    match addr {
        Some(a) => net.contains(a.ip()),
        None => false,
    }
}

/// Run `flow` through `rules`. The first matching rule wins and may assign
/// the record's tag; with no match the flow is accepted untouched.
pub fn evaluate(flow: &mut FlowRecord, rules: &[FilterRule]) -> FilterAction {
    for rule in rules {
        if rule.criteria.matches(flow) {
            if let Some(tag) = rule.tag {
                flow.set_tag(tag);
            }
            return rule.action;
        }
    }
    FilterAction::Accept
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterAction::Accept => f.write_str("accept"),
            FilterAction::Discard => f.write_str("discard"),
        }
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.action)?;
        if let Some(tag) = self.tag {
            write!(f, " tag {}", tag)?;
        }
        let c = &self.criteria;
        if let Some(net) = &c.agent {
            write!(f, " agent {}", net)?;
        }
        if let Some(net) = &c.src {
            write!(f, " src {}", net)?;
        }
        if let Some(net) = &c.dst {
            write!(f, " dst {}", net)?;
        }
        if let Some(p) = c.src_port {
            write!(f, " src-port {}", p)?;
        }
        if let Some(p) = c.dst_port {
            write!(f, " dst-port {}", p)?;
        }
        if let Some(p) = c.protocol {
            write!(f, " proto {}", p)?;
        }
        if let Some(t) = c.tos {
            write!(f, " tos {:#04x}", t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Xaddr;
    use std::net::Ipv4Addr;

    fn flow(src: [u8; 4], dst: [u8; 4], proto: u8, dst_port: u16) -> FlowRecord {
        let mut flow = FlowRecord {
            protocol: proto,
            src_addr: Some(Xaddr::V4(Ipv4Addr::from(src))),
            dst_addr: Some(Xaddr::V4(Ipv4Addr::from(dst))),
            dst_port,
            ..Default::default()
        };
        flow.fields = field::SRC_ADDR4
            | field::DST_ADDR4
            | field::SRC_DST_PORT
            | field::PROTO_FLAGS_TOS;
        flow
    }

    fn discard_net(net: &str) -> FilterRule {
        FilterRule {
            action: FilterAction::Discard,
            tag: None,
            criteria: FilterMatch {
                src: Some(net.parse().unwrap()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn empty_rule_list_accepts() {
        let mut f = flow([10, 0, 0, 1], [10, 0, 0, 2], 6, 80);
        assert_eq!(evaluate(&mut f, &[]), FilterAction::Accept);
        assert!(!f.has(field::TAG));
    }

    #[test]
    fn first_match_wins() {
        let rules = vec![
            discard_net("10.0.0.0/8"),
            FilterRule {
                action: FilterAction::Accept,
                tag: None,
                criteria: FilterMatch::default(),
            },
        ];
        let mut inside = flow([10, 1, 2, 3], [192, 0, 2, 1], 6, 80);
        let mut outside = flow([172, 16, 0, 1], [192, 0, 2, 1], 6, 80);
        assert_eq!(evaluate(&mut inside, &rules), FilterAction::Discard);
        assert_eq!(evaluate(&mut outside, &rules), FilterAction::Accept);
    }

    #[test]
    fn matching_rule_assigns_tag() {
        let rules = vec![FilterRule {
            action: FilterAction::Accept,
            tag: Some(7),
            criteria: FilterMatch {
                protocol: Some(17),
                dst_port: Some(53),
                ..Default::default()
            },
        }];
        let mut dns = flow([10, 0, 0, 1], [10, 0, 0, 53], 17, 53);
        assert_eq!(evaluate(&mut dns, &rules), FilterAction::Accept);
        assert!(dns.has(field::TAG));
        assert_eq!(dns.tag, 7);

        let mut web = flow([10, 0, 0, 1], [10, 0, 0, 53], 6, 443);
        evaluate(&mut web, &rules);
        assert!(!web.has(field::TAG));
    }

    #[test]
    fn family_mismatch_does_not_match() {
        let rules = vec![discard_net("2001:db8::/32")];
        let mut f = flow([10, 0, 0, 1], [10, 0, 0, 2], 6, 80);
        assert_eq!(evaluate(&mut f, &rules), FilterAction::Accept);
    }

    #[test]
    fn missing_field_does_not_match() {
        let rules = vec![FilterRule {
            action: FilterAction::Discard,
            tag: None,
            criteria: FilterMatch {
                dst_port: Some(80),
                ..Default::default()
            },
        }];
        let mut f = flow([10, 0, 0, 1], [10, 0, 0, 2], 6, 80);
        f.fields &= !field::SRC_DST_PORT;
        assert_eq!(evaluate(&mut f, &rules), FilterAction::Accept);
    }

    #[test]
    fn rule_display_is_readable() {
        let rule = FilterRule {
            action: FilterAction::Discard,
            tag: Some(3),
            criteria: FilterMatch {
                agent: Some("192.0.2.0/24".parse().unwrap()),
                protocol: Some(6),
                ..Default::default()
            },
        };
        assert_eq!(format!("{}", rule), "discard tag 3 agent 192.0.2.0/24 proto 6");
    }
}
