// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Firewall filter compiler.
//!
//! Security-group rules become tcpdump-style boolean expressions installed
//! on the west (inbound) side of each branch firewall; the east (outbound)
//! side is synthesized from the NIC's own addresses. Rules compile to a
//! typed [`RuleFilter`] first and only become text in its `Display`
//! implementation, so empty parts simply never join the output and no
//! trailing separators have to be trimmed.

use crate::model::{Direction, Model, Nic, Protocol, Rule, SecurityGroup};
use net::Cidr;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;
#[allow(unused)]
use tracing::{debug, error, warn};

/// Always allow DHCP requests out, whatever the address list says; a guest
/// without a lease sources from 0.0.0.0.
pub(crate) const DHCP_REQUEST_PERMIT: &str = "(src host 0.0.0.0 and dst host 255.255.255.255 and udp src port 68 and udp dst port 67)";

enum SourceClause {
    /// Match a source network.
    Net(Cidr),
    /// Match the whole IPv4 family.
    AnyV4,
    /// Match the whole IPv6 family.
    AnyV6,
    /// Match any of the expanded security-group members.
    Hosts(Vec<IpAddr>),
}

enum ProtocolClause {
    Icmp,
    Icmp6,
    Tcp,
    Udp,
    /// Matches the first IP header only, not chained v6 extension headers.
    Numeric { proto: u8, v6: bool },
}

enum PortClause {
    Single(u16),
    Range { start: u16, end: u16 },
}

/// One compiled rule: source clause, optional protocol clause, optional
/// destination-port clause.
pub(crate) struct RuleFilter {
    source: SourceClause,
    protocol: Option<ProtocolClause>,
    ports: Option<PortClause>,
}

impl RuleFilter {
    /// Compile a model rule. Returns `None` for outbound rules (outbound
    /// filters are synthesized per NIC), for rules whose security group is
    /// unknown or empty, and for invalid port ranges; the reasons are
    /// logged here.
    pub(crate) fn compile(rule: &Rule, model: &Model) -> Option<RuleFilter> {
        if rule.direction == Direction::Outbound {
            return None;
        }

        let source = if let Some(sgid) = &rule.security_group {
            let Some(sg) = model.security_group(sgid) else {
                error!("security group {sgid} not available");
                return None;
            };
            if sg.members.is_empty() {
                warn!("no member in security group {}", sg.id);
                return None;
            }
            SourceClause::Hosts(sg.members.clone())
        } else if let Some(cidr) = rule.cidr {
            if cidr.prefix_len() != 0 {
                SourceClause::Net(cidr)
            } else if cidr.is_ipv4() {
                SourceClause::AnyV4
            } else {
                SourceClause::AnyV6
            }
        } else {
            error!("rule has neither a source network nor a security group");
            return None;
        };

        let v6 = rule.cidr.is_some_and(|c| !c.is_ipv4());
        let protocol = match rule.protocol {
            Protocol::Any => None,
            Protocol::Icmp => Some(ProtocolClause::Icmp),
            Protocol::Icmp6 => Some(ProtocolClause::Icmp6),
            Protocol::Tcp => Some(ProtocolClause::Tcp),
            Protocol::Udp => Some(ProtocolClause::Udp),
            Protocol::Other(proto) => Some(ProtocolClause::Numeric { proto, v6 }),
        };

        let ports = match (rule.protocol, rule.ports) {
            (Protocol::Tcp | Protocol::Udp, Some(range)) => {
                let (Ok(start), Ok(end)) =
                    (u16::try_from(range.start), u16::try_from(range.end))
                else {
                    error!("invalid port range {}-{}", range.start, range.end);
                    return None;
                };
                if start > end {
                    error!("invalid port range {start}-{end}");
                    return None;
                }
                if start == end {
                    Some(PortClause::Single(end))
                } else {
                    Some(PortClause::Range { start, end })
                }
            }
            // only TCP and UDP carry destination ports
            _ => None,
        };

        Some(RuleFilter {
            source,
            protocol,
            ports,
        })
    }
}

impl Display for RuleFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            SourceClause::Net(cidr) => write!(f, "src net {cidr}")?,
            SourceClause::AnyV4 => write!(f, "ip")?,
            SourceClause::AnyV6 => write!(f, "ip6")?,
            // security-group expansion keeps the spaced form, distinct from
            // the plain (src host IP) clauses of the outbound stream
            SourceClause::Hosts(members) => {
                write!(f, "(")?;
                for (i, ip) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or")?;
                    }
                    write!(f, " src host {ip}")?;
                }
                write!(f, ")")?;
            }
        }
        match &self.protocol {
            None => {}
            Some(ProtocolClause::Icmp) => write!(f, " and icmp")?,
            Some(ProtocolClause::Icmp6) => write!(f, " and icmp6")?,
            Some(ProtocolClause::Tcp) => write!(f, " and tcp")?,
            Some(ProtocolClause::Udp) => write!(f, " and udp")?,
            Some(ProtocolClause::Numeric { proto, v6: false }) => {
                write!(f, " and (ip proto {proto})")?;
            }
            Some(ProtocolClause::Numeric { proto, v6: true }) => {
                write!(f, " and (ip6 proto {proto})")?;
            }
        }
        match &self.ports {
            None => {}
            Some(PortClause::Single(port)) => write!(f, " dst port {port}")?,
            Some(PortClause::Range { start, end }) => {
                write!(f, " dst portrange {start}-{end}")?;
            }
        }
        Ok(())
    }
}

/// Compile one rule to its filter text, if it yields one.
pub(crate) fn compile_rule(rule: &Rule, model: &Model) -> Option<String> {
    RuleFilter::compile(rule, model).map(|filter| filter.to_string())
}

/// All rules of a security group, `||`-joined over the non-empty ones.
pub(crate) fn security_group_filter(sg: &SecurityGroup, model: &Model) -> String {
    let parts: Vec<String> = sg
        .rules
        .iter()
        .filter_map(|rule| RuleFilter::compile(rule, model))
        .map(|filter| format!("({filter})"))
        .collect();
    parts.join("||")
}

/// The inbound stream of a NIC: every referenced security group that
/// compiles to something, `||`-joined.
pub(crate) fn inbound_filter(nic: &Nic, model: &Model) -> String {
    let parts: Vec<String> = nic
        .security_groups
        .iter()
        .filter_map(|id| model.security_group(id))
        .map(|sg| security_group_filter(sg, model))
        .filter(|text| !text.is_empty())
        .map(|text| format!("({text})"))
        .collect();
    parts.join("||")
}

/// The outbound stream of a NIC: its own addresses plus the DHCP permit.
pub(crate) fn outbound_filter(nic: &Nic) -> String {
    let mut parts: Vec<String> = nic
        .ip_list
        .iter()
        .map(|ip| format!("(src host {ip})"))
        .collect();
    parts.push(DHCP_REQUEST_PERMIT.to_string());
    parts.join(" || ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::model::{NicBuilder, NicType, PortRange, RuleBuilder};
    use net::{Mac, Vni};
    use tracing_test::traced_test;

    fn inbound_tcp(cidr: &str, start: u32, end: u32) -> Rule {
        RuleBuilder::default()
            .direction(Direction::Inbound)
            .protocol(Protocol::Tcp)
            .cidr(Some(cidr.parse().unwrap()))
            .ports(Some(PortRange { start, end }))
            .build()
            .unwrap()
    }

    #[test]
    fn tcp_rule_with_single_port() {
        let rule = inbound_tcp("10.0.0.0/24", 80, 80);
        assert_eq!(
            compile_rule(&rule, &Model::new()).unwrap(),
            "src net 10.0.0.0/24 and tcp dst port 80"
        );
    }

    #[test]
    fn tcp_rule_with_port_range() {
        let rule = inbound_tcp("10.0.0.0/24", 80, 90);
        assert_eq!(
            compile_rule(&rule, &Model::new()).unwrap(),
            "src net 10.0.0.0/24 and tcp dst portrange 80-90"
        );
    }

    #[test]
    fn inverted_or_oversized_port_ranges_drop_the_rule() {
        assert!(compile_rule(&inbound_tcp("10.0.0.0/24", 90, 80), &Model::new()).is_none());
        assert!(compile_rule(&inbound_tcp("10.0.0.0/24", 80, 70000), &Model::new()).is_none());
    }

    #[test]
    fn outbound_rules_are_skipped() {
        let rule = RuleBuilder::default()
            .direction(Direction::Outbound)
            .cidr(Some("10.0.0.0/24".parse().unwrap()))
            .build()
            .unwrap();
        assert!(compile_rule(&rule, &Model::new()).is_none());
    }

    #[test]
    fn zero_prefix_matches_the_family() {
        let v4 = RuleBuilder::default()
            .direction(Direction::Inbound)
            .cidr(Some("0.0.0.0/0".parse().unwrap()))
            .build()
            .unwrap();
        assert_eq!(compile_rule(&v4, &Model::new()).unwrap(), "ip");

        let v6 = RuleBuilder::default()
            .direction(Direction::Inbound)
            .cidr(Some("::/0".parse().unwrap()))
            .build()
            .unwrap();
        assert_eq!(compile_rule(&v6, &Model::new()).unwrap(), "ip6");
    }

    #[test]
    fn numeric_protocol_follows_the_family() {
        let v4 = RuleBuilder::default()
            .direction(Direction::Inbound)
            .protocol(Protocol::Other(47))
            .cidr(Some("10.0.0.0/8".parse().unwrap()))
            .build()
            .unwrap();
        assert_eq!(
            compile_rule(&v4, &Model::new()).unwrap(),
            "src net 10.0.0.0/8 and (ip proto 47)"
        );

        let v6 = RuleBuilder::default()
            .direction(Direction::Inbound)
            .protocol(Protocol::Other(47))
            .cidr(Some("fd00::/8".parse().unwrap()))
            .build()
            .unwrap();
        assert_eq!(
            compile_rule(&v6, &Model::new()).unwrap(),
            "src net fd00::/8 and (ip6 proto 47)"
        );
    }

    #[test]
    fn non_transport_rules_never_emit_ports() {
        let rule = RuleBuilder::default()
            .direction(Direction::Inbound)
            .protocol(Protocol::Icmp)
            .cidr(Some("10.0.0.0/24".parse().unwrap()))
            .ports(Some(PortRange { start: 1, end: 2 }))
            .build()
            .unwrap();
        assert_eq!(
            compile_rule(&rule, &Model::new()).unwrap(),
            "src net 10.0.0.0/24 and icmp"
        );
    }

    fn model_with_group(id: &str, members: &[&str], rules: Vec<Rule>) -> Model {
        let mut model = Model::new();
        model.security_groups.insert(
            id.to_string(),
            SecurityGroup {
                id: id.to_string(),
                members: members.iter().map(|m| m.parse().unwrap()).collect(),
                rules,
            },
        );
        model
    }

    #[test]
    fn security_group_source_expands_to_member_hosts() {
        let model = model_with_group("web", &["192.0.2.1", "192.0.2.2"], vec![]);
        let rule = RuleBuilder::default()
            .direction(Direction::Inbound)
            .protocol(Protocol::Tcp)
            .security_group(Some("web".to_string()))
            .ports(Some(PortRange { start: 22, end: 22 }))
            .build()
            .unwrap();
        assert_eq!(
            compile_rule(&rule, &model).unwrap(),
            "( src host 192.0.2.1 or src host 192.0.2.2) and tcp dst port 22"
        );
    }

    #[traced_test]
    #[test]
    fn empty_security_group_warns_and_drops_the_rule() {
        let model = model_with_group("empty", &[], vec![]);
        let rule = RuleBuilder::default()
            .direction(Direction::Inbound)
            .security_group(Some("empty".to_string()))
            .build()
            .unwrap();
        assert!(compile_rule(&rule, &model).is_none());
        assert!(logs_contain("no member in security group empty"));
    }

    #[traced_test]
    #[test]
    fn unknown_security_group_errors_and_drops_the_rule() {
        let rule = RuleBuilder::default()
            .direction(Direction::Inbound)
            .security_group(Some("ghost".to_string()))
            .build()
            .unwrap();
        assert!(compile_rule(&rule, &Model::new()).is_none());
        assert!(logs_contain("security group ghost not available"));
    }

    #[test]
    fn group_filter_has_no_trailing_separator() {
        let keep = inbound_tcp("10.0.0.0/24", 80, 80);
        let dropped = RuleBuilder::default()
            .direction(Direction::Outbound)
            .cidr(Some("10.0.0.0/24".parse().unwrap()))
            .build()
            .unwrap();
        let sg = SecurityGroup {
            id: "mixed".to_string(),
            members: vec![],
            rules: vec![keep, dropped],
        };
        assert_eq!(
            security_group_filter(&sg, &Model::new()),
            "(src net 10.0.0.0/24 and tcp dst port 80)"
        );
    }

    fn nic_with(ips: &[&str], groups: &[&str]) -> Nic {
        NicBuilder::default()
            .id("n1")
            .mac("52:54:00:00:00:01".parse::<Mac>().unwrap())
            .vni(Vni::new(42).unwrap())
            .nic_type(NicType::VhostUserServer)
            .ip_list(
                ips.iter()
                    .map(|ip| ip.parse().unwrap())
                    .collect::<Vec<std::net::IpAddr>>(),
            )
            .security_groups(
                groups
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<String>>(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn outbound_stream_is_synthesized_from_addresses() {
        let nic = nic_with(&["192.0.2.5"], &[]);
        assert_eq!(
            outbound_filter(&nic),
            "(src host 192.0.2.5) || (src host 0.0.0.0 and dst host 255.255.255.255 and udp src port 68 and udp dst port 67)"
        );
    }

    #[test]
    fn outbound_stream_without_addresses_still_permits_dhcp() {
        let nic = nic_with(&[], &[]);
        assert_eq!(outbound_filter(&nic), DHCP_REQUEST_PERMIT);
    }

    #[test]
    fn inbound_stream_joins_security_groups() {
        let mut model = model_with_group(
            "web",
            &["192.0.2.1"],
            vec![inbound_tcp("10.0.0.0/24", 80, 80)],
        );
        model.security_groups.insert(
            "ssh".to_string(),
            SecurityGroup {
                id: "ssh".to_string(),
                members: vec![],
                rules: vec![inbound_tcp("0.0.0.0/0", 22, 22)],
            },
        );
        let nic = nic_with(&[], &["web", "ssh", "missing"]);
        assert_eq!(
            inbound_filter(&nic, &model),
            "((src net 10.0.0.0/24 and tcp dst port 80))||((ip and tcp dst port 22))"
        );
    }
}
