//! Cross-module and property tests for the rule algebra and node lifecycle

use crate::core::array::RuleArray;
use crate::core::backend::{PacketFilterBackend, Position};
use crate::core::iptables::IptablesBackend;
use crate::core::matches::{CtState, IcmpType, MatchKind, MatchParams, PortMatch};
use crate::core::memory::{BackendCall, MemoryBackend};
use crate::core::node::Node;
use crate::core::rule::{Chain, Family, Protocol, Rule, Table, Target};
use crate::core::test_helpers::{
    EnvVarGuard, input_port, lan_route, mock_calls, sample_node, write_mock_iptables,
};
use crate::core::topology::Topology;
use ipnetwork::{IpNetwork, Ipv4Network};
use proptest::prelude::*;
use std::net::Ipv4Addr;

// ═══════════════════════════════════════════════════════════════════════════
// Strategies
// ═══════════════════════════════════════════════════════════════════════════

prop_compose! {
    fn arb_net()(a in any::<u8>(), b in any::<u8>(), c in any::<u8>(), d in any::<u8>(), prefix in 8u8..=32) -> IpNetwork {
        IpNetwork::V4(Ipv4Network::new(Ipv4Addr::new(a, b, c, d), prefix).unwrap())
    }
}

fn arb_chain() -> impl Strategy<Value = Chain> {
    prop_oneof![
        Just(Chain::Input),
        Just(Chain::Output),
        Just(Chain::Forward),
        Just(Chain::Prerouting),
        Just(Chain::Postrouting),
        Just(Chain::User("ssh-in".to_string())),
    ]
}

fn arb_target() -> impl Strategy<Value = Target> {
    prop_oneof![
        Just(Target::Accept),
        Just(Target::Drop),
        Just(Target::Reject),
        Just(Target::Log),
    ]
}

fn arb_icmp() -> impl Strategy<Value = IcmpType> {
    prop_oneof![
        Just(IcmpType::EchoRequest),
        Just(IcmpType::EchoReply),
        Just(IcmpType::DestinationUnreachable),
        Just(IcmpType::TimeExceeded),
    ]
}

prop_compose! {
    fn arb_ports()(sport in proptest::option::of(1u16..=65535), dport in proptest::option::of(1u16..=65535)) -> PortMatch {
        PortMatch {
            sport: sport.map(Into::into),
            dport: dport.map(Into::into),
        }
    }
}

prop_compose! {
    /// IPv4-only rules so any two of them combine without a family conflict
    fn arb_rule()(
        chain in proptest::option::of(arb_chain()),
        target in proptest::option::of(arb_target()),
        src in proptest::option::of(arb_net()),
        dst in proptest::option::of(arb_net()),
        in_interface in proptest::option::of(prop_oneof![Just("eth0"), Just("lo")]),
        out_interface in proptest::option::of(prop_oneof![Just("eth1"), Just("wg0")]),
        tcp in proptest::option::of(arb_ports()),
        icmp in proptest::option::of(arb_icmp()),
        ctstate in any::<bool>(),
    ) -> Rule {
        let mut rule = Rule {
            chain,
            target,
            src,
            dst,
            in_interface: in_interface.map(str::to_string),
            out_interface: out_interface.map(str::to_string),
            ..Rule::default()
        };
        if let Some(ports) = tcp {
            rule = rule.with_match(MatchParams::Tcp(ports));
        }
        if let Some(icmp_type) = icmp {
            rule = rule.icmp_type(icmp_type);
        }
        if ctstate {
            rule = rule.ctstate(&[CtState::Established]);
        }
        rule
    }
}

fn arb_array() -> impl Strategy<Value = RuleArray> {
    proptest::collection::vec(arb_rule(), 0..6).prop_map(RuleArray::from)
}

proptest! {
    #[test]
    fn test_flip_is_an_involution(rule in arb_rule()) {
        prop_assert_eq!(rule.flipped().flipped(), rule);
    }

    #[test]
    fn test_combine_with_empty_is_identity(rule in arb_rule()) {
        prop_assert_eq!(rule.combine(&Rule::new()).unwrap(), rule.clone());
        prop_assert_eq!(Rule::new().combine(&rule).unwrap(), rule);
    }

    #[test]
    fn test_combine_keeps_left_fields(a in arb_rule(), b in arb_rule()) {
        let merged = a.combine(&b).unwrap();
        if a.chain.is_some() {
            prop_assert_eq!(&merged.chain, &a.chain);
        } else {
            prop_assert_eq!(&merged.chain, &b.chain);
        }
        if a.target.is_some() {
            prop_assert_eq!(&merged.target, &a.target);
        }
        if a.src.is_some() {
            prop_assert_eq!(merged.src, a.src);
        }
        if let Some(ports) = a.matches.get(&MatchKind::Tcp) {
            let MatchParams::Tcp(left) = ports else { unreachable!() };
            let Some(MatchParams::Tcp(kept)) = merged.matches.get(&MatchKind::Tcp) else {
                unreachable!()
            };
            if left.dport.is_some() {
                prop_assert_eq!(kept.dport, left.dport);
            }
        }
    }

    #[test]
    fn test_general_subsumes_its_specialisation(general in arb_rule(), extra in arb_rule()) {
        let specific = general.combine(&extra).unwrap();
        prop_assert!(general.subsumes(&specific));
        prop_assert!(Rule::new().subsumes(&specific));
    }

    #[test]
    fn test_cross_cardinality(x in arb_array(), y in arb_array()) {
        prop_assert_eq!(x.cross(&y).unwrap().len(), x.len() * y.len());
    }

    #[test]
    fn test_topology_expansion(forward in arb_array(), reverse in arb_array(), rule in arb_rule()) {
        let topology = Topology::new(forward, reverse);
        prop_assert_eq!(topology.compose_rule(&rule).unwrap().len(), topology.len());
    }

    #[test]
    fn test_symmetric_topology_doubles_array(forward in arb_array(), array in arb_array()) {
        let topology = Topology::symmetric(forward.clone());
        prop_assert_eq!(
            topology.compose_array(&array).unwrap().len(),
            2 * forward.len() * array.len()
        );
    }

    #[test]
    fn test_diff_undoes_combine_for_disjoint_keys(
        chain in arb_chain(),
        target in arb_target(),
        src in arb_net(),
        ports in arb_ports(),
    ) {
        let a = Rule::new().with_chain(chain).with_target(target);
        let b = Rule::new().with_src(src).with_match(MatchParams::Udp(ports));
        prop_assert_eq!(a.combine(&b).unwrap().diff(&b), a);
    }

    #[test]
    fn test_head_insert_preserves_order(ports in proptest::collection::vec(1u16..=65535, 1..8)) {
        let mut node = Node::new("ponos");
        let rules: RuleArray = ports.iter().map(|p| input_port(*p)).collect();
        node.add_rules(&rules, false).unwrap();

        let mut backend = MemoryBackend::new();
        prop_assert!(node.start(&mut backend, Some(Position::HEAD)).is_success());
        prop_assert_eq!(
            backend.rules(Family::Ipv4, Table::Filter, &Chain::Input),
            node.rules().clone()
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_route_app_topology_scenario() {
    let topology = Topology::new(
        Rule::new().with_chain(Chain::Output).into(),
        Rule::new().with_chain(Chain::Input).into(),
    );
    let fragment = Rule::new().tcp_dport(22).combine(&lan_route().rule()).unwrap();

    let rules = topology.compose_rule(&fragment).unwrap();
    assert_eq!(rules.len(), 2);

    assert_eq!(
        rules[0],
        Rule::new()
            .with_chain(Chain::Output)
            .with_src("192.168.1.10/32".parse().unwrap())
            .with_dst("192.168.1.1/32".parse().unwrap())
            .tcp_dport(22)
    );
    assert_eq!(
        rules[1],
        Rule::new()
            .with_chain(Chain::Input)
            .with_src("192.168.1.1/32".parse().unwrap())
            .with_dst("192.168.1.10/32".parse().unwrap())
            .tcp_sport(22)
    );
}

#[test]
fn test_subsumption_scenario() {
    let general = Rule::new().with_protocol(Protocol::Tcp).tcp_dport(22);
    let specific = general
        .clone()
        .with_src("10.0.0.1/32".parse().unwrap())
        .with_chain(Chain::Input);
    let other = Rule::new().with_protocol(Protocol::Tcp).tcp_dport(23);

    assert!(general.subsumes(&specific));
    assert!(!general.subsumes(&other));
}

#[test]
fn test_combine_precedence_scenario() {
    let merged = Rule::new().tcp_dport(22).combine(&Rule::new().tcp_dport(80)).unwrap();
    assert_eq!(
        merged.matches.get(&MatchKind::Tcp),
        Some(&MatchParams::Tcp(PortMatch::dport(22)))
    );
}

#[test]
fn test_multi_hop_composition() {
    // client -> gateway (forwarding) -> server
    let client = Topology::symmetric(Rule::new().with_chain(Chain::Output).into());
    let gateway = Topology::symmetric(Rule::new().with_chain(Chain::Forward).into());
    let path = client.compose_topology(&gateway).unwrap();

    assert_eq!(path.forward.len(), 2);
    assert_eq!(path.reverse.len(), 2);
    // Left side wins placement, right side only fills gaps
    assert!(path.forward.iter().all(|r| r.chain == Some(Chain::Output)));
    assert!(path.reverse.iter().all(|r| r.chain == Some(Chain::Input)));
}

#[test]
fn test_panic_scenario_on_loaded_node() {
    let mut node = sample_node();
    let mut backend = MemoryBackend::new();
    node.start(&mut backend, None);
    node.set_policy(&mut backend);

    let report = node.panic(&mut backend);
    assert!(report.is_success(), "{report}");
    for family in [Family::Ipv4, Family::Ipv6] {
        for chain in Table::Filter.builtin_chains() {
            assert_eq!(
                backend.policy(family, Table::Filter, chain),
                Some(Target::Drop)
            );
        }
    }
    assert!(backend.all_rules().is_empty());
}

#[test]
fn test_head_insert_call_order() {
    let mut node = Node::new("ponos");
    let rules: RuleArray = [22, 80, 443].into_iter().map(input_port).collect();
    node.add_rules(&rules, false).unwrap();

    let mut backend = MemoryBackend::new();
    node.start(&mut backend, Some(Position::HEAD));

    let issued: Vec<u16> = backend
        .calls()
        .iter()
        .filter_map(|call| match call {
            BackendCall::Install { rule, .. } => match rule.matches.get(&MatchKind::Tcp) {
                Some(MatchParams::Tcp(PortMatch {
                    dport: Some(port), ..
                })) => Some(port.start),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(issued, vec![443, 80, 22]);
}

#[test]
fn test_backend_matches_finds_installed_flows() {
    let mut node = sample_node();
    let mut backend = MemoryBackend::new();
    node.start(&mut backend, None);

    let ssh = Rule::new().with_protocol(Protocol::Tcp).tcp_dport(22);
    let found = backend.matches(&ssh).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].chain, Some(Chain::Input));

    let found_again = backend.matches(&ssh).unwrap();
    assert_eq!(found, found_again);
}

#[test]
fn test_lock_keeps_only_survivors_and_final_rules() {
    let mut node = sample_node();
    let mut backend = MemoryBackend::new();
    node.start(&mut backend, None);
    assert!(node.lock(&mut backend).is_success());

    let installed = backend.all_rules();
    assert_eq!(installed.len(), node.lock_rules().len() + node.final_rules().len());
    let http = Rule::new().tcp_dport(80);
    assert_eq!(installed.matching(&http).count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// iptables backend against a stand-in program
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_iptables_backend_issues_expected_commands() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_mock_iptables(dir.path(), "-P INPUT ACCEPT\n-N ssh-in\n");
    let mut backend = IptablesBackend::new(program.display().to_string(), "/nonexistent/ip6tables");

    let rule = input_port(22).resolved().unwrap();
    backend.install(&rule, Position::HEAD).unwrap();
    assert!(!backend.exists(&rule).unwrap());
    assert_eq!(
        backend.chains(Family::Ipv4, Table::Filter).unwrap(),
        vec![Chain::Input, Chain::User("ssh-in".to_string())]
    );

    let calls = mock_calls(dir.path());
    assert_eq!(
        calls[0],
        "-t filter -I INPUT 1 -p tcp -m tcp --dport 22 -j ACCEPT"
    );
    assert!(calls[1].starts_with("-t filter -C INPUT"));
    assert_eq!(calls[2], "-t filter -S");
}

#[test]
fn test_panic_through_iptables_backend() {
    let dir = tempfile::tempdir().unwrap();
    let program = write_mock_iptables(
        dir.path(),
        "-P INPUT ACCEPT\n-P FORWARD ACCEPT\n-P OUTPUT ACCEPT\n-N scratch\n",
    );
    let program = program.display().to_string();
    let mut backend = IptablesBackend::new(program.clone(), program).with_wait(false);

    let report = Node::new("ponos").panic(&mut backend);
    assert!(report.is_success(), "{report}");

    let calls = mock_calls(dir.path());
    assert!(calls.contains(&"-t filter -X scratch".to_string()));
    assert!(calls.contains(&"-t filter -P INPUT DROP".to_string()));
    // listing, 4 flushes, 1 delete, 3 policies, per family
    assert_eq!(calls.len(), 2 * 9);
}

#[test]
fn test_env_guard_restores_variable_after_panic() {
    const KEY: &str = "BALEFUL_TEST_GUARD";
    let result = std::panic::catch_unwind(|| {
        let _env = EnvVarGuard::set(KEY, "leaked");
        panic!("test body failed");
    });
    assert!(result.is_err());

    // Lock is still usable after the poisoning panic
    let _env = EnvVarGuard::set("BALEFUL_TEST_GUARD_OTHER", "x");
    assert!(std::env::var_os(KEY).is_none());
}

#[test]
fn test_iptables_env_override() {
    let _env = EnvVarGuard::set("BALEFUL_IPTABLES", "/usr/sbin/iptables-legacy");
    let backend = IptablesBackend::from_config(&crate::config::AppConfig::default());

    assert_eq!(backend.program(Family::Ipv4), "/usr/sbin/iptables-legacy");
    assert_eq!(
        backend.program(Family::Ipv6),
        crate::core::iptables::DEFAULT_IP6TABLES
    );
}
