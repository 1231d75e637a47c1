//! Named application and topology fragments
//!
//! Applications describe the client→server side of a protocol (ports, ICMP
//! types) without any placement. Hops describe where a host sits on the path
//! (client, server, router, …) as a [`Topology`]. Policies are built by
//! composing the two:
//!
//! ```
//! use baleful::library::{App, Hop};
//!
//! let ssh_server = Hop::Server.topology().compose_array(&App::Ssh.rules()).unwrap();
//! assert_eq!(ssh_server.len(), 2);
//! ```

use crate::core::array::RuleArray;
use crate::core::matches::{CtState, IcmpType, PortRange};
use crate::core::rule::{Chain, Protocol, Rule};
use crate::core::topology::Topology;

/// Application fragments keyed by protocol name
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum App {
    Ssh,
    Dns,
    Http,
    Https,
    Ntp,
    Smtp,
    Imap,
    Imaps,
    Nfs,
    Ping,
    Ping6,
    Dhcp,
}

fn tcp(port: impl Into<PortRange>) -> Rule {
    Rule::new().with_protocol(Protocol::Tcp).tcp_dport(port)
}

fn udp(port: impl Into<PortRange>) -> Rule {
    Rule::new().with_protocol(Protocol::Udp).udp_dport(port)
}

impl App {
    pub fn description(self) -> &'static str {
        match self {
            App::Ssh => "Secure shell (tcp/22)",
            App::Dns => "Domain name lookups (udp/53, tcp/53)",
            App::Http => "Web (tcp/80)",
            App::Https => "Web over TLS (tcp/443)",
            App::Ntp => "Network time (udp/123)",
            App::Smtp => "Mail submission between servers (tcp/25)",
            App::Imap => "Mailbox access (tcp/143)",
            App::Imaps => "Mailbox access over TLS (tcp/993)",
            App::Nfs => "Network file system and portmapper (2049, 111)",
            App::Ping => "ICMP echo",
            App::Ping6 => "ICMPv6 echo",
            App::Dhcp => "Address configuration (udp/68 → udp/67)",
        }
    }

    /// Client→server fragments of the application
    pub fn rules(self) -> RuleArray {
        let rules = match self {
            App::Ssh => vec![tcp(22)],
            App::Dns => vec![udp(53), tcp(53)],
            App::Http => vec![tcp(80)],
            App::Https => vec![tcp(443)],
            App::Ntp => vec![udp(123)],
            App::Smtp => vec![tcp(25)],
            App::Imap => vec![tcp(143)],
            App::Imaps => vec![tcp(993)],
            App::Nfs => vec![tcp(2049), udp(2049), tcp(111), udp(111)],
            App::Ping => vec![
                Rule::new()
                    .with_protocol(Protocol::Icmp)
                    .icmp_type(IcmpType::EchoRequest),
            ],
            App::Ping6 => vec![
                Rule::new()
                    .with_protocol(Protocol::Ipv6Icmp)
                    .icmp6_type(IcmpType::EchoRequest),
            ],
            App::Dhcp => vec![udp(67).udp_sport(68)],
        };
        RuleArray::from(rules)
    }
}

/// Topology fragments keyed by the host's role on the path
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum Hop {
    /// Host opens the connection
    Client,
    /// Host accepts the connection
    Server,
    /// Host forwards between client and server
    Router,
    /// Client and server are both this host
    Loopback,
    StatefulClient,
    StatefulServer,
}

fn chain(chain: Chain) -> Rule {
    Rule::new().with_chain(chain)
}

impl Hop {
    pub fn description(self) -> &'static str {
        match self {
            Hop::Client => "Requests leave via OUTPUT, replies arrive via INPUT",
            Hop::Server => "Requests arrive via INPUT, replies leave via OUTPUT",
            Hop::Router => "Both directions pass through FORWARD",
            Hop::Loopback => "Both directions on the lo interface",
            Hop::StatefulClient => "Client allowing only new and established outbound, established inbound",
            Hop::StatefulServer => "Server allowing only new and established inbound, established outbound",
        }
    }

    pub fn topology(self) -> Topology {
        let new_or_established = [CtState::New, CtState::Established];
        match self {
            Hop::Client => Topology::symmetric(chain(Chain::Output).into()),
            Hop::Server => Topology::symmetric(chain(Chain::Input).into()),
            Hop::Router => Topology::symmetric(chain(Chain::Forward).into()),
            Hop::Loopback => {
                let lo = RuleArray::from(vec![
                    chain(Chain::Output).with_out_interface("lo"),
                    chain(Chain::Input).with_in_interface("lo"),
                ]);
                Topology::new(lo.clone(), lo)
            }
            Hop::StatefulClient => Topology::new(
                chain(Chain::Output).ctstate(&new_or_established).into(),
                chain(Chain::Input).ctstate(&[CtState::Established]).into(),
            ),
            Hop::StatefulServer => Topology::new(
                chain(Chain::Input).ctstate(&new_or_established).into(),
                chain(Chain::Output).ctstate(&[CtState::Established]).into(),
            ),
        }
    }
}
