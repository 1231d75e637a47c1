//! baleful - compositional iptables policy engine
//!
//! Policies are assembled from small rule fragments (applications, addresses,
//! hops on the client/server path) with a rule algebra, then installed and torn
//! down per host through a pluggable packet-filter backend.
//!
//! # Architecture
//!
//! - [`core`] - Rule algebra, node lifecycle, backends and profiles
//! - [`library`] - Named application and hop fragments
//! - [`audit`] - Audit logging for all privileged operations
//! - [`validators`] - Input validation
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Example
//!
//! ```
//! use baleful::core::memory::MemoryBackend;
//! use baleful::core::node::Node;
//! use baleful::library::{App, Hop};
//!
//! let mut node = Node::new("ponos");
//! let ssh = Hop::Server.topology().compose_array(&App::Ssh.rules()).unwrap();
//! node.add_rules(&ssh, true).unwrap();
//!
//! let mut backend = MemoryBackend::new();
//! assert!(node.start(&mut backend, None).is_success());
//! assert!(node.lock(&mut backend).is_success());
//! ```

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod library;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::array::RuleArray;
pub use core::error::{Error, Result};
pub use core::node::Node;
pub use core::rule::Rule;
pub use core::topology::Topology;
