//! Isolation layer: jail roots, network wrapping and host capabilities
//!
//! This module decides *where* and *how* an untrusted command runs: the directory it
//! is confined to, which path prefixes are exempt from jail checks, whether it gets a
//! private network namespace, and whether the host can run it natively at all.
//!
//! # Features
//!
//! - **Jail validation**: absolute, existing, non-root directories only
//! - **Whitelist**: component-wise prefix matching for exempt paths
//! - **Network isolation**: wraps the command in a namespace-isolating invocation
//! - **Host platform**: native descriptor introspection vs. compatibility shim
//! - **Jail preparation**: pluggable collaborator run before launch
//!
//! # Examples
//!
//! ```ignore
//! use jailwatch::isolation::{JailConfig, Whitelist};
//!
//! let jail = JailConfig::validate("/srv/jail", Whitelist::default())?;
//! assert!(jail.contains(std::path::Path::new("/srv/jail/out.txt")));
//! ```

pub mod jail;
pub mod network;
pub mod prepare;
pub use jail::{JailConfig, PathClass, Whitelist, DEFAULT_WHITELIST};
pub use network::{HostPlatform, NetworkIsolation};
pub use prepare::{CommandJailPreparer, DirectoryJailPreparer, JailPreparer, PreparationReport};

#[cfg(test)]
mod tests;
