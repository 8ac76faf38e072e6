//! Installs the Trident operator and drives the TridentOrchestrator it
//! manages to a running Trident.
//!
//! The cluster is reached through the narrow traits in [`client`], so the
//! [`Installer`] can run against a live API server or against mocks.

#![deny(missing_docs)]

pub mod client;
pub mod configure;
mod exec;
pub mod images;
pub mod installer;
pub mod manifests;
pub mod target;

pub use client::ClusterClients;
pub use installer::{Installer, InstallerOptions};
pub use target::InstallTarget;
