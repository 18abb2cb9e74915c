//! LedgerCA server.
//!
//! A certificate authority for a permissioned network. Identities and
//! affiliations live in a registry backed by SQL or an LDAP directory;
//! enrollment turns a registered identity and a CSR into a signed
//! certificate, subject to a per-identity enrollment quota.
//!
//! The HTTP surface lives under `/api/v1`. Every request passes through
//! [`authn::authenticate`] before it reaches a handler.

pub mod api;
pub mod audit;
pub mod authn;
pub mod bootstrap;
pub mod ca;
pub mod certdb;
pub mod config;
pub mod db;
pub mod registry;
pub mod server;
pub mod tls;

pub use config::ServerConfig;
pub use server::{Server, ServerContext, ServerError};
