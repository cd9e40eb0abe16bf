//! Credential verification and session engine.
//!
//! [`services::SessionManager`] logs users in, validates bearer tokens and
//! revokes sessions over two stores: PostgreSQL holds the truth, Redis holds
//! a TTL-bound copy for fast validation.

pub mod clock;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use services::{
    AccountService, AuthError, CredentialVerifier, ExpirySweeper, LoginOutcome, SessionManager,
    ValidatedSession,
};
