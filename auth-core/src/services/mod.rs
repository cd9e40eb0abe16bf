pub mod account;
pub mod error;
pub mod session;
pub mod sweeper;
pub mod token;
pub mod verifier;

pub use account::AccountService;
pub use error::AuthError;
pub use session::{HealthReport, LoginOutcome, SessionManager, ValidatedSession};
pub use sweeper::ExpirySweeper;
pub use token::SessionToken;
pub use verifier::{CredentialVerifier, SecondFactorEnrollment};
