pub mod session;
pub mod user;

pub use session::{CachedSession, ClientMeta, Session};
pub use user::{
    normalize_email, Address, Credentials, LoginRecord, NewAddress, NewProfile, NewUser, Profile,
    User,
};
