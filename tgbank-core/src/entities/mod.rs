pub mod applied_deposit;
pub mod user;
pub mod virtual_account;

pub use applied_deposit::{AppliedDeposit, NewAppliedDeposit};
pub use user::{NewUser, User, UserRelation};
pub use virtual_account::VirtualAccount;
