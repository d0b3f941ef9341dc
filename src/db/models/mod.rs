//! Database models split into separate files, re-exported so call sites can
//! import `crate::db::models::*`.

pub mod attempt;
pub mod check_in;
pub mod contact;
pub mod journey;
pub mod notification_task;
pub mod user;

pub use self::attempt::*;
pub use self::check_in::*;
pub use self::contact::*;
pub use self::journey::*;
pub use self::notification_task::*;
pub use self::user::*;
