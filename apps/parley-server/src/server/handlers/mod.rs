pub(crate) mod auth;
pub(crate) mod rooms;
pub(crate) mod uploads;
pub(crate) mod users;

pub(crate) use auth::*;
pub(crate) use rooms::*;
pub(crate) use uploads::*;
pub(crate) use users::*;
