pub mod connect;
pub mod forward;
