pub mod async_msg;
pub mod clock;
