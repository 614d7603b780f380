pub mod async_utils;
pub mod logging;
