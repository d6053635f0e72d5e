pub mod host;
pub mod protocol;
pub mod server;
pub mod tracker;
pub mod util;

#[cfg(test)]
pub mod test_util;
