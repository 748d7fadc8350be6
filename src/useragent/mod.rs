mod useragent;
pub use useragent::{UserAgent, UserAgentBuilder};
mod invitation;
mod registration;
#[cfg(test)]
mod tests;
