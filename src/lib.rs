pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod embedding;
pub mod engine;
pub mod index;
pub mod monitor;
pub mod privacy;
pub mod protocol;
mod schema;
pub mod store;
mod util;

pub const GIT_VERSION: &str = git_version::git_version!(fallback = "unknown");

lazy_static::lazy_static! {
    static ref MYHOSTNAME: String = util::getshorthostname();
}
