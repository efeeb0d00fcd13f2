#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;

pub mod types;
pub(crate) mod util;
pub mod acme;
pub mod ca;
pub mod config;
pub mod enroller;
pub mod lifecycle;
pub mod server;
pub mod validator;
