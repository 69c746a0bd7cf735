pub mod account;
pub mod catalog;
pub mod keygen;
pub mod server;
pub mod site;
