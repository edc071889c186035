mod helpers;

mod config_store;
mod lifecycle;
mod session;
