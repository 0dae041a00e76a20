mod config_cmd;

pub use config_cmd::ConfigCommand;
