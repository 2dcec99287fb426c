pub mod api;
pub mod disks;
pub mod logger;
pub mod migrations;
pub mod poller;
pub mod pool;
pub mod provider_errors;
pub mod provisioner;
pub mod registry;
pub mod settings;
