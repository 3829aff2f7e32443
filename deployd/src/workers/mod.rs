pub mod deployer;
pub mod lease_sweeper;
