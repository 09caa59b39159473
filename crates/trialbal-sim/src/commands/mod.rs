use std::error::Error;

use trialbal_exp::{AllocationService, HttpAllocationService, LocalAllocationService};

pub mod plan;
pub mod query;
pub mod smoke;
pub mod sweep;

/// HTTP client when `server` is given, otherwise the in-process service.
pub fn connect(server: Option<&str>) -> Result<Box<dyn AllocationService>, Box<dyn Error>> {
    Ok(match server {
        Some(url) => Box::new(HttpAllocationService::new(url)?),
        None => Box::new(LocalAllocationService::new()),
    })
}
