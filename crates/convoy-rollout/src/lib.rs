//! Convoy Rollout - Strategies that swap the running container
//!
//! Both strategies implement the same [`Deployer`] contract: given an
//! artifact and a target, either the new image ends up serving on the
//! application port with its health confirmed, or the previous state is
//! restored and the outcome says so.
//!
//! - [`RollingDeployer`] starts the candidate on a side port, health
//!   checks it, promotes it into place, and drains through a second
//!   confirmation window.
//! - [`CanaryDeployer`] adds weighted-traffic stages between start and
//!   promotion, watching error rates across both servers and aborting
//!   back to the saved upstream configuration byte-for-byte.
//!
//! Strategies never write deployment records; the coordinator owns those.
//! They speak to the world through `RemoteExecutor` scripts (idempotent
//! per command id) and `HealthProber` samples, and narrate through the
//! event sink.

#![deny(unsafe_code)]

mod canary;
mod config;
mod context;
mod deployer;
mod rolling;
pub mod scripts;
mod window;

pub use canary::CanaryDeployer;
pub use config::{CanaryConfig, CanaryStage, DeployConfig};
pub use context::RolloutContext;
pub use deployer::{create_deployer, DeployError, DeployOutcome, DeployRequest, Deployer, Result};
pub use rolling::RollingDeployer;
pub use window::run_confirmation_window;
