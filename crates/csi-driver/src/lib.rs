//! CSI driver for Civo block volumes.
//!
//! The driver is one long-running process serving the CSI Identity,
//! Controller and Node services over a Unix domain socket. The
//! controller half drives the provider's asynchronous volume state
//! machine (create, attach, detach, resize, snapshot); the node half
//! formats and mounts the attached block devices on the host. A
//! background reconciler cleans up provider volumes that lost their
//! PersistentVolume, and a `pre-stop` hook blocks node shutdown until
//! the orchestrator has detached everything.

pub mod config;
pub mod controller;
pub mod driver;
pub mod hook;
pub mod identity;
pub mod node;
pub mod plugger;
pub mod reconciler;

pub use config::DriverConfig;
pub use driver::Driver;
pub use hook::PreStopHook;

/// Name the driver registers with the orchestrator.
pub const DRIVER_NAME: &str = "csi.civo.com";

/// The current release of the driver.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How many bytes are in a gigabyte. The provider stores volume sizes
/// in whole gigabytes; every byte value crossing the CSI boundary is a
/// multiple of this.
pub const BYTES_PER_GIGABYTE: i64 = 1024 * 1024 * 1024;

/// Size in gigabytes of a volume when the request does not specify one.
pub const DEFAULT_VOLUME_SIZE_GB: i64 = 10;

/// The maximum number of volumes a single node may host.
pub const MAX_VOLUMES_PER_NODE: i64 = 1024;
