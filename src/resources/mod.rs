//! Typed views of the resources the admission engine reads and rewrites.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `workload` | Deployment / StatefulSet / DaemonSet behind one enum |
//! | `custom` | Partial storage-engine and tenant-policy custom resources |

pub mod custom;
pub mod workload;

pub use custom::{LonghornNode, VirtualClusterPolicy};
pub use workload::{Workload, WorkloadKind};
