//! GreenGrid slice manager — fractional GPU partitions on underutilized
//! nodes.
//!
//! When a multi-instance-capable node drops below the low-utilization
//! threshold, its spare compute fraction is packed with MIG profiles
//! (largest first) and offered as placement fallback targets. When
//! utilization climbs back, unallocated slices are reclaimed; at critical
//! utilization, allocated slices surface pending migrations so the monitor
//! can move their workloads before the slice is released. A running
//! workload is never dropped by the slice layer itself.

pub mod manager;

pub use manager::{
    AutoManageReport, PendingSliceMigration, SliceConfig, SliceError, SliceManager, SliceResult,
};
