//! Plan-driven demo collaborators.
//!
//! Each scenario provides an [`ItemHandler`](crate::pipeline::ItemHandler)
//! whose external call replays a per-item [`CallPlan`] of canned responses,
//! plus the sample items and pipeline settings of the scenario. The pipeline
//! core never sees the plans.

pub mod orders;
pub mod plan;
pub mod uploads;

pub use orders::{order_config, sample_orders, Order, OrderHandler, ORDER_TIMINGS};
pub use plan::{CallPlan, PlannedResponse, SimTimings, SimulatedService};
pub use uploads::{sample_uploads, upload_config, UploadHandler, UploadRequest, UPLOAD_TIMINGS};
