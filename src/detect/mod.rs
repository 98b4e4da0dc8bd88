mod backend;
pub mod backends;
mod filter;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{ScriptedBackend, ScriptedDetection};
pub use filter::{DetectionFilter, DEFAULT_MIN_CONFIDENCE};
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{coco_label, BatchSummary, Detection, DetectionBatch, VEHICLE_CLASS_IDS};
