pub mod batch;
pub mod event;
pub mod face;

pub use batch::{gallery_link, Batch, BatchCounts, BatchHandle, BatchStatus, DecodeStatus, Stage, StageCounts, StagedImage};
pub use event::{Caller, Event, Role};
pub use face::{BoundingBox, Embedding, FaceCandidate, FaceDetection, IndexEntry, PhotoMatch, QueryMatch};
