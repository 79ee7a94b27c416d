// Frame cropping pipeline: topic selection, region extraction, output assembly

pub mod assemble;
pub mod crop;
pub mod geometry;
pub mod topics;
pub mod types;
pub mod worker;
