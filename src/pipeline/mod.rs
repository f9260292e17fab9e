pub mod batch_extraction; // Worker/writer pools, checkpoint, reporting
pub mod extraction; // Per-file BOM table extraction
