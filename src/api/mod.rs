// =============================================================================
// Read-only HTTP surface
// =============================================================================

pub mod rest;

pub use rest::router;
