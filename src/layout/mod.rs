pub mod viewport;

pub use viewport::{GridLayout, RenderedItem, ViewportEstimate, ViewportEstimator, ViewportMetrics};
