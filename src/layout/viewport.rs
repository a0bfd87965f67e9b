use std::collections::HashMap;

use crate::config::ViewportConfig;
use crate::models::{ImageId, ImageRecord};

/// Scroll container geometry in CSS pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ViewportMetrics {
    pub scroll_top: f32,
    pub client_height: f32,
    pub client_width: f32,
}

impl ViewportMetrics {
    fn is_finite(&self) -> bool {
        self.scroll_top.is_finite() && self.client_height.is_finite() && self.client_width.is_finite()
    }
}

/// A grid cell as currently laid out by the view, in content coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedItem {
    pub id: ImageId,
    pub top: f32,
    pub bottom: f32,
}

/// What the estimator knows about the grid.
#[derive(Debug, Clone, Copy)]
pub enum GridLayout<'a> {
    Columns(usize),
    /// Column count unknown; use the cells the view has rendered.
    Measured(&'a [RenderedItem]),
}

/// Index range `[start, end)` of likely visible records plus their ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewportEstimate {
    pub start: usize,
    pub end: usize,
    pub visible_ids: Vec<ImageId>,
}

impl ViewportEstimate {
    pub fn is_empty(&self) -> bool {
        self.visible_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.visible_ids.len()
    }
}

/// Computes the priority range of a uniform image grid.
///
/// Item width is `(width - gap × (columns - 1)) / columns`, item height is
/// `width × aspect_ratio` and rows are `height + gap` apart. The visible row
/// range is widened by `overscan_rows` on both sides.
#[derive(Debug, Clone)]
pub struct ViewportEstimator {
    pub gap: f32,
    pub aspect_ratio: f32,
    pub overscan_rows: usize,
}

impl Default for ViewportEstimator {
    fn default() -> Self {
        Self::from_config(&ViewportConfig::default())
    }
}

impl ViewportEstimator {
    pub fn from_config(config: &ViewportConfig) -> Self {
        Self {
            gap: config.gap_px.max(0.0),
            aspect_ratio: config.aspect_ratio,
            overscan_rows: config.overscan_rows,
        }
    }

    pub fn estimate(
        &self,
        metrics: ViewportMetrics,
        records: &[ImageRecord],
        layout: GridLayout<'_>,
    ) -> ViewportEstimate {
        if records.is_empty() || !metrics.is_finite() {
            return ViewportEstimate::default();
        }
        match layout {
            GridLayout::Columns(columns) if columns > 0 => self.by_columns(metrics, records, columns),
            GridLayout::Columns(_) => ViewportEstimate::default(),
            GridLayout::Measured(rendered) => self.by_measurement(metrics, records, rendered),
        }
    }

    /// Row pitch for `columns` at `width`, or `None` when the grid is degenerate.
    pub fn row_height(&self, width: f32, columns: usize) -> Option<f32> {
        if columns == 0 || !width.is_finite() || width <= 0.0 {
            return None;
        }
        let gaps = self.gap * (columns - 1) as f32;
        let item_width = ((width - gaps) / columns as f32).max(1.0);
        let row = item_width * self.aspect_ratio.max(0.01) + self.gap;
        (row.is_finite() && row > 0.0).then_some(row)
    }

    fn by_columns(&self, metrics: ViewportMetrics, records: &[ImageRecord], columns: usize) -> ViewportEstimate {
        let Some(row_height) = self.row_height(metrics.client_width, columns) else {
            return ViewportEstimate::default();
        };
        let top = metrics.scroll_top.max(0.0);
        let bottom = top + metrics.client_height.max(0.0);

        let first_row = ((top / row_height).floor() as usize).saturating_sub(self.overscan_rows);
        // Float to usize casts saturate, so huge extents land on usize::MAX.
        let last_row = ((bottom / row_height).ceil() as usize).saturating_add(self.overscan_rows);

        let start = first_row.saturating_mul(columns).min(records.len());
        let end = last_row.saturating_mul(columns).min(records.len());
        ViewportEstimate {
            start,
            end,
            visible_ids: records[start..end].iter().map(|r| r.id.clone()).collect(),
        }
    }

    fn by_measurement(
        &self,
        metrics: ViewportMetrics,
        records: &[ImageRecord],
        rendered: &[RenderedItem],
    ) -> ViewportEstimate {
        if rendered.is_empty() {
            return ViewportEstimate::default();
        }
        let avg_height = rendered.iter().map(|r| (r.bottom - r.top).max(0.0)).sum::<f32>() / rendered.len() as f32;
        let overscan = (avg_height + self.gap) * self.overscan_rows as f32;
        let band_top = metrics.scroll_top - overscan;
        let band_bottom = metrics.scroll_top + metrics.client_height + overscan;

        let index: HashMap<&ImageId, usize> = records.iter().enumerate().map(|(i, r)| (&r.id, i)).collect();
        let mut hits: Vec<usize> = rendered
            .iter()
            .filter(|item| item.bottom >= band_top && item.top <= band_bottom)
            .filter_map(|item| index.get(&item.id).copied())
            .collect();
        hits.sort_unstable();
        hits.dedup();

        let (Some(&first), Some(&last)) = (hits.first(), hits.last()) else {
            return ViewportEstimate::default();
        };
        ViewportEstimate {
            start: first,
            end: last + 1,
            visible_ids: hits.iter().map(|&i| records[i].id.clone()).collect(),
        }
    }
}
