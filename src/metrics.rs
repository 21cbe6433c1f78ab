use crate::snapshot::AssetFailure;

#[derive(Debug, Clone, Default)]
pub struct PageMetrics {
    pub page_number: usize,
    pub raster_ms: f64,
    pub slice_count: usize,
    pub bitmap_width: u32,
    pub bitmap_height: u32,
    // 1.0 unless the page had to be shrunk to fit the usable height.
    pub shrink_factor: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ExportMetrics {
    pub pages: Vec<PageMetrics>,
    pub plan_ms: f64,
    pub total_raster_ms: f64,
    pub serialize_ms: f64,
    pub total_bytes: usize,
    pub asset_failures: Vec<AssetFailure>,
}

impl ExportMetrics {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn shrunk_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.shrink_factor < 1.0).count()
    }
}
