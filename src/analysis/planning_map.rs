//! Planning-map rasterization: renders junction recommendation icons over
//! the network's node layout into a PNG. Deliberately a thin, swappable
//! trait boundary — the Analysis Worker's decision logic never depends on
//! how (or whether) the image gets drawn.

use std::path::Path;

use plotters::prelude::*;

use super::warrants::Recommendation;
use crate::telemetry::geometry::NodeGeom;

pub struct JunctionMarker {
    pub position: (f64, f64),
    pub recommendation: Recommendation,
}

pub trait PlanningMapRenderer {
    fn render(&self, nodes: &[NodeGeom], markers: &[JunctionMarker], out_path: &Path) -> anyhow::Result<()>;
}

pub struct BitmapPlanningMapRenderer;

impl PlanningMapRenderer for BitmapPlanningMapRenderer {
    fn render(&self, nodes: &[NodeGeom], markers: &[JunctionMarker], out_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (min_x, max_x, min_y, max_y) = bounds(nodes);
        let root = BitMapBackend::new(out_path, (1024, 768)).into_drawing_area();
        root.fill(&WHITE)?;

        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .build_cartesian_2d(min_x..max_x, min_y..max_y)?;
        chart.configure_mesh().disable_mesh().draw()?;

        chart.draw_series(
            nodes
                .iter()
                .map(|n| Circle::new((n.x, n.y), 2, BLACK.filled())),
        )?;

        for marker in markers {
            let color = match marker.recommendation {
                Recommendation::Add => GREEN,
                Recommendation::Remove => RED,
                Recommendation::Keep => BLUE,
            };
            chart.draw_series(std::iter::once(Circle::new(
                marker.position,
                6,
                color.filled(),
            )))?;
        }

        root.present()?;
        Ok(())
    }
}

fn bounds(nodes: &[NodeGeom]) -> (f64, f64, f64, f64) {
    if nodes.is_empty() {
        return (0.0, 1.0, 0.0, 1.0);
    }
    let mut min_x = f64::MAX;
    let mut max_x = f64::MIN;
    let mut min_y = f64::MAX;
    let mut max_y = f64::MIN;
    for n in nodes {
        min_x = min_x.min(n.x);
        max_x = max_x.max(n.x);
        min_y = min_y.min(n.y);
        max_y = max_y.max(n.y);
    }
    // pad so markers at the extremes aren't drawn on the chart edge
    let pad_x = (max_x - min_x).max(1.0) * 0.05;
    let pad_y = (max_y - min_y).max(1.0) * 0.05;
    (min_x - pad_x, max_x + pad_x, min_y - pad_y, max_y + pad_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_without_error_for_empty_topology() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("map.png");
        let renderer = BitmapPlanningMapRenderer;
        renderer.render(&[], &[], &out).unwrap();
        assert!(out.exists());
    }
}
