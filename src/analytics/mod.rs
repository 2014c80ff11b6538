//! Analytics builders: volatility surface, risk aggregation, greeks.

pub mod greeks;
pub mod risk_agg;
pub mod vol_surface;

pub use self::greeks::{time_to_expiry_years, IvSolverConfig, OptionGreeks};
pub use self::risk_agg::{build_risk, RiskAggConfig, RiskPayload, RiskRow};
pub use self::vol_surface::{build_surface, SurfacePayload, SurfaceRow, VolSurfaceConfig};

use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Parse comma-separated moneyness bucket edges (percent), sorted, deduped.
pub(crate) fn parse_bucket_edges(raw: &str, default: &str) -> Vec<f64> {
    let source = if raw.trim().is_empty() { default } else { raw };
    let mut edges: Vec<f64> = source
        .split(',')
        .filter_map(|p| p.trim().parse::<f64>().ok())
        .collect();
    edges.sort_by(|a, b| a.partial_cmp(b).unwrap());
    edges.dedup();
    edges
}

pub(crate) const DEFAULT_BUCKET_EDGES: &str = "-20,-10,-5,0,5,10,20";

/// Label for the bucket containing `moneyness_pct`: the first closed
/// `[edge_i,edge_{i+1}]` span, or an outer sentinel bucket.
pub(crate) fn bucket_label(moneyness_pct: f64, edges: &[f64]) -> Option<String> {
    if edges.is_empty() {
        return None;
    }
    for pair in edges.windows(2) {
        if pair[0] <= moneyness_pct && moneyness_pct <= pair[1] {
            return Some(format!("[{},{}]", pair[0], pair[1]));
        }
    }
    Some(if moneyness_pct < edges[0] {
        format!("<-inf,{}]", edges[0])
    } else {
        format!("[{},+inf)", edges[edges.len() - 1])
    })
}

/// Finite bucket labels in edge order (interpolation domain).
pub(crate) fn finite_bucket_labels(edges: &[f64]) -> Vec<String> {
    edges
        .windows(2)
        .map(|pair| format!("[{},{}]", pair[0], pair[1]))
        .collect()
}

/// Midpoint of a finite bucket label; sentinels return `None`.
pub(crate) fn bucket_midpoint(label: &str) -> Option<f64> {
    let inner = label.strip_prefix('[')?.strip_suffix(']')?;
    let (lo, hi) = inner.split_once(',')?;
    Some((lo.parse::<f64>().ok()? + hi.parse::<f64>().ok()?) / 2.0)
}

/// Persist a JSON artifact, optionally gzip'd. Returns the final path.
pub(crate) fn persist_json(
    dir: &str,
    filename: &str,
    payload: &str,
    compress: bool,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let base = Path::new(dir).join(filename);
    if compress {
        let gz_path = base.with_extension("json.gz");
        let file = std::fs::File::create(&gz_path)?;
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        encoder.write_all(payload.as_bytes())?;
        encoder.finish()?;
        Ok(gz_path)
    } else {
        std::fs::write(&base, payload)?;
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_parse_sorted_and_deduped() {
        let edges = parse_bucket_edges("5,-5,0,5", DEFAULT_BUCKET_EDGES);
        assert_eq!(edges, vec![-5.0, 0.0, 5.0]);
        let defaults = parse_bucket_edges("", DEFAULT_BUCKET_EDGES);
        assert_eq!(defaults.len(), 7);
    }

    #[test]
    fn bucket_assignment_covers_interior_and_sentinels() {
        let edges = parse_bucket_edges(DEFAULT_BUCKET_EDGES, DEFAULT_BUCKET_EDGES);
        assert_eq!(bucket_label(-7.0, &edges).unwrap(), "[-10,-5]");
        assert_eq!(bucket_label(0.0, &edges).unwrap(), "[-5,0]");
        assert_eq!(bucket_label(-30.0, &edges).unwrap(), "<-inf,-20]");
        assert_eq!(bucket_label(45.0, &edges).unwrap(), "[20,+inf)");
    }

    #[test]
    fn midpoints_only_for_finite_labels() {
        assert_eq!(bucket_midpoint("[-10,-5]"), Some(-7.5));
        assert_eq!(bucket_midpoint("<-inf,-20]"), None);
        assert_eq!(bucket_midpoint("[20,+inf)"), None);
    }
}
