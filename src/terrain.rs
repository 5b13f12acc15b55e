//! Terrain file loading, parsing, and validation.
//!
//! The terrain file is line-oriented; the engine consumes three markers:
//!
//! ```text
//! # stats: terrain=1000000.0m^2 ...
//! # node coords: 1 [250.0 300.0] 2 [700.5 120.3] ...
//! # gateway coords: A [500.0 500.0] B [900.0 100.0] ...
//! ```
//!
//! Node identifiers are numeric, gateway identifiers are letter sequences
//! (`A` .. `Z`, `AA` ..). The terrain side derives as the square root of the
//! `terrain=` area. Everything else in the file is ignored.

use anyhow::Context;
use std::fs;

use crate::simulation::types::Position;

/// Error type for terrain loading failures.
#[derive(Debug)]
pub enum TerrainLoadError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for TerrainLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerrainLoadError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            TerrainLoadError::ParseError(msg) => write!(f, "Failed to parse terrain: {}", msg),
            TerrainLoadError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for TerrainLoadError {}

/// Parsed terrain: the square world plus the fixed population.
pub struct Terrain {
    /// Side of the square terrain in metres.
    pub side_m: f64,
    pub nodes: Vec<(u32, Position)>,
    pub gateways: Vec<(String, Position)>,
}

/// Load and parse a terrain file.
pub fn load_terrain(path: &str) -> Result<Terrain, TerrainLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| TerrainLoadError::FileReadError(e.to_string()))?;
    let terrain = parse_terrain(&data)?;
    validate_terrain(&terrain).map_err(TerrainLoadError::ValidationError)?;
    Ok(terrain)
}

/// Parse terrain markers out of the file contents.
pub fn parse_terrain(data: &str) -> Result<Terrain, TerrainLoadError> {
    let mut side_m: Option<f64> = None;
    let mut nodes: Vec<(u32, Position)> = Vec::new();
    let mut gateways: Vec<(String, Position)> = Vec::new();

    for line in data.lines() {
        if let Some(rest) = line.strip_prefix("# stats:") {
            for token in rest.split_whitespace() {
                if let Some(area) = token.strip_prefix("terrain=") {
                    let area = area.trim_end_matches("m^2");
                    let area: f64 = area.parse().map_err(|_| TerrainLoadError::ParseError(format!("invalid terrain area '{}'", token)))?;
                    if area <= 0.0 {
                        return Err(TerrainLoadError::ParseError(format!("non-positive terrain area '{}'", token)));
                    }
                    side_m = Some(area.sqrt());
                }
            }
        } else if let Some(rest) = line.strip_prefix("# node coords:") {
            for (id, pos) in parse_coord_list(rest)? {
                let id: u32 = id.parse().map_err(|_| TerrainLoadError::ParseError(format!("invalid node id '{}'", id)))?;
                nodes.push((id, pos));
            }
        } else if let Some(rest) = line.strip_prefix("# gateway coords:") {
            for (id, pos) in parse_coord_list(rest)? {
                if id.is_empty() || !id.bytes().all(|b| b.is_ascii_uppercase()) {
                    return Err(TerrainLoadError::ParseError(format!("invalid gateway id '{}'", id)));
                }
                gateways.push((id, pos));
            }
        }
    }

    let side_m = side_m.ok_or_else(|| TerrainLoadError::ParseError("missing '# stats: terrain=' marker".to_string()))?;
    Ok(Terrain { side_m, nodes, gateways })
}

/// Parse a `<id> [<x> <y>]` repetition.
fn parse_coord_list(rest: &str) -> Result<Vec<(String, Position)>, TerrainLoadError> {
    let mut out = Vec::new();
    let mut tokens = rest.split_whitespace();
    while let Some(id) = tokens.next() {
        let x_tok = tokens
            .next()
            .ok_or_else(|| TerrainLoadError::ParseError(format!("missing coordinates after id '{}'", id)))?;
        let y_tok = tokens
            .next()
            .ok_or_else(|| TerrainLoadError::ParseError(format!("missing y coordinate after id '{}'", id)))?;
        let x_str = x_tok
            .strip_prefix('[')
            .ok_or_else(|| TerrainLoadError::ParseError(format!("expected '[x' after id '{}', got '{}'", id, x_tok)))?;
        let y_str = y_tok
            .strip_suffix(']')
            .ok_or_else(|| TerrainLoadError::ParseError(format!("expected 'y]' after id '{}', got '{}'", id, y_tok)))?;
        let x: f64 = x_str.parse().map_err(|_| TerrainLoadError::ParseError(format!("invalid x coordinate '{}'", x_tok)))?;
        let y: f64 = y_str.parse().map_err(|_| TerrainLoadError::ParseError(format!("invalid y coordinate '{}'", y_tok)))?;
        out.push((id.to_string(), Position { x, y }));
    }
    Ok(out)
}

/// Reject terrains the engine cannot simulate.
fn validate_terrain(terrain: &Terrain) -> Result<(), String> {
    if terrain.nodes.is_empty() {
        return Err("terrain must contain at least one node".to_string());
    }
    if terrain.gateways.is_empty() {
        return Err("terrain must contain at least one gateway".to_string());
    }

    let mut node_ids = std::collections::HashSet::new();
    for (id, pos) in &terrain.nodes {
        if !node_ids.insert(*id) {
            return Err(format!("duplicate node id {}", id));
        }
        if pos.x < 0.0 || pos.y < 0.0 {
            return Err(format!("node {} has a negative coordinate ({}, {})", id, pos.x, pos.y));
        }
        if pos.x > terrain.side_m || pos.y > terrain.side_m {
            log::warn!("node {} at ({:.1}, {:.1}) lies outside the {:.1} m terrain side", id, pos.x, pos.y, terrain.side_m);
        }
    }

    let mut gw_ids = std::collections::HashSet::new();
    for (id, pos) in &terrain.gateways {
        if !gw_ids.insert(id.clone()) {
            return Err(format!("duplicate gateway id {}", id));
        }
        if pos.x < 0.0 || pos.y < 0.0 {
            return Err(format!("gateway {} has a negative coordinate ({}, {})", id, pos.x, pos.y));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# generated by terrain_gen
# stats: terrain=1000000.0m^2 nodes=2 gateways=1
# node coords: 1 [250.0 300.0] 2 [700.5 120.3]
# gateway coords: A [500.0 500.0]
some trailing noise the parser ignores
";

    #[test]
    fn parses_all_three_markers() {
        let t = parse_terrain(SAMPLE).unwrap();
        assert!((t.side_m - 1000.0).abs() < 1e-9);
        assert_eq!(t.nodes.len(), 2);
        assert_eq!(t.nodes[1].0, 2);
        assert!((t.nodes[1].1.x - 700.5).abs() < 1e-9);
        assert_eq!(t.gateways.len(), 1);
        assert_eq!(t.gateways[0].0, "A");
        assert!((t.gateways[0].1.y - 500.0).abs() < 1e-9);
    }

    #[test]
    fn missing_stats_marker_is_a_parse_error() {
        let data = "# node coords: 1 [1.0 1.0]\n# gateway coords: A [2.0 2.0]\n";
        assert!(matches!(parse_terrain(data), Err(TerrainLoadError::ParseError(_))));
    }

    #[test]
    fn malformed_coordinates_are_rejected() {
        let data = "# stats: terrain=100.0m^2\n# node coords: 1 [1.0\n# gateway coords: A [2.0 2.0]\n";
        assert!(matches!(parse_terrain(data), Err(TerrainLoadError::ParseError(_))));
        let data = "# stats: terrain=100.0m^2\n# node coords: 1 1.0 1.0]\n# gateway coords: A [2.0 2.0]\n";
        assert!(matches!(parse_terrain(data), Err(TerrainLoadError::ParseError(_))));
    }

    #[test]
    fn lowercase_gateway_ids_are_rejected() {
        let data = "# stats: terrain=100.0m^2\n# node coords: 1 [1.0 1.0]\n# gateway coords: a [2.0 2.0]\n";
        assert!(matches!(parse_terrain(data), Err(TerrainLoadError::ParseError(_))));
    }

    #[test]
    fn validation_needs_nodes_and_gateways() {
        let t = parse_terrain("# stats: terrain=100.0m^2\n# node coords: 1 [1.0 1.0]\n").unwrap();
        assert!(validate_terrain(&t).is_err());
        let t = parse_terrain("# stats: terrain=100.0m^2\n# gateway coords: A [2.0 2.0]\n").unwrap();
        assert!(validate_terrain(&t).is_err());
    }

    #[test]
    fn duplicate_ids_fail_validation() {
        let t = parse_terrain("# stats: terrain=100.0m^2\n# node coords: 1 [1.0 1.0] 1 [2.0 2.0]\n# gateway coords: A [2.0 2.0]\n").unwrap();
        assert!(validate_terrain(&t).is_err());
        let t = parse_terrain("# stats: terrain=100.0m^2\n# node coords: 1 [1.0 1.0]\n# gateway coords: A [2.0 2.0] A [3.0 3.0]\n").unwrap();
        assert!(validate_terrain(&t).is_err());
    }

    #[test]
    fn multi_letter_gateway_ids_parse() {
        let t = parse_terrain("# stats: terrain=100.0m^2\n# node coords: 1 [1.0 1.0]\n# gateway coords: AA [2.0 2.0] AB [3.0 3.0]\n").unwrap();
        assert_eq!(t.gateways[0].0, "AA");
        assert_eq!(t.gateways[1].0, "AB");
    }
}
