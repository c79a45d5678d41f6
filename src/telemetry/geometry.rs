//! Lazy parsing of the simulator's network-file topology: lane→edge and
//! edge→lanes maps, plus the node/edge geometry used for the dashboard's
//! first WebSocket frame. Parsed once per net-file path and cached — the
//! same lazy-resolution contract the Analysis Worker relies on for its own
//! (separately cached) copy of the same topology.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeGeom {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EdgeGeom {
    pub id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkTopology {
    pub nodes: Vec<NodeGeom>,
    pub edges: Vec<EdgeGeom>,
    pub lane_to_edge: BTreeMap<String, String>,
    pub edge_to_lanes: BTreeMap<String, Vec<String>>,
}

/// Parses a SUMO-style network XML file into the topology this system
/// needs. Any lane or edge element missing an attribute is skipped rather
/// than failing the whole parse — partial topology is still useful.
pub fn parse_network_file(path: &str) -> Result<NetworkTopology> {
    let bytes = std::fs::read(path).with_context(|| format!("reading net file {path}"))?;
    let mut reader = Reader::from_reader(bytes.as_slice());
    reader.trim_text(true);

    let mut topology = NetworkTopology::default();
    let mut current_edge: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name();
                let local = String::from_utf8_lossy(name.as_ref()).to_string();
                let attrs = attrs_map(&e);
                match local.as_str() {
                    "junction" => {
                        if let (Some(id), Some(x), Some(y)) =
                            (attrs.get("id"), attrs.get("x"), attrs.get("y"))
                        {
                            if let (Ok(x), Ok(y)) = (x.parse(), y.parse()) {
                                topology.nodes.push(NodeGeom { id: id.clone(), x, y });
                            }
                        }
                    }
                    "edge" => {
                        if let Some(id) = attrs.get("id") {
                            // Internal junction edges start with ':' and carry no
                            // from/to pair worth surfacing on the map.
                            if !id.starts_with(':') {
                                topology.edges.push(EdgeGeom {
                                    id: id.clone(),
                                    from: attrs.get("from").cloned().unwrap_or_default(),
                                    to: attrs.get("to").cloned().unwrap_or_default(),
                                });
                            }
                            current_edge = Some(id.clone());
                        }
                    }
                    "lane" => {
                        if let (Some(id), Some(edge_id)) = (attrs.get("id"), current_edge.as_ref()) {
                            topology.lane_to_edge.insert(id.clone(), edge_id.clone());
                            topology
                                .edge_to_lanes
                                .entry(edge_id.clone())
                                .or_default()
                                .push(id.clone());
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.name().as_ref() == b"edge" {
                    current_edge = None;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "net file parse error, stopping early with partial topology");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(topology)
}

fn attrs_map(e: &quick_xml::events::BytesStart) -> BTreeMap<String, String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .filter_map(|a| {
            let key = String::from_utf8_lossy(a.key.as_ref()).to_string();
            let value = a.unescape_value().ok()?.to_string();
            Some((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_junctions_edges_and_lanes() {
        let xml = r#"<net>
            <junction id="J1" x="0.0" y="0.0" type="priority"/>
            <junction id="J2" x="100.0" y="0.0" type="priority"/>
            <edge id="E1" from="J1" to="J2">
                <lane id="E1_0" index="0"/>
                <lane id="E1_1" index="1"/>
            </edge>
            <edge id=":J1_0" function="internal">
                <lane id=":J1_0_0" index="0"/>
            </edge>
        </net>"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.xml");
        std::fs::write(&path, xml).unwrap();

        let topo = parse_network_file(path.to_str().unwrap()).unwrap();
        assert_eq!(topo.nodes.len(), 2);
        assert_eq!(topo.edges.len(), 1);
        assert_eq!(topo.edge_to_lanes.get("E1").unwrap().len(), 2);
        assert_eq!(topo.lane_to_edge.get("E1_0"), Some(&"E1".to_string()));
        // internal edges are excluded from the surfaced edge list but their
        // lanes still resolve for occupancy aggregation purposes
        assert_eq!(topo.lane_to_edge.get(":J1_0_0"), Some(&":J1_0".to_string()));
    }
}
